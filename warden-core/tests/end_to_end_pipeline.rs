//! Exercises the compiled Step graph the way the dispatcher does: config ->
//! `Environment` -> `Workflow` -> repeated `run(&mut entry)`, across
//! several of the `Filter`/`Action` modules at once rather than in
//! isolation.

use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde_json::json;

use warden_core::{Entry, EntryValue, Environment, WorkflowBuilder, REALTIME_TIMESTAMP};

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn entry_at(secs: i64, fields: &[(&str, EntryValue)]) -> Entry {
    let mut entry = Entry::new();
    entry.insert(REALTIME_TIMESTAMP.to_string(), EntryValue::Timestamp(ts(secs)));
    for (k, v) in fields {
        entry.insert(k.to_string(), v.clone());
    }
    entry
}

fn environment(storage: &std::path::Path) -> Rc<Environment> {
    let config: warden_config::Config = serde_json::from_value(json!({
        "storage": storage,
        "actions": {},
    }))
    .unwrap();
    Rc::new(Environment::from_config(&config))
}

/// A filter gate in front of a counter raise: entries that don't match
/// `equals` never touch the counter, and three matching entries in a row
/// bring the saved count to 3.
#[test]
fn filtered_counter_raise_only_counts_matching_entries() {
    let dir = tempfile::tempdir().unwrap();
    let env = environment(dir.path());
    let chains = vec![(
        "main".to_string(),
        vec![
            serde_json::from_value(json!({
                "filter": "equals",
                "args": {"field": "unit", "value": "auth"},
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "action": "counterRaise",
                "args": {"counter": "failures", "for": "user", "save": "count"},
            }))
            .unwrap(),
        ],
    )];
    let workflow = WorkflowBuilder::new(Rc::clone(&env), &chains).build().unwrap();

    let mut unrelated = entry_at(0, &[("unit", EntryValue::from("cron")), ("user", EntryValue::from("alice"))]);
    workflow.run(&mut unrelated);
    assert_eq!(unrelated.get("count"), None);

    for t in 0..3 {
        let mut matching = entry_at(t, &[("unit", EntryValue::from("auth")), ("user", EntryValue::from("alice"))]);
        workflow.run(&mut matching);
        if t == 2 {
            assert_eq!(matching.get("count"), Some(&EntryValue::Int(3)));
        }
    }
}

/// A three-step chain — match, ban, log — produces a persisted ban record
/// reachable only through the compiled graph, not by calling `BanStore`
/// directly.
#[test]
fn match_then_ban_persists_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let env = environment(dir.path());
    let chains = vec![(
        "main".to_string(),
        vec![
            serde_json::from_value(json!({
                "filter": "inNetworks",
                "args": {"field": "ip", "nets": ["10.0.0.0/8"]},
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "action": "nftBan",
                "args": {"IP": "ip", "nftSetIPv4": "I4", "nftSetIPv6": "I6", "banSeconds": 300},
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "action": "log",
                "args": {"message": "banned {ip}", "priority": "WARNING"},
            }))
            .unwrap(),
        ],
    )];
    let workflow = WorkflowBuilder::new(Rc::clone(&env), &chains).build().unwrap();

    let mut entry = entry_at(0, &[("ip", EntryValue::from("10.1.2.3"))]);
    workflow.run(&mut entry);

    let state_path = dir.path().join("nftBan.json");
    let text = std::fs::read_to_string(state_path).unwrap();
    assert!(text.contains("10.1.2.3"));
    assert!(text.contains("\"nfSet\":\"I4\""));

    // outside the configured network: no ban recorded, filter routes to
    // the dangling `alt` (no `else` configured) and traversal ends there.
    let mut outside = entry_at(1, &[("ip", EntryValue::from("172.16.0.1"))]);
    workflow.run(&mut outside);
    let text_after = std::fs::read_to_string(dir.path().join("nftBan.json")).unwrap();
    assert_eq!(text, text_after);
}

/// dnatCapture in one chain, dnatReplace in a later fall-through chain:
/// the replacement fields only appear once the capture has actually run.
#[test]
fn capture_chain_then_replace_chain_via_fallthrough() {
    let dir = tempfile::tempdir().unwrap();
    let env = environment(dir.path());
    let chains = vec![
        (
            "capture".to_string(),
            vec![serde_json::from_value(json!({
                "action": "dnatCapture",
                "args": {"saddr": "saddr", "addr": "addr"},
            }))
            .unwrap()],
        ),
        (
            "replace".to_string(),
            vec![serde_json::from_value(json!({
                "action": "dnatReplace",
                "args": {"addr": "addr", "saddrInto": "origin"},
            }))
            .unwrap()],
        ),
    ];
    let workflow = WorkflowBuilder::new(Rc::clone(&env), &chains).build().unwrap();

    let mut first = entry_at(0, &[("saddr", EntryValue::from("192.168.0.9")), ("addr", EntryValue::from("5.6.7.8"))]);
    workflow.run(&mut first);
    assert_eq!(first.get("origin"), Some(&EntryValue::from("192.168.0.9")));
}

use std::fmt;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One persisted ban record. `timestamp == 0` means permanent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ban {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "nfSet")]
    pub set_name: String,
    pub timestamp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum BanError {
    #[error("failed to write ban state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Firewall command driver: builds and runs the add/delete-element
/// commands for one backend. Subprocess failures are logged and
/// swallowed — a broken firewall CLI must not halt the pipeline, so these
/// methods deliberately do not return `Result`.
pub trait BanDriver: fmt::Debug {
    fn set_ban(&self, set_name: &str, ip: &str, seconds: i64);
    fn cancel_ban(&self, set_name: &str, ip: &str);
}

fn run_logged(argv: &[String]) {
    let Some((program, args)) = argv.split_first() else {
        return;
    };
    match Command::new(program).args(args).output() {
        Ok(output) if !output.status.success() => {
            warn!(
                argv = ?argv,
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "firewall command exited non-zero"
            );
        }
        Ok(_) => {}
        Err(source) => warn!(argv = ?argv, %source, "failed to spawn firewall command"),
    }
}

/// `nft`-style driver: `add element <set> {<ip>[ timeout <n>s]}` /
/// `delete element <set> {<ip>}`.
#[derive(Debug)]
pub struct NftDriver {
    pub argv: Vec<String>,
}

impl BanDriver for NftDriver {
    fn set_ban(&self, set_name: &str, ip: &str, seconds: i64) {
        let mut argv = self.argv.clone();
        argv.push("add".into());
        argv.push("element".into());
        argv.push(set_name.into());
        if seconds > 0 {
            argv.push(format!("{{{ip} timeout {seconds}s}}"));
        } else {
            argv.push(format!("{{{ip}}}"));
        }
        run_logged(&argv);
    }

    fn cancel_ban(&self, set_name: &str, ip: &str) {
        let mut argv = self.argv.clone();
        argv.push("delete".into());
        argv.push("element".into());
        argv.push(set_name.into());
        argv.push(format!("{{{ip}}}"));
        run_logged(&argv);
    }
}

/// `ipset`-style driver: `add <set> <ip> [timeout <n>]` / `del <set>
/// <ip>`.
#[derive(Debug)]
pub struct IpsetDriver {
    pub argv: Vec<String>,
}

impl BanDriver for IpsetDriver {
    fn set_ban(&self, set_name: &str, ip: &str, seconds: i64) {
        let mut argv = self.argv.clone();
        argv.push("add".into());
        argv.push(set_name.into());
        argv.push(ip.into());
        if seconds > 0 {
            argv.push("timeout".into());
            argv.push(seconds.to_string());
        }
        run_logged(&argv);
    }

    fn cancel_ban(&self, set_name: &str, ip: &str) {
        let mut argv = self.argv.clone();
        argv.push("del".into());
        argv.push(set_name.into());
        argv.push(ip.into());
        run_logged(&argv);
    }
}

/// Persistent set of active bans for one driver, full-rewrite on every
/// change.
#[derive(Debug)]
pub struct BanStore<D: BanDriver> {
    path: PathBuf,
    driver: D,
}

impl<D: BanDriver> BanStore<D> {
    pub fn new(path: PathBuf, driver: D) -> Self {
        BanStore { path, driver }
    }

    /// Read failures (including a missing file on first run) are treated
    /// as empty state with a log line.
    fn read(&self) -> Vec<Ban> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|source| {
                warn!(path = %self.path.display(), %source, "malformed ban state file, treating as empty");
                Vec::new()
            }),
            Err(source) => {
                if source.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), %source, "failed to read ban state file, treating as empty");
                }
                Vec::new()
            }
        }
    }

    fn write(&self, bans: &[Ban]) -> Result<(), BanError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| BanError::Write {
            path: self.path.clone(),
            source,
        })?;
        let body = serde_json::to_string(bans).expect("Vec<Ban> always serializes");
        tmp.write_all(body.as_bytes())
            .map_err(|source| BanError::Write {
                path: self.path.clone(),
                source,
            })?;
        tmp.persist(&self.path).map_err(|e| BanError::Write {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Ban or re-ban `ip` under the set named by `ipv4_set`/`ipv6_set`
    /// (chosen by `:` in the address). Drops expired records, re-bans the
    /// same `(ip, set)` by cancel-then-set, appends the new record, and
    /// rewrites the file.
    pub fn act(
        &self,
        ip: &str,
        ipv4_set: &str,
        ipv6_set: &str,
        ban_seconds: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), BanError> {
        let set_name = if ip.contains(':') { ipv6_set } else { ipv4_set };
        let now_ts = now.timestamp();

        let mut kept = Vec::new();
        let mut previous_ts = None;
        for ban in self.read() {
            let expired = ban.timestamp > 0 && ban.timestamp <= now_ts;
            if expired {
                continue;
            }
            if ban.ip == ip && ban.set_name == set_name {
                previous_ts = Some(ban.timestamp);
                continue;
            }
            kept.push(ban);
        }

        if previous_ts.is_some() {
            self.driver.cancel_ban(set_name, ip);
        }

        let new_expiry = ban_seconds.map(|s| now_ts + s).unwrap_or(0);
        let seconds_for_driver = ban_seconds.unwrap_or(0);
        self.driver.set_ban(set_name, ip, seconds_for_driver);

        kept.push(Ban {
            ip: ip.to_string(),
            set_name: set_name.to_string(),
            timestamp: new_expiry,
        });
        self.write(&kept)
    }

    /// Restore firewall state after a restart: drop expired records,
    /// re-apply the rest, rewrite the file.
    pub fn boot(&self, now: DateTime<Utc>) -> Result<(), BanError> {
        let now_ts = now.timestamp();
        let mut surviving = Vec::new();
        for ban in self.read() {
            if ban.timestamp > 0 && ban.timestamp <= now_ts {
                continue;
            }
            let seconds = if ban.timestamp == 0 {
                0
            } else {
                ban.timestamp - now_ts
            };
            self.driver.set_ban(&ban.set_name, &ban.ip, seconds);
            surviving.push(ban);
        }
        self.write(&surviving)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Default)]
    struct RecordingDriver {
        calls: RefCell<Vec<String>>,
    }

    impl BanDriver for RecordingDriver {
        fn set_ban(&self, set_name: &str, ip: &str, seconds: i64) {
            self.calls
                .borrow_mut()
                .push(format!("set {set_name} {ip} {seconds}"));
        }
        fn cancel_ban(&self, set_name: &str, ip: &str) {
            self.calls
                .borrow_mut()
                .push(format!("cancel {set_name} {ip}"));
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn first_ban_adds_permanent_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nft.json");
        let store = BanStore::new(path.clone(), RecordingDriver::default());
        store.act("10.0.0.1", "I4", "I6", None, t(0)).unwrap();
        let bans: Vec<Ban> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            bans,
            vec![Ban {
                ip: "10.0.0.1".into(),
                set_name: "I4".into(),
                timestamp: 0,
            }]
        );
        assert_eq!(store.driver.calls.borrow().as_slice(), ["set I4 10.0.0.1 0"]);
    }

    #[test]
    fn reban_same_ip_issues_delete_then_add_with_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nft.json");
        let store = BanStore::new(path.clone(), RecordingDriver::default());
        store.act("10.0.0.1", "I4", "I6", Some(60), t(0)).unwrap();
        store.act("10.0.0.1", "I4", "I6", Some(60), t(1)).unwrap();
        let bans: Vec<Ban> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(
            store.driver.calls.borrow().as_slice(),
            [
                "set I4 10.0.0.1 60",
                "cancel I4 10.0.0.1",
                "set I4 10.0.0.1 60"
            ]
        );
    }

    #[test]
    fn boot_drops_expired_and_reapplies_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nft.json");
        fs::write(
            &path,
            serde_json::to_string(&vec![
                Ban {
                    ip: "1.1.1.1".into(),
                    set_name: "I4".into(),
                    timestamp: 50,
                },
                Ban {
                    ip: "2.2.2.2".into(),
                    set_name: "I4".into(),
                    timestamp: 0,
                },
            ])
            .unwrap(),
        )
        .unwrap();
        let store = BanStore::new(path.clone(), RecordingDriver::default());
        store.boot(t(100)).unwrap();
        let bans: Vec<Ban> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].ip, "2.2.2.2");
        assert_eq!(
            store.driver.calls.borrow().as_slice(),
            ["set I4 2.2.2.2 0"]
        );
    }
}

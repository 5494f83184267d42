use std::rc::Rc;

use chrono::Duration;
use serde_json::{Map, Value};
use tracing::Level as LogLevel;

use crate::dnat::{FieldSource, MatchField, Mapper, Matcher};
use crate::entry::{realtime_timestamp, render_template, Entry, EntryValue};
use crate::environment::Environment;
use crate::report::ReportRecord;
use crate::step::{ActionStep, StepError};

fn arg_str(args: &Map<String, Value>, key: &str) -> Result<String, StepError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StepError::new(format!("missing required string arg `{key}`")))
}

fn arg_str_opt(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn arg_u32_opt(args: &Map<String, Value>, key: &str) -> Option<u32> {
    args.get(key).and_then(Value::as_u64).map(|v| v as u32)
}

fn arg_i64_opt(args: &Map<String, Value>, key: &str) -> Option<i64> {
    args.get(key).and_then(Value::as_i64)
}

fn field_source(args: &Map<String, Value>, field_key: &str, value_key: &str) -> FieldSource {
    FieldSource::new(arg_str_opt(args, field_key), args.get(value_key).cloned())
}

/// `counterRaise`: augment or lower the named counter,
/// optionally saving the resulting count into the entry.
#[derive(Debug)]
pub struct CounterRaise {
    env: Rc<Environment>,
    counter: String,
    for_field: String,
    save: Option<String>,
    keep_seconds: Option<u32>,
    lower: bool,
}

impl CounterRaise {
    pub fn from_args(env: Rc<Environment>, args: &Map<String, Value>) -> Result<Self, StepError> {
        Ok(CounterRaise {
            env,
            counter: arg_str(args, "counter")?,
            for_field: arg_str(args, "for")?,
            save: arg_str_opt(args, "save"),
            keep_seconds: arg_u32_opt(args, "keepSeconds"),
            lower: args.get("lower").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

impl ActionStep for CounterRaise {
    fn act(&self, entry: &mut Entry) -> Result<(), StepError> {
        let now = realtime_timestamp(entry)
            .ok_or_else(|| StepError::new("counterRaise requires __REALTIME_TIMESTAMP"))?;
        let key = entry
            .get(&self.for_field)
            .map(|v| v.as_display())
            .ok_or_else(|| StepError::new(format!("counterRaise: missing field {}", self.for_field)))?;
        let mut counters = self.env.counters.borrow_mut();
        let count = if self.lower {
            counters.lower(&self.counter, &key, now)
        } else {
            let duration = self.keep_seconds.map(|s| Duration::seconds(s as i64));
            counters.augment(&self.counter, &key, duration, now)
        };
        if let Some(save) = &self.save {
            entry.insert(save.clone(), EntryValue::Int(count));
        }
        Ok(())
    }
}

/// `counterReset`: clears a counter's ticks, optionally starting a grace
/// period, and optionally saves the resulting count (always `0`) into the
/// entry.
#[derive(Debug)]
pub struct CounterReset {
    env: Rc<Environment>,
    counter: String,
    for_field: String,
    grace_seconds: Option<u32>,
    save: Option<String>,
}

impl CounterReset {
    pub fn from_args(env: Rc<Environment>, args: &Map<String, Value>) -> Result<Self, StepError> {
        Ok(CounterReset {
            env,
            counter: arg_str(args, "counter")?,
            for_field: arg_str(args, "for")?,
            grace_seconds: arg_u32_opt(args, "graceSeconds"),
            save: arg_str_opt(args, "save"),
        })
    }
}

impl ActionStep for CounterReset {
    fn act(&self, entry: &mut Entry) -> Result<(), StepError> {
        let now = realtime_timestamp(entry)
            .ok_or_else(|| StepError::new("counterReset requires __REALTIME_TIMESTAMP"))?;
        let key = entry
            .get(&self.for_field)
            .map(|v| v.as_display())
            .ok_or_else(|| StepError::new(format!("counterReset: missing field {}", self.for_field)))?;
        let grace = self.grace_seconds.map(|s| Duration::seconds(s as i64));
        self.env.counters.borrow_mut().reset(&self.counter, &key, grace, now);
        if let Some(save) = &self.save {
            entry.insert(save.clone(), EntryValue::Int(0));
        }
        Ok(())
    }
}

/// `dnatCapture`: records an observed NAT translation into the mapping cache.
#[derive(Debug)]
pub struct DnatCapture {
    env: Rc<Environment>,
    mapper: Mapper,
}

impl DnatCapture {
    pub fn from_args(env: Rc<Environment>, args: &Map<String, Value>) -> Result<Self, StepError> {
        let mapper = Mapper::new(
            field_source(args, "saddr", "saddrValue"),
            field_source(args, "sport", "sportValue"),
            field_source(args, "addr", "addrValue"),
            field_source(args, "port", "portValue"),
            field_source(args, "daddr", "daddrValue"),
            field_source(args, "dport", "dportValue"),
            arg_u32_opt(args, "keepSeconds"),
        )?;
        Ok(DnatCapture { env, mapper })
    }
}

impl ActionStep for DnatCapture {
    fn act(&self, entry: &mut Entry) -> Result<(), StepError> {
        let mut cache = self.env.mappings.borrow_mut();
        self.mapper.map(entry, &mut cache)
    }
}

/// `dnatReplace`: replays a previously captured translation onto an entry.
#[derive(Debug)]
pub struct DnatReplace {
    env: Rc<Environment>,
    matcher: Matcher,
}

impl DnatReplace {
    pub fn from_args(env: Rc<Environment>, args: &Map<String, Value>) -> Result<Self, StepError> {
        let mut match_fields = Vec::new();
        for (key, field) in [
            (MatchField::Addr, "addr"),
            (MatchField::Port, "port"),
            (MatchField::Daddr, "daddr"),
            (MatchField::Dport, "dport"),
        ] {
            if let Some(name) = arg_str_opt(args, field) {
                match_fields.push((key, name));
            }
        }
        let matcher = Matcher::new(
            match_fields,
            arg_str_opt(args, "saddrInto"),
            arg_str_opt(args, "sportInto"),
        )?;
        Ok(DnatReplace { env, matcher })
    }
}

impl ActionStep for DnatReplace {
    fn act(&self, entry: &mut Entry) -> Result<(), StepError> {
        let mut cache = self.env.mappings.borrow_mut();
        self.matcher.replace(entry, &mut cache)
    }
}

/// `email`: formats a template and submits via the mail
/// composer; subject defaults to the configured default.
#[derive(Debug)]
pub struct Email {
    env: Rc<Environment>,
    template: String,
    subject: Option<String>,
}

impl Email {
    pub fn from_args(env: Rc<Environment>, args: &Map<String, Value>) -> Result<Self, StepError> {
        Ok(Email {
            env,
            template: arg_str(args, "message")?,
            subject: arg_str_opt(args, "subject"),
        })
    }
}

impl ActionStep for Email {
    fn act(&self, entry: &mut Entry) -> Result<(), StepError> {
        let body = render_template(&self.template, entry);
        let subject = self.subject.clone().unwrap_or_else(|| self.env.email_subject.clone());
        self.env.mail.send(
            &self.env.email_from,
            &self.env.email_to,
            &subject,
            &body,
            None,
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum BanBackend {
    Nft,
    Ipset,
}

/// `nftBan` / `ipsetBan`: shared algorithm over the two
/// firewall backends.
#[derive(Debug)]
pub struct Ban {
    env: Rc<Environment>,
    backend: BanBackend,
    ip_field: String,
    ipv4_set: String,
    ipv6_set: String,
    ban_seconds: Option<i64>,
}

impl Ban {
    fn from_args(
        env: Rc<Environment>,
        args: &Map<String, Value>,
        backend: BanBackend,
    ) -> Result<Self, StepError> {
        Ok(Ban {
            env,
            backend,
            ip_field: arg_str(args, "IP")?,
            ipv4_set: arg_str(args, "nftSetIPv4").or_else(|_| arg_str(args, "ipv4Set"))?,
            ipv6_set: arg_str(args, "nftSetIPv6").or_else(|_| arg_str(args, "ipv6Set"))?,
            ban_seconds: arg_i64_opt(args, "banSeconds"),
        })
    }

    pub fn nft(env: Rc<Environment>, args: &Map<String, Value>) -> Result<Self, StepError> {
        Self::from_args(env, args, BanBackend::Nft)
    }

    pub fn ipset(env: Rc<Environment>, args: &Map<String, Value>) -> Result<Self, StepError> {
        Self::from_args(env, args, BanBackend::Ipset)
    }
}

impl ActionStep for Ban {
    fn act(&self, entry: &mut Entry) -> Result<(), StepError> {
        let now = realtime_timestamp(entry).ok_or_else(|| StepError::new("ban requires __REALTIME_TIMESTAMP"))?;
        let ip = entry
            .get(&self.ip_field)
            .map(|v| v.as_display())
            .ok_or_else(|| StepError::new(format!("ban: missing field {}", self.ip_field)))?;
        let result = match self.backend {
            BanBackend::Nft => self.env.nft_bans.borrow().act(
                &ip,
                &self.ipv4_set,
                &self.ipv6_set,
                self.ban_seconds,
                now,
            ),
            BanBackend::Ipset => self.env.ipset_bans.borrow().act(
                &ip,
                &self.ipv4_set,
                &self.ipv6_set,
                self.ban_seconds,
                now,
            ),
        };
        result.map_err(|e| StepError::new(e.to_string()))
    }
}

/// `log`: journal priority EMERG..DEBUG maps to 0..7;
/// collapsed onto `tracing`'s five levels since a real systemd-journal
/// sink (under the `systemd-journal` feature) restores the exact
/// numeric priority from the tracing metadata.
#[derive(Debug)]
pub struct Log {
    template: String,
    level: LogLevel,
}

impl Log {
    pub fn from_args(args: &Map<String, Value>) -> Result<Self, StepError> {
        let priority = arg_str_opt(args, "priority").unwrap_or_else(|| "INFO".to_string());
        let level = match priority.to_ascii_uppercase().as_str() {
            "EMERG" | "ALERT" | "CRIT" | "ERR" => LogLevel::ERROR,
            "WARNING" | "WARN" => LogLevel::WARN,
            "NOTICE" | "INFO" => LogLevel::INFO,
            "DEBUG" => LogLevel::DEBUG,
            _ => LogLevel::INFO,
        };
        Ok(Log {
            template: arg_str(args, "message")?,
            level,
        })
    }
}

impl ActionStep for Log {
    fn act(&self, entry: &mut Entry) -> Result<(), StepError> {
        let message = render_template(&self.template, entry);
        match self.level {
            LogLevel::ERROR => tracing::error!("{message}"),
            LogLevel::WARN => tracing::warn!("{message}"),
            LogLevel::INFO => tracing::info!("{message}"),
            LogLevel::DEBUG => tracing::debug!("{message}"),
            LogLevel::TRACE => tracing::trace!("{message}"),
        }
        Ok(())
    }
}

/// `dailyReport`: appends one record
/// to the report aggregator, formatting the template and resolving level
/// and detail mode from args.
#[derive(Debug)]
pub struct Report {
    env: Rc<Environment>,
    template: String,
    level: Option<String>,
    detail: Option<String>,
}

impl Report {
    pub fn from_args(env: Rc<Environment>, args: &Map<String, Value>) -> Result<Self, StepError> {
        Ok(Report {
            env,
            template: arg_str(args, "message")?,
            level: arg_str_opt(args, "level"),
            detail: arg_str_opt(args, "detail"),
        })
    }
}

impl ActionStep for Report {
    fn act(&self, entry: &mut Entry) -> Result<(), StepError> {
        let now = realtime_timestamp(entry).ok_or_else(|| StepError::new("report requires __REALTIME_TIMESTAMP"))?;
        let message = render_template(&self.template, entry);
        let record = ReportRecord::new(
            self.level.as_deref().unwrap_or(""),
            self.detail.as_deref(),
            message,
            now,
        );
        let local_hour = crate::report::local_hour_of(now);
        let env = Rc::clone(&self.env);
        self.env
            .report
            .borrow_mut()
            .record(record, local_hour, move |plain, html| {
                env.mail.send(&env.email_from, &env.email_to, &env.email_subject, plain, Some(html));
            })
            .map_err(|e| StepError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> Rc<Environment> {
        let dir = tempfile::tempdir().unwrap();
        let config: warden_config::Config = serde_json::from_value(json!({
            "storage": dir.path(),
            "actions": {},
        }))
        .unwrap();
        Rc::new(Environment::from_config(&config))
    }

    fn entry_now(fields: &[(&str, EntryValue)]) -> Entry {
        let mut entry = Entry::new();
        entry.insert(
            crate::entry::REALTIME_TIMESTAMP.to_string(),
            EntryValue::Timestamp(chrono::Utc::now()),
        );
        for (k, v) in fields {
            entry.insert(k.to_string(), v.clone());
        }
        entry
    }

    #[test]
    fn counter_reset_saves_zero_when_configured() {
        let env = env();
        let raise = CounterRaise::from_args(
            Rc::clone(&env),
            json!({"counter": "t", "for": "k"}).as_object().unwrap(),
        )
        .unwrap();
        let reset = CounterReset::from_args(
            Rc::clone(&env),
            json!({"counter": "t", "for": "k", "save": "c"}).as_object().unwrap(),
        )
        .unwrap();

        let mut entry = entry_now(&[("k", EntryValue::from("v"))]);
        raise.act(&mut entry).unwrap();
        reset.act(&mut entry).unwrap();
        assert_eq!(entry.get("c"), Some(&EntryValue::Int(0)));
    }
}

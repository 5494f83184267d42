use serde_json::Value;

use crate::entry::{realtime_timestamp, Entry, EntryValue};
use crate::step::StepError;

/// One observed NAT translation.
#[derive(Debug, Clone)]
pub struct Mapping {
    bucket_bits: u32,
    bucket: i64,
    saddr: String,
    sport: Option<i64>,
    addr: String,
    port: Option<i64>,
    daddr: Option<String>,
    dport: Option<i64>,
}

/// `⌈log2(keep_seconds + 1)⌉`, used so a record with window `keepSeconds`
/// survives at least that long under coarse bucket comparison.
fn bucket_bits_for(keep_seconds: u32) -> u32 {
    let mut bits = 0u32;
    while (1u64 << bits) < (keep_seconds as u64 + 1) {
        bits += 1;
    }
    bits
}

fn bucket_for(unix_seconds: i64, bits: u32) -> i64 {
    1 + (unix_seconds >> bits)
}

/// Process-wide sequence of [`Mapping`] records, pruned on every access.
#[derive(Debug, Default)]
pub struct MappingCache {
    records: Vec<Mapping>,
}

impl MappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self, now_unix: i64) {
        self.records
            .retain(|m| (now_unix >> m.bucket_bits) <= m.bucket);
    }

    fn push(&mut self, mapping: Mapping, now_unix: i64) {
        self.records.push(mapping);
        self.prune(now_unix);
    }
}

/// Resolves one mapped field: an entry field name, a fixed fallback value,
/// or neither (optional fields of [`Mapper`]).
#[derive(Debug, Clone)]
pub struct FieldSource {
    field: Option<String>,
    fixed: Option<Value>,
}

impl FieldSource {
    pub fn new(field: Option<String>, fixed: Option<Value>) -> Self {
        FieldSource { field, fixed }
    }

    fn resolve_str(&self, entry: &Entry) -> Option<String> {
        if let Some(field) = &self.field {
            if let Some(v) = entry.get(field) {
                return Some(v.as_display());
            }
        }
        self.fixed.as_ref().map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    fn resolve_i64(&self, entry: &Entry) -> Option<i64> {
        if let Some(field) = &self.field {
            if let Some(v) = entry.get(field) {
                return v.as_f64().map(|f| f as i64);
            }
        }
        self.fixed.as_ref().and_then(|v| v.as_i64())
    }
}

/// Captures an observed translation into the cache; the engine behind
/// the `dnatCapture` action.
#[derive(Debug)]
pub struct Mapper {
    saddr: FieldSource,
    sport: FieldSource,
    addr: FieldSource,
    port: FieldSource,
    daddr: FieldSource,
    dport: FieldSource,
    keep_seconds: u32,
    bucket_bits: u32,
}

impl Mapper {
    pub fn new(
        saddr: FieldSource,
        sport: FieldSource,
        addr: FieldSource,
        port: FieldSource,
        daddr: FieldSource,
        dport: FieldSource,
        keep_seconds: Option<u32>,
    ) -> Result<Self, StepError> {
        if saddr.field.is_none() && saddr.fixed.is_none() {
            return Err(StepError::new("dnatCapture requires saddr field or value"));
        }
        if addr.field.is_none() && addr.fixed.is_none() {
            return Err(StepError::new("dnatCapture requires addr field or value"));
        }
        let keep_seconds = keep_seconds.unwrap_or(63);
        Ok(Mapper {
            saddr,
            sport,
            addr,
            port,
            daddr,
            dport,
            keep_seconds,
            bucket_bits: bucket_bits_for(keep_seconds),
        })
    }

    pub fn map(&self, entry: &Entry, cache: &mut MappingCache) -> Result<(), StepError> {
        let now = realtime_timestamp(entry)
            .ok_or_else(|| StepError::new("dnatCapture requires __REALTIME_TIMESTAMP"))?
            .timestamp();
        let saddr = self
            .saddr
            .resolve_str(entry)
            .ok_or_else(|| StepError::new("dnatCapture: saddr unresolved"))?;
        let addr = self
            .addr
            .resolve_str(entry)
            .ok_or_else(|| StepError::new("dnatCapture: addr unresolved"))?;
        let mapping = Mapping {
            bucket_bits: self.bucket_bits,
            bucket: bucket_for(now, self.bucket_bits),
            saddr,
            sport: self.sport.resolve_i64(entry),
            addr,
            port: self.port.resolve_i64(entry),
            daddr: self.daddr.resolve_str(entry),
            dport: self.dport.resolve_i64(entry),
        };
        cache.push(mapping, now);
        Ok(())
    }

    pub fn keep_seconds(&self) -> u32 {
        self.keep_seconds
    }
}

/// Which mapping field a [`Matcher`] compares against, and where it writes
/// the translated value on a hit.
#[derive(Debug, Clone, Copy)]
pub enum MatchField {
    Addr,
    Port,
    Daddr,
    Dport,
}

/// Replays an observed translation back onto a later entry; the engine
/// behind the `dnatReplace` action.
#[derive(Debug)]
pub struct Matcher {
    match_fields: Vec<(MatchField, String)>,
    saddr_into: Option<String>,
    sport_into: Option<String>,
}

impl Matcher {
    pub fn new(
        match_fields: Vec<(MatchField, String)>,
        saddr_into: Option<String>,
        sport_into: Option<String>,
    ) -> Result<Self, StepError> {
        if match_fields.is_empty() {
            return Err(StepError::new("dnatReplace requires at least one match field"));
        }
        if saddr_into.is_none() && sport_into.is_none() {
            return Err(StepError::new(
                "dnatReplace requires at least one replacement field",
            ));
        }
        Ok(Matcher {
            match_fields,
            saddr_into,
            sport_into,
        })
    }

    pub fn replace(&self, entry: &mut Entry, cache: &mut MappingCache) -> Result<(), StepError> {
        let now = realtime_timestamp(entry)
            .ok_or_else(|| StepError::new("dnatReplace requires __REALTIME_TIMESTAMP"))?
            .timestamp();
        cache.prune(now);

        // A missing match field means "no match", not an error: the
        // original `dnat.Matcher.replace` returns silently and lets
        // traversal continue rather than aborting the entry.
        let mut wanted: Vec<(MatchField, String)> = Vec::with_capacity(self.match_fields.len());
        for (field, name) in &self.match_fields {
            let Some(value) = entry.get(name).map(|v| v.as_display()) else {
                return Ok(());
            };
            wanted.push((*field, value));
        }

        for mapping in &cache.records {
            let matches = wanted.iter().all(|(field, value)| {
                let candidate = match field {
                    MatchField::Addr => Some(mapping.addr.clone()),
                    MatchField::Port => mapping.port.map(|p| p.to_string()),
                    MatchField::Daddr => mapping.daddr.clone(),
                    MatchField::Dport => mapping.dport.map(|p| p.to_string()),
                };
                candidate.as_deref() == Some(value.as_str())
            });
            if matches {
                if let Some(into) = &self.saddr_into {
                    entry.insert(into.clone(), EntryValue::Str(mapping.saddr.clone()));
                }
                if let Some(into) = &self.sport_into {
                    if let Some(sport) = mapping.sport {
                        entry.insert(into.clone(), EntryValue::Int(sport));
                    }
                }
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn entry_at(secs: i64, fields: &[(&str, EntryValue)]) -> Entry {
        let mut e = Entry::new();
        e.insert(
            "__REALTIME_TIMESTAMP".to_string(),
            EntryValue::Timestamp(DateTime::<Utc>::from_timestamp(secs, 0).unwrap()),
        );
        for (k, v) in fields {
            e.insert(k.to_string(), v.clone());
        }
        e
    }

    #[test]
    fn capture_then_replace_copies_configured_fields() {
        let mapper = Mapper::new(
            FieldSource::new(Some("saddr".into()), None),
            FieldSource::new(Some("sport".into()), None),
            FieldSource::new(Some("addr".into()), None),
            FieldSource::new(Some("port".into()), None),
            FieldSource::new(None, None),
            FieldSource::new(None, None),
            Some(63),
        )
        .unwrap();
        let mut cache = MappingCache::new();
        let capture_entry = entry_at(
            1000,
            &[
                ("saddr", EntryValue::from("192.168.1.5")),
                ("sport", EntryValue::Int(4000)),
                ("addr", EntryValue::from("1.2.3.4")),
                ("port", EntryValue::Int(80)),
            ],
        );
        mapper.map(&capture_entry, &mut cache).unwrap();

        let matcher = Matcher::new(
            vec![(MatchField::Addr, "addr".into())],
            Some("saddrInto".into()),
            Some("sportInto".into()),
        )
        .unwrap();
        let mut replace_entry = entry_at(1001, &[("addr", EntryValue::from("1.2.3.4"))]);
        matcher.replace(&mut replace_entry, &mut cache).unwrap();

        assert_eq!(
            replace_entry.get("saddrInto"),
            Some(&EntryValue::from("192.168.1.5"))
        );
        assert_eq!(
            replace_entry.get("sportInto"),
            Some(&EntryValue::Int(4000))
        );
    }

    #[test]
    fn cache_prunes_old_buckets_on_access() {
        let mapper = Mapper::new(
            FieldSource::new(Some("saddr".into()), None),
            FieldSource::new(None, None),
            FieldSource::new(Some("addr".into()), None),
            FieldSource::new(None, None),
            FieldSource::new(None, None),
            FieldSource::new(None, None),
            Some(1),
        )
        .unwrap();
        assert_eq!(mapper.keep_seconds(), 1);
        let mut cache = MappingCache::new();
        let e1 = entry_at(
            0,
            &[("saddr", EntryValue::from("a")), ("addr", EntryValue::from("b"))],
        );
        mapper.map(&e1, &mut cache).unwrap();
        assert_eq!(cache.records.len(), 1);
        cache.prune(100_000);
        assert!(cache.records.is_empty());
    }

    #[test]
    fn replace_with_missing_match_field_is_a_silent_no_op() {
        let matcher = Matcher::new(
            vec![(MatchField::Addr, "addr".into())],
            Some("saddrInto".into()),
            None,
        )
        .unwrap();
        let mut cache = MappingCache::new();
        let mut entry = entry_at(0, &[]);
        // `addr` is absent: this must be treated as "no match", not an
        // error that would abort the entry's traversal.
        matcher.replace(&mut entry, &mut cache).unwrap();
        assert!(entry.get("saddrInto").is_none());
    }
}

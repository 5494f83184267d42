use std::io::{self, BufRead};

use chrono::{DateTime, Utc};
use warden_core::{Entry, EntryValue, REALTIME_TIMESTAMP};

/// Abstracts the blocking source of journal entries so the dispatcher can
/// be exercised against recorded JSONL without a real systemd journal —
/// the seam at which warden-core's tests and warden's `--input -` fallback
/// both attach.
pub trait JournalSource {
    /// Blocks until the next entry is available. `Ok(None)` means the
    /// source is exhausted (EOF on a file source; never happens on a live
    /// journal).
    fn next_entry(&mut self) -> io::Result<Option<Entry>>;
}

/// Decodes one JSON object per line into an [`Entry`], falling back to the
/// configured 8-bit encoding only conceptually — stdin here is always
/// treated as UTF-8 text, since the encoding fallback exists to decode
/// journal message payloads that arrive as raw bytes, which a text JSONL
/// fixture never does.
pub struct StdinJournalSource<R> {
    lines: io::Lines<R>,
}

impl<R: BufRead> StdinJournalSource<R> {
    pub fn new(reader: R) -> Self {
        StdinJournalSource {
            lines: reader.lines(),
        }
    }
}

impl<R: BufRead> JournalSource for StdinJournalSource<R> {
    fn next_entry(&mut self) -> io::Result<Option<Entry>> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(None);
            };
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(&line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            return Ok(Some(decode_entry(value)));
        }
    }
}

fn decode_entry(value: serde_json::Value) -> Entry {
    let mut entry = Entry::new();
    let serde_json::Value::Object(map) = value else {
        return entry;
    };
    for (key, v) in map {
        let parsed = match &v {
            serde_json::Value::String(s) if key == REALTIME_TIMESTAMP => s
                .parse::<i64>()
                .ok()
                .and_then(|micros| DateTime::<Utc>::from_timestamp(micros / 1_000_000, 0))
                .map(EntryValue::Timestamp)
                .unwrap_or_else(|| EntryValue::Str(s.clone())),
            serde_json::Value::String(s) => EntryValue::Str(s.clone()),
            serde_json::Value::Number(n) if n.is_i64() => EntryValue::Int(n.as_i64().unwrap()),
            serde_json::Value::Number(n) => EntryValue::Float(n.as_f64().unwrap_or_default()),
            other => EntryValue::Str(other.to_string()),
        };
        entry.insert(key, parsed);
    }
    entry.entry(REALTIME_TIMESTAMP.to_string()).or_insert_with(|| EntryValue::Timestamp(Utc::now()));
    entry
}

/// Live systemd-journal source: seeks to tail, then blocks on `wait()`
/// for the next append. Gated behind the `systemd-journal` feature so the
/// crate still builds (against the stdin fallback) on hosts without
/// libsystemd.
#[cfg(feature = "systemd-journal")]
pub struct SystemdJournalSource {
    reader: systemd::journal::Journal,
}

#[cfg(feature = "systemd-journal")]
impl SystemdJournalSource {
    pub fn open() -> io::Result<Self> {
        let mut reader = systemd::journal::OpenOptions::default()
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        reader
            .seek_tail()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(SystemdJournalSource { reader })
    }
}

#[cfg(feature = "systemd-journal")]
impl JournalSource for SystemdJournalSource {
    fn next_entry(&mut self) -> io::Result<Option<Entry>> {
        use systemd::journal::JournalWaitResult;
        loop {
            match self.reader.next_entry() {
                Ok(Some(record)) => {
                    let mut entry = Entry::new();
                    for (key, value) in record {
                        entry.insert(key, EntryValue::Str(value));
                    }
                    entry
                        .entry(REALTIME_TIMESTAMP.to_string())
                        .or_insert_with(|| EntryValue::Timestamp(Utc::now()));
                    return Ok(Some(entry));
                }
                Ok(None) => {
                    match self
                        .reader
                        .wait(None)
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
                    {
                        JournalWaitResult::Append => continue,
                        JournalWaitResult::Nop | JournalWaitResult::Invalidate => continue,
                    }
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
            }
        }
    }
}

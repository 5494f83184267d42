use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Reserved key carrying the journal entry's real-time timestamp.
pub const REALTIME_TIMESTAMP: &str = "__REALTIME_TIMESTAMP";

/// One value held in an [`Entry`]. Journal fields are strings, but filters
/// and actions also write back integers, floats, and timestamps (captured
/// regex groups, counter results, DNAT ports).
#[derive(Debug, Clone, PartialEq)]
pub enum EntryValue {
    Str(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

impl EntryValue {
    /// String rendering used by filters (pcre search subject, equality
    /// comparisons against string args) and by message-template
    /// substitution.
    pub fn as_display(&self) -> String {
        match self {
            EntryValue::Str(s) => s.clone(),
            EntryValue::Int(i) => i.to_string(),
            EntryValue::Float(f) => f.to_string(),
            EntryValue::Timestamp(t) => t.to_rfc3339(),
        }
    }

    /// Numeric coercion so `lowerOrEquals`/`greaterOrEquals` can compare an
    /// int field against a float arg and vice versa.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EntryValue::Int(i) => Some(*i as f64),
            EntryValue::Float(f) => Some(*f),
            EntryValue::Str(s) => s.parse::<f64>().ok(),
            EntryValue::Timestamp(t) => Some(t.timestamp() as f64),
        }
    }
}

impl fmt::Display for EntryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

impl From<&str> for EntryValue {
    fn from(s: &str) -> Self {
        EntryValue::Str(s.to_string())
    }
}

impl From<String> for EntryValue {
    fn from(s: String) -> Self {
        EntryValue::Str(s)
    }
}

impl From<i64> for EntryValue {
    fn from(i: i64) -> Self {
        EntryValue::Int(i)
    }
}

impl From<f64> for EntryValue {
    fn from(f: f64) -> Self {
        EntryValue::Float(f)
    }
}

/// A journal entry: a mutable mapping from field name to value, alive for
/// the duration of one traversal of the Step graph.
pub type Entry = BTreeMap<String, EntryValue>;

/// Read the real-time timestamp reserved field, if present and well-formed.
pub fn realtime_timestamp(entry: &Entry) -> Option<DateTime<Utc>> {
    match entry.get(REALTIME_TIMESTAMP) {
        Some(EntryValue::Timestamp(t)) => Some(*t),
        _ => None,
    }
}

/// Substitute `{name}`-style placeholders in a message template with entry
/// field values, leaving missing fields as an empty string.
pub fn render_template(template: &str, entry: &Entry) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i + 1..].find('}') {
                let name = &template[i + 1..i + 1 + end];
                let value = entry
                    .get(name)
                    .map(|v| v.as_display())
                    .unwrap_or_default();
                out.push_str(&value);
                i = i + 1 + end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_and_missing_fields() {
        let mut entry = Entry::new();
        entry.insert("user".to_string(), EntryValue::from("alice"));
        let out = render_template("login by {user} from {ip}", &entry);
        assert_eq!(out, "login by alice from ");
    }

    #[test]
    fn numeric_coercion_crosses_int_and_float() {
        assert_eq!(EntryValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(EntryValue::Float(3.5).as_f64(), Some(3.5));
    }
}

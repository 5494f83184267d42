use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use regex::Regex;
use serde_json::{Map, Value};

use crate::entry::{Entry, EntryValue};
use crate::step::{FilterStep, StepError};

fn arg_str(args: &Map<String, Value>, key: &str) -> Result<String, StepError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StepError::new(format!("missing required string arg `{key}`")))
}

fn arg_values(args: &Map<String, Value>) -> Vec<EntryValue> {
    if let Some(v) = args.get("value") {
        return vec![value_to_entry(v)];
    }
    args.get("values")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(value_to_entry).collect())
        .unwrap_or_default()
}

fn value_to_entry(v: &Value) -> EntryValue {
    match v {
        Value::String(s) => EntryValue::Str(s.clone()),
        Value::Number(n) if n.is_i64() => EntryValue::Int(n.as_i64().unwrap()),
        Value::Number(n) => EntryValue::Float(n.as_f64().unwrap_or_default()),
        other => EntryValue::Str(other.to_string()),
    }
}

/// `equals`: field present and equal to `value`.
#[derive(Debug)]
pub struct Equals {
    field: String,
    value: EntryValue,
}

impl Equals {
    pub fn from_args(args: &Map<String, Value>) -> Result<Self, StepError> {
        let field = arg_str(args, "field")?;
        let value = arg_values(args)
            .into_iter()
            .next()
            .ok_or_else(|| StepError::new("equals requires `value`"))?;
        Ok(Equals { field, value })
    }
}

impl FilterStep for Equals {
    fn evaluate(&self, entry: &mut Entry) -> Result<bool, StepError> {
        Ok(match entry.get(&self.field) {
            Some(v) => v.as_display() == self.value.as_display(),
            None => false,
        })
    }
}

/// `in`: field present and equal to one of `values`.
#[derive(Debug)]
pub struct In {
    field: String,
    values: Vec<EntryValue>,
}

impl In {
    pub fn from_args(args: &Map<String, Value>) -> Result<Self, StepError> {
        let field = arg_str(args, "field")?;
        let values = arg_values(args);
        if values.is_empty() {
            return Err(StepError::new("in requires `value`/`values`"));
        }
        Ok(In { field, values })
    }
}

impl FilterStep for In {
    fn evaluate(&self, entry: &mut Entry) -> Result<bool, StepError> {
        Ok(match entry.get(&self.field) {
            Some(v) => self.values.iter().any(|c| c.as_display() == v.as_display()),
            None => false,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Ordering {
    LowerOrEquals,
    GreaterOrEquals,
}

/// `lowerOrEquals` / `greaterOrEquals`: numeric comparison that must
/// cross int/float.
#[derive(Debug)]
pub struct Comparison {
    field: String,
    value: f64,
    ordering: Ordering,
}

impl Comparison {
    fn from_args(args: &Map<String, Value>, ordering: Ordering) -> Result<Self, StepError> {
        let field = arg_str(args, "field")?;
        let value = arg_values(args)
            .into_iter()
            .next()
            .and_then(|v| v.as_f64())
            .ok_or_else(|| StepError::new("comparison requires numeric `value`"))?;
        Ok(Comparison {
            field,
            value,
            ordering,
        })
    }

    pub fn lower_or_equals(args: &Map<String, Value>) -> Result<Self, StepError> {
        Self::from_args(args, Ordering::LowerOrEquals)
    }

    pub fn greater_or_equals(args: &Map<String, Value>) -> Result<Self, StepError> {
        Self::from_args(args, Ordering::GreaterOrEquals)
    }
}

impl FilterStep for Comparison {
    fn evaluate(&self, entry: &mut Entry) -> Result<bool, StepError> {
        let Some(field_value) = entry.get(&self.field).and_then(|v| v.as_f64()) else {
            return Ok(false);
        };
        Ok(match self.ordering {
            Ordering::LowerOrEquals => field_value <= self.value,
            Ordering::GreaterOrEquals => field_value >= self.value,
        })
    }
}

fn capture_groups(re: &Regex, caps: &regex::Captures, save: &[Option<String>], entry: &mut Entry) {
    for (i, name) in save.iter().enumerate() {
        if let Some(name) = name {
            if let Some(m) = caps.get(i + 1) {
                entry.insert(name.clone(), EntryValue::Str(m.as_str().to_string()));
            }
        }
    }
    for name in re.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            entry.insert(name.to_string(), EntryValue::Str(m.as_str().to_string()));
        }
    }
}

/// `pcre`: compiled once, searched against `entry[field]`.
#[derive(Debug)]
pub struct Pcre {
    field: String,
    re: Regex,
    save: Vec<Option<String>>,
}

impl Pcre {
    pub fn from_args(args: &Map<String, Value>) -> Result<Self, StepError> {
        let field = arg_str(args, "field")?;
        let pattern = arg_str(args, "re")?;
        let re = Regex::new(&pattern)
            .map_err(|e| StepError::new(format!("invalid pcre pattern `{pattern}`: {e}")))?;
        let save = args
            .get("save")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Pcre { field, re, save })
    }
}

impl FilterStep for Pcre {
    fn evaluate(&self, entry: &mut Entry) -> Result<bool, StepError> {
        let subject = entry
            .get(&self.field)
            .map(|v| v.as_display())
            .unwrap_or_default();
        match self.re.captures(&subject) {
            Some(caps) => {
                capture_groups(&self.re, &caps, &self.save, entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// `pcreAny`: first match in an ordered list of regexes.
#[derive(Debug)]
pub struct PcreAny {
    field: String,
    res: Vec<Regex>,
}

impl PcreAny {
    pub fn from_args(args: &Map<String, Value>) -> Result<Self, StepError> {
        let field = arg_str(args, "field")?;
        let patterns = args
            .get("res")
            .and_then(Value::as_array)
            .ok_or_else(|| StepError::new("pcreAny requires `res`"))?;
        let res = patterns
            .iter()
            .map(|p| {
                let pattern = p.as_str().unwrap_or_default();
                Regex::new(pattern)
                    .map_err(|e| StepError::new(format!("invalid pcreAny pattern `{pattern}`: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PcreAny { field, res })
    }
}

impl FilterStep for PcreAny {
    fn evaluate(&self, entry: &mut Entry) -> Result<bool, StepError> {
        let subject = entry
            .get(&self.field)
            .map(|v| v.as_display())
            .unwrap_or_default();
        for re in &self.res {
            if let Some(caps) = re.captures(&subject) {
                capture_groups(re, &caps, &[], entry);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// `inNetworks`: membership in a mixed IPv4/IPv6 CIDR list, parsed once
/// at construction.
#[derive(Debug)]
pub struct InNetworks {
    field: String,
    nets: Vec<IpNetwork>,
}

impl InNetworks {
    pub fn from_args(args: &Map<String, Value>) -> Result<Self, StepError> {
        let field = arg_str(args, "field")?;
        let raw_nets = args
            .get("nets")
            .and_then(Value::as_array)
            .ok_or_else(|| StepError::new("inNetworks requires `nets`"))?;
        let nets = raw_nets
            .iter()
            .map(|n| {
                let text = n.as_str().unwrap_or_default();
                text.parse::<IpNetwork>()
                    .map_err(|e| StepError::new(format!("invalid CIDR `{text}`: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InNetworks { field, nets })
    }
}

impl FilterStep for InNetworks {
    fn evaluate(&self, entry: &mut Entry) -> Result<bool, StepError> {
        let Some(field_value) = entry.get(&self.field).map(|v| v.as_display()) else {
            return Ok(false);
        };
        let is_v6 = field_value.contains(':');
        let matched = if is_v6 {
            field_value
                .parse::<Ipv6Addr>()
                .map(|ip| {
                    self.nets
                        .iter()
                        .any(|n| matches!(n, IpNetwork::V6(_)) && n.contains(ip.into()))
                })
                .unwrap_or(false)
        } else {
            field_value
                .parse::<Ipv4Addr>()
                .map(|ip| {
                    self.nets
                        .iter()
                        .any(|n| matches!(n, IpNetwork::V4(_)) && n.contains(ip.into()))
                })
                .unwrap_or(false)
        };
        Ok(matched)
    }
}

/// `userExists`: true iff `args.field`'s value names a local user. There is no libc binding in the dependency set, so this
/// parses `/etc/passwd` directly rather than reaching for a dedicated
/// crate for a single lookup.
#[derive(Debug)]
pub struct UserExists {
    field: String,
}

impl UserExists {
    pub fn from_args(args: &Map<String, Value>) -> Result<Self, StepError> {
        Ok(UserExists {
            field: arg_str(args, "field")?,
        })
    }

    fn local_user_exists(name: &str) -> bool {
        let Ok(text) = fs::read_to_string("/etc/passwd") else {
            return false;
        };
        text.lines()
            .filter_map(|line| line.split(':').next())
            .any(|candidate| candidate == name)
    }
}

impl FilterStep for UserExists {
    fn evaluate(&self, entry: &mut Entry) -> Result<bool, StepError> {
        let Some(name) = entry.get(&self.field).map(|v| v.as_display()) else {
            return Ok(false);
        };
        Ok(Self::local_user_exists(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(json: Value) -> Map<String, Value> {
        json.as_object().unwrap().clone()
    }

    fn entry_with(field: &str, value: &str) -> Entry {
        let mut e = Entry::new();
        e.insert(field.to_string(), EntryValue::from(value));
        e
    }

    #[test]
    fn equals_matches_and_handles_missing_field() {
        let f = Equals::from_args(&args(json!({"field": "k", "value": "v"}))).unwrap();
        let mut e = entry_with("k", "v");
        assert!(f.evaluate(&mut e).unwrap());
        let mut missing = Entry::new();
        assert!(!f.evaluate(&mut missing).unwrap());
    }

    #[test]
    fn comparison_crosses_int_and_float() {
        let f = Comparison::lower_or_equals(&args(json!({"field": "k", "value": 5.5}))).unwrap();
        let mut e = Entry::new();
        e.insert("k".to_string(), EntryValue::Int(5));
        assert!(f.evaluate(&mut e).unwrap());
    }

    #[test]
    fn pcre_captures_named_and_positional_groups() {
        let f = Pcre::from_args(&args(
            json!({"field": "msg", "re": r"user (?P<user>\w+) from (\w+)", "save": [null, "origin"]}),
        ))
        .unwrap();
        let mut e = entry_with("msg", "user alice from lab1");
        assert!(f.evaluate(&mut e).unwrap());
        assert_eq!(e.get("user"), Some(&EntryValue::from("alice")));
        assert_eq!(e.get("origin"), Some(&EntryValue::from("lab1")));
    }

    #[test]
    fn in_networks_matches_ipv4_and_ipv6_literal_scenario() {
        let f = InNetworks::from_args(&args(json!({
            "field": "ip",
            "nets": ["34.56.78.90/12", "2001:db8:1:1a0::/59"]
        })))
        .unwrap();

        let mut inside_v4 = entry_with("ip", "34.48.0.1");
        assert!(f.evaluate(&mut inside_v4).unwrap());

        let mut outside_v4 = entry_with("ip", "34.47.255.254");
        assert!(!f.evaluate(&mut outside_v4).unwrap());

        let mut inside_v6 = entry_with("ip", "2001:db8:1:1a0::1");
        assert!(f.evaluate(&mut inside_v6).unwrap());
    }
}

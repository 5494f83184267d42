use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Per-key state: a sorted sequence of tick expiries (`None` = infinite,
/// sorted last) and an optional grace-period end.
#[derive(Debug, Default, Clone)]
struct KeyState {
    ticks: Vec<Option<DateTime<Utc>>>,
    grace: Option<DateTime<Utc>>,
}

/// One named counter's key→state map.
#[derive(Debug, Default)]
struct CounterData {
    keys: HashMap<String, KeyState>,
}

impl CounterData {
    /// Purge expired ticks and expired grace for one key; delete the key
    /// entirely if nothing remains.
    fn purge(&mut self, key: &str, now: DateTime<Utc>) {
        let mut drop_key = false;
        if let Some(state) = self.keys.get_mut(key) {
            if let Some(g) = state.grace {
                if g <= now {
                    state.grace = None;
                }
            }
            state.ticks.retain(|t| match t {
                Some(ts) => *ts > now,
                None => true,
            });
            if state.ticks.is_empty() && state.grace.is_none() {
                drop_key = true;
            }
        }
        if drop_key {
            self.keys.remove(key);
        }
    }
}

/// Ordering for tick insertion: `None` (infinite expiry) sorts after every
/// finite expiry.
fn sorts_after(candidate: &Option<DateTime<Utc>>, existing: &Option<DateTime<Utc>>) -> bool {
    match (existing, candidate) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => *a > *b,
    }
}

fn insert_sorted(ticks: &mut Vec<Option<DateTime<Utc>>>, value: Option<DateTime<Utc>>) {
    let pos = ticks
        .iter()
        .position(|existing| sorts_after(&value, existing))
        .unwrap_or(ticks.len());
    ticks.insert(pos, value);
}

/// Process-wide, named, time-windowed counter registry.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    counters: HashMap<String, CounterData>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new tick with expiry `now + duration` (or infinite) unless
    /// a grace period is active, in which case this is a no-op returning
    /// 0. Returns the resulting tick count.
    pub fn augment(
        &mut self,
        counter: &str,
        key: &str,
        duration: Option<Duration>,
        now: DateTime<Utc>,
    ) -> i64 {
        let data = self.counters.entry(counter.to_string()).or_default();
        data.purge(key, now);
        if data.keys.get(key).and_then(|s| s.grace).is_some() {
            return 0;
        }
        let state = data.keys.entry(key.to_string()).or_default();
        let expiry = duration.map(|d| now + d);
        insert_sorted(&mut state.ticks, expiry);
        state.ticks.len() as i64
    }

    /// Pop the tick with the largest expiry. Returns the resulting tick
    /// count (0 if a grace is active or the key is absent); deletes the
    /// key once it drops to zero ticks with no grace.
    pub fn lower(&mut self, counter: &str, key: &str, now: DateTime<Utc>) -> i64 {
        let data = self.counters.entry(counter.to_string()).or_default();
        data.purge(key, now);
        let Some(state) = data.keys.get_mut(key) else {
            return 0;
        };
        if state.grace.is_some() {
            return 0;
        }
        state.ticks.pop();
        let remaining = state.ticks.len() as i64;
        if state.ticks.is_empty() {
            data.keys.remove(key);
        }
        remaining
    }

    /// Replace the key's state with an empty tick list and the given
    /// grace period, or delete the key entirely when no grace is given.
    pub fn reset(&mut self, counter: &str, key: &str, grace: Option<Duration>, now: DateTime<Utc>) {
        let data = self.counters.entry(counter.to_string()).or_default();
        data.purge(key, now);
        match grace {
            Some(g) => {
                data.keys.insert(
                    key.to_string(),
                    KeyState {
                        ticks: Vec::new(),
                        grace: Some(now + g),
                    },
                );
            }
            None => {
                data.keys.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn raise_raise_lower_yields_one() {
        let mut reg = CounterRegistry::new();
        assert_eq!(reg.augment("t", "k", None, t(0)), 1);
        assert_eq!(reg.augment("t", "k", None, t(0)), 2);
        assert_eq!(reg.lower("t", "k", t(0)), 1);
    }

    #[test]
    fn grace_blocks_augment() {
        let mut reg = CounterRegistry::new();
        reg.reset("t", "k", Some(Duration::seconds(10)), t(0));
        assert_eq!(reg.augment("t", "k", None, t(1)), 0);
        // still no ticks recorded
        assert_eq!(reg.lower("t", "k", t(1)), 0);
    }

    #[test]
    fn expired_tick_is_purged() {
        let mut reg = CounterRegistry::new();
        assert_eq!(reg.augment("t", "k", Some(Duration::seconds(3)), t(0)), 1);
        assert_eq!(reg.augment("t", "k", Some(Duration::seconds(3)), t(2)), 2);
        // third call 2s later: oldest tick (expiry t(3)) has now expired at t(4)
        assert_eq!(reg.augment("t", "k", Some(Duration::seconds(3)), t(4)), 2);
    }

    #[test]
    fn infinite_ticks_sort_last() {
        let mut reg = CounterRegistry::new();
        reg.augment("t", "k", None, t(0));
        reg.augment("t", "k", Some(Duration::seconds(5)), t(0));
        // popping the "largest" expiry removes the infinite tick first
        assert_eq!(reg.lower("t", "k", t(0)), 1);
    }
}

use std::fmt;

use crate::entry::Entry;

/// Error raised by a Filter's predicate or an Action's side effect while
/// running against one entry. These are always logged by the caller and
/// never retried.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StepError(pub String);

impl StepError {
    pub fn new(msg: impl Into<String>) -> Self {
        StepError(msg.into())
    }
}

/// A Filter node: evaluates a predicate against the entry, optionally
/// capturing fields into it. `Ok(true)`/`Ok(false)` route to `next`/`alt`
/// (wired in by the workflow builder); `Err` is logged and also routes to
/// `alt`.
pub trait FilterStep: fmt::Debug {
    fn evaluate(&self, entry: &mut Entry) -> Result<bool, StepError>;
}

/// An Action node: performs a side effect, possibly mutating the entry.
/// `Err` is logged and terminates traversal for this entry.
pub trait ActionStep: fmt::Debug {
    fn act(&self, entry: &mut Entry) -> Result<(), StepError>;
}

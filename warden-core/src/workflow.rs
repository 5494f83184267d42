use std::collections::HashMap;
use std::rc::Rc;

use warden_config::StepDescriptor;

use crate::actions::{Ban, CounterRaise, CounterReset, DnatCapture, DnatReplace, Email, Log, Report};
use crate::entry::Entry;
use crate::environment::Environment;
use crate::filters::{Comparison, Equals, In, InNetworks, PcreAny, Pcre as PcreFilter, UserExists};
use crate::step::{ActionStep, FilterStep, StepError};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("unknown filter or action module `{0}`")]
    UnknownModule(String),
    #[error("branch label `{0}` is not defined")]
    UnknownLabel(String),
    #[error("loop detected: label `{0}` branches back into its own ancestor chain")]
    Loop(String),
    #[error("failed to build step: {0}")]
    Build(#[from] StepError),
    #[error("no top-level labels defined")]
    Empty,
}

/// One compiled Step: either a Filter (with `next`/`alt`) or an Action
/// (with `next` only). Indices into [`Workflow::nodes`], not pointers —
/// an arena of a tagged variant stands in for a reference-counted node
/// graph.
enum Node {
    Filter {
        filter: Box<dyn FilterStep>,
        next: Option<usize>,
        alt: Option<usize>,
    },
    Action {
        action: Box<dyn ActionStep>,
        next: Option<usize>,
    },
}

/// A compiled, acyclic graph of Filter/Action Steps.
pub struct Workflow {
    nodes: Vec<Node>,
    root: usize,
}

impl Workflow {
    /// Run one entry from the root until a node has no `next`/matching
    /// `alt` link.
    pub fn run(&self, entry: &mut Entry) {
        let mut current = Some(self.root);
        while let Some(idx) = current {
            current = match &self.nodes[idx] {
                Node::Filter { filter, next, alt } => match filter.evaluate(entry) {
                    Ok(true) => *next,
                    Ok(false) => *alt,
                    Err(err) => {
                        tracing::error!(error = %err, "filter step failed");
                        *alt
                    }
                },
                Node::Action { action, next } => match action.act(entry) {
                    Ok(()) => *next,
                    Err(err) => {
                        tracing::error!(error = %err, "action step failed");
                        None
                    }
                },
            };
        }
    }
}

fn build_filter(env: &Rc<Environment>, name: &str, args: &serde_json::Map<String, serde_json::Value>) -> Result<Box<dyn FilterStep>, WorkflowError> {
    let _ = env;
    let step: Box<dyn FilterStep> = match name {
        "equals" => Box::new(Equals::from_args(args)?),
        "in" => Box::new(In::from_args(args)?),
        "lowerOrEquals" => Box::new(Comparison::lower_or_equals(args)?),
        "greaterOrEquals" => Box::new(Comparison::greater_or_equals(args)?),
        "pcre" => Box::new(PcreFilter::from_args(args)?),
        "pcreAny" => Box::new(PcreAny::from_args(args)?),
        "inNetworks" => Box::new(InNetworks::from_args(args)?),
        "userExists" => Box::new(UserExists::from_args(args)?),
        other => return Err(WorkflowError::UnknownModule(other.to_string())),
    };
    Ok(step)
}

fn build_action(env: &Rc<Environment>, name: &str, args: &serde_json::Map<String, serde_json::Value>) -> Result<Box<dyn ActionStep>, WorkflowError> {
    let step: Box<dyn ActionStep> = match name {
        "counterRaise" => Box::new(CounterRaise::from_args(Rc::clone(env), args)?),
        "counterReset" => Box::new(CounterReset::from_args(Rc::clone(env), args)?),
        "dnatCapture" => Box::new(DnatCapture::from_args(Rc::clone(env), args)?),
        "dnatReplace" => Box::new(DnatReplace::from_args(Rc::clone(env), args)?),
        "email" => Box::new(Email::from_args(Rc::clone(env), args)?),
        "nftBan" => Box::new(Ban::nft(Rc::clone(env), args)?),
        "ipsetBan" => Box::new(Ban::ipset(Rc::clone(env), args)?),
        "log" => Box::new(Log::from_args(args)?),
        "dailyReport" => Box::new(Report::from_args(Rc::clone(env), args)?),
        other => return Err(WorkflowError::UnknownModule(other.to_string())),
    };
    Ok(step)
}

/// Compiles a `label -> step sequence` map into a [`Workflow`], wiring
/// dangling filter/action successors to the next top-level label in
/// config order and rejecting `then`/`else` cycles.
pub struct WorkflowBuilder<'a> {
    env: Rc<Environment>,
    chains: &'a [(String, Vec<StepDescriptor>)],
    nodes: Vec<Node>,
    entry_points: HashMap<String, usize>,
    compiling: Vec<String>,
    /// Filter `alt` / chain-ending `next` slots left unset because the
    /// config gave no `else`/`then` for them. These accumulate across
    /// labels in config order and get wired to the next top-level label's
    /// entry step once it is compiled.
    dangling: Vec<DanglingSlot>,
}

#[derive(Clone, Copy)]
enum DanglingSlot {
    FilterAlt(usize),
    Next(usize),
}

impl<'a> WorkflowBuilder<'a> {
    pub fn new(env: Rc<Environment>, chains: &'a [(String, Vec<StepDescriptor>)]) -> Self {
        WorkflowBuilder {
            env,
            chains,
            nodes: Vec::new(),
            entry_points: HashMap::new(),
            compiling: Vec::new(),
            dangling: Vec::new(),
        }
    }

    pub fn build(mut self) -> Result<Workflow, WorkflowError> {
        if self.chains.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let labels: Vec<String> = self.chains.iter().map(|(l, _)| l.clone()).collect();

        for label in &labels {
            if self.entry_points.contains_key(label) {
                // already compiled as an earlier `then`/`else` branch
                // target: the original builder never re-wires into an
                // already-seen label, so leave any carried dangling slots
                // untouched for the next not-yet-seen label.
                continue;
            }
            // slots left dangling by labels compiled so far (top-level or
            // reached early via `then`/`else`) — patched to *this* label's
            // entry before this label's own compilation can add more.
            let carry: Vec<DanglingSlot> = self.dangling.drain(..).collect();
            let entry = self.compile_label(label)?;
            for slot in carry {
                match slot {
                    DanglingSlot::FilterAlt(idx) => {
                        if let Node::Filter { alt, .. } = &mut self.nodes[idx] {
                            if alt.is_none() {
                                *alt = Some(entry);
                            }
                        }
                    }
                    DanglingSlot::Next(idx) => {
                        let next_ref = match &mut self.nodes[idx] {
                            Node::Filter { next, .. } => next,
                            Node::Action { next, .. } => next,
                        };
                        if next_ref.is_none() {
                            *next_ref = Some(entry);
                        }
                    }
                }
            }
        }
        // the last top-level label's own dangling slots remain unset —
        // they are genuinely terminal.
        self.dangling.clear();

        let root = *self
            .entry_points
            .get(&labels[0])
            .ok_or(WorkflowError::Empty)?;

        Ok(Workflow {
            nodes: self.nodes,
            root,
        })
    }

    /// Compile (or fetch the cached entry index of) one label, detecting
    /// `then`/`else` cycles via an explicit ancestor stack — the original
    /// has no such check and would recurse without bound on a cyclic
    /// config.
    fn compile_label(&mut self, label: &str) -> Result<usize, WorkflowError> {
        // Check the ancestor stack before the entry-point cache: a label
        // provisionally registered in `entry_points` while still being
        // compiled (its `entry_idx` is inserted before its branch targets
        // are linked, so shared subchains resolve to a stable index) must
        // still be caught as a loop, not treated as already-finished.
        if self.compiling.iter().any(|l| l == label) {
            return Err(WorkflowError::Loop(label.to_string()));
        }
        if let Some(&idx) = self.entry_points.get(label) {
            return Ok(idx);
        }
        let steps = self
            .chains
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, s)| s)
            .ok_or_else(|| WorkflowError::UnknownLabel(label.to_string()))?;
        if steps.is_empty() {
            return Err(WorkflowError::UnknownLabel(label.to_string()));
        }

        self.compiling.push(label.to_string());

        let mut node_indices = Vec::with_capacity(steps.len());
        for descriptor in steps {
            let idx = self.push_uncompiled_node(descriptor)?;
            node_indices.push(idx);
        }
        let entry_idx = node_indices[0];
        self.entry_points.insert(label.to_string(), entry_idx);

        // link the linear chain: step i's next is step i+1, unless the
        // step has an explicit then/else branch label.
        for (pos, descriptor) in steps.iter().enumerate() {
            let idx = node_indices[pos];
            let branch_label = match descriptor {
                StepDescriptor::Filter { else_branch, .. } => else_branch.as_deref(),
                StepDescriptor::Action { then_branch, .. } => then_branch.as_deref(),
            };
            if let Some(target_label) = branch_label {
                let target = self.compile_label(target_label)?;
                match &mut self.nodes[idx] {
                    Node::Filter { alt, .. } => *alt = Some(target),
                    Node::Action { next, .. } => *next = Some(target),
                }
            } else if matches!(descriptor, StepDescriptor::Filter { .. }) {
                // no `else` configured: this filter's `alt` stays dangling
                // and is wired to the next top-level label's entry step.
                self.dangling.push(DanglingSlot::FilterAlt(idx));
            }
            // default linear `next` within the chain, unless this is an
            // Action with `then` (which replaces `next` and ends the chain).
            let is_action_with_then = matches!(
                descriptor,
                StepDescriptor::Action { then_branch: Some(_), .. }
            );
            if !is_action_with_then {
                if let Some(&next_idx) = node_indices.get(pos + 1) {
                    match &mut self.nodes[idx] {
                        Node::Filter { next, .. } => *next = Some(next_idx),
                        Node::Action { next, .. } => *next = Some(next_idx),
                    }
                } else {
                    // last step in the chain with no further step and no
                    // then/else override: its `next` stays dangling too.
                    self.dangling.push(DanglingSlot::Next(idx));
                }
            }
        }

        self.compiling.pop();
        Ok(entry_idx)
    }

    fn push_uncompiled_node(&mut self, descriptor: &StepDescriptor) -> Result<usize, WorkflowError> {
        let node = match descriptor {
            StepDescriptor::Filter { filter, args, .. } => Node::Filter {
                filter: build_filter(&self.env, filter, args)?,
                next: None,
                alt: None,
            },
            StepDescriptor::Action { action, args, .. } => Node::Action {
                action: build_action(&self.env, action, args)?,
                next: None,
            },
        };
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_config::Config;

    fn env() -> Rc<Environment> {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = serde_json::from_value(json!({
            "storage": dir.path(),
            "actions": {}
        }))
        .unwrap();
        Rc::new(Environment::from_config(&config))
    }

    fn descriptor(json: serde_json::Value) -> StepDescriptor {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn then_else_cycle_is_rejected() {
        let chains = vec![
            (
                "a".to_string(),
                vec![descriptor(json!({"filter": "equals", "args": {"field": "k", "value": "v"}, "else": "b"}))],
            ),
            (
                "b".to_string(),
                vec![descriptor(json!({"filter": "equals", "args": {"field": "k", "value": "v"}, "else": "a"}))],
            ),
        ];
        let builder = WorkflowBuilder::new(env(), &chains);
        let err = builder.build().unwrap_err();
        assert!(matches!(err, WorkflowError::Loop(_)));
    }

    #[test]
    fn fall_through_wires_to_next_top_level_label() {
        let chains = vec![
            (
                "first".to_string(),
                vec![descriptor(json!({"filter": "equals", "args": {"field": "k", "value": "v"}}))],
            ),
            (
                "second".to_string(),
                vec![descriptor(json!({"action": "log", "args": {"message": "hit"}}))],
            ),
        ];
        let workflow = WorkflowBuilder::new(env(), &chains).build().unwrap();
        let mut entry = Entry::new();
        entry.insert("k".to_string(), crate::entry::EntryValue::from("v"));
        entry.insert(
            crate::entry::REALTIME_TIMESTAMP.to_string(),
            crate::entry::EntryValue::Timestamp(chrono::Utc::now()),
        );
        // both the true and false paths fall through to `second`'s entry
        // step, since `first`'s filter has no `else` configured.
        workflow.run(&mut entry);
    }

    #[test]
    fn branch_target_also_listed_as_later_top_level_label_does_not_self_cycle() {
        // "shared" is compiled early as `first`'s `else` target, then
        // appears again as its own top-level label. The builder must not
        // re-wire `shared`'s own dangling `next` back onto its already-
        // compiled entry step — that would make `shared`'s single action
        // its own successor, an infinite loop on every `run()`.
        let chains = vec![
            (
                "first".to_string(),
                vec![descriptor(json!({
                    "filter": "equals",
                    "args": {"field": "k", "value": "v"},
                    "else": "shared",
                }))],
            ),
            (
                "shared".to_string(),
                vec![descriptor(json!({"action": "log", "args": {"message": "shared hit"}}))],
            ),
        ];
        let workflow = WorkflowBuilder::new(env(), &chains).build().unwrap();
        let mut entry = Entry::new();
        entry.insert("k".to_string(), crate::entry::EntryValue::from("other"));
        entry.insert(
            crate::entry::REALTIME_TIMESTAMP.to_string(),
            crate::entry::EntryValue::Timestamp(chrono::Utc::now()),
        );
        // the false path routes to `shared`'s entry and then terminates;
        // a regression here would hang rather than fail an assertion.
        workflow.run(&mut entry);
    }
}

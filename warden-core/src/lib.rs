//! The pipeline engine for the warden journal daemon: the `Entry` record,
//! the Step graph contract, the Filter and Action libraries, and the
//! stateful subsystems (Counter registry, DNAT mapping cache, Ban store,
//! Daily Report aggregator) those Steps invoke.

pub mod actions;
pub mod ban;
pub mod counter;
pub mod dnat;
pub mod entry;
pub mod environment;
pub mod filters;
pub mod mail;
pub mod report;
pub mod step;
pub mod workflow;

pub use entry::{Entry, EntryValue, REALTIME_TIMESTAMP};
pub use environment::Environment;
pub use step::{ActionStep, FilterStep, StepError};
pub use workflow::{Workflow, WorkflowBuilder, WorkflowError};

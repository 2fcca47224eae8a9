//! Run scheduling.
//!
//! - [`RunCoordinator`] owns the run state machine and guarantees at most
//!   one live run per task.
//! - [`SyncScheduler`] triggers runs from each task's cron expression.

pub mod coordinator;
mod service;

pub use coordinator::{
    ExecuteMode, ExecuteOutcome, FileProcessingStats, Page, RunAck, RunCoordinator, RunSummary,
    TimeRange,
};
pub use service::{SyncScheduler, parse_cron};

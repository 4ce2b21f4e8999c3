//! Job execution engine for long-running, cancelable, suspendable and
//! optionally reversible background work.
//!
//! A [`Job`] wraps a [`JobTask`] and drives it step by step on its own worker
//! thread while the caller stays responsive. Commands (`start`, `suspend`,
//! `resume`, `cancel`, `rollback`) can be issued from any thread and are
//! observed through [`JobListener`]s. A [`JobManager`] keeps track of active
//! and finished jobs.

pub mod config;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod state_machine;
pub mod ui;

pub use error::JobError;
pub use manager::{JobManager, JobManagerListener};
pub use state_machine::{
    Job, JobCommand, JobContext, JobFailureDescription, JobFailureOption, JobListener, JobState,
    JobSummary, JobTask,
};

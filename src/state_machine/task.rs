use std::sync::Arc;

use anyhow::Result;

use super::failure::JobFailureDescription;
use super::job::Job;
use super::state::{JobCommand, JobState};
use crate::error::JobError;

/// The work a [`Job`] drives.
///
/// Every callback runs on the job's worker thread. Steps should be short
/// enough that suspend and cancel are observed promptly; long steps can poll
/// [`JobContext::should_stop`].
pub trait JobTask: Send + 'static {
    /// Called once before the first step.
    fn pre_execution(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    /// Performs one unit of forward work. Returns `true` once nothing is left.
    fn next_step(&mut self, ctx: &JobContext) -> Result<bool>;

    /// Undoes one unit of previously applied work. Returns `true` once
    /// everything has been undone.
    fn next_rollback_step(&mut self, _ctx: &JobContext) -> Result<bool> {
        Ok(true)
    }

    /// Called once after the job has reached a terminal state.
    fn post_execution(&mut self, _ctx: &JobContext) {}

    /// Progress estimate in percent, `-1` while indeterminate.
    fn percentage(&self) -> i32 {
        -1
    }

    fn supports_rollback(&self) -> bool {
        false
    }
}

/// Engine services available to a running task.
#[derive(Clone)]
pub struct JobContext {
    pub(crate) job: Job,
}

impl JobContext {
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Re-reads the current state.
    pub fn check_state(&self) -> JobState {
        self.job.state()
    }

    /// True once the job has been cancelled or otherwise reached a final state.
    pub fn should_stop(&self) -> bool {
        self.job.state().is_final()
    }

    pub fn set_job_description(&self, description: impl Into<String>) {
        self.job.set_description(description.into());
    }

    pub fn fire_progress_changed(&self, percentage: i32) {
        self.job.set_percentage(percentage);
        self.job.dispatch();
    }

    /// Marks the forward run as done. Fails if the job is already final or is
    /// rolling back.
    pub fn finished_job(&self) -> Result<(), JobError> {
        self.job.transition(JobCommand::Finish)?;
        self.job.dispatch();
        Ok(())
    }

    /// Marks the rollback as done. Fails if the job is already final or is
    /// running forward.
    pub fn finished_rollback(&self) -> Result<(), JobError> {
        self.job.transition(JobCommand::FinishRollback)?;
        self.job.dispatch();
        Ok(())
    }

    /// Reports a failure to listeners without changing state or waiting.
    pub fn failer(&self, failure: Arc<JobFailureDescription>) {
        self.job.report_failure(failure);
        self.job.dispatch();
    }

    /// Moves the job into `Failure` (or `UndoFailure`), notifies listeners and
    /// blocks until the failure is resolved.
    ///
    /// Returns the state the job was released into: `Running`/`Undoing` after
    /// a resume (read the answer from `failure.respond()`), `Undoing` after a
    /// rollback, a final state after a cancel. If the job was already final,
    /// returns immediately without notifying.
    pub fn request_failure_handling(
        &self,
        failure: &Arc<JobFailureDescription>,
    ) -> Result<JobState, JobError> {
        self.job.await_failure_resolution(failure)
    }
}

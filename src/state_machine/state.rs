use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// The vertices of the job state machine.
///
/// A job starts in `Preparing`, runs forward through `Running` (with optional
/// `Suspended`/`Failure` detours) and ends in one of the three terminal states.
/// The `Undo*` states mirror their forward counterparts while a rollback is in
/// progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Preparing,
    Running,
    Suspended,
    Failure,
    Undoing,
    #[serde(rename = "UNDOSUSPENDED")]
    UndoSuspended,
    #[serde(rename = "UNDOFAILURE")]
    UndoFailure,
    Finished,
    Aborted,
    Reverted,
}

impl JobState {
    pub const ALL: [JobState; 10] = [
        JobState::Preparing,
        JobState::Running,
        JobState::Suspended,
        JobState::Failure,
        JobState::Undoing,
        JobState::UndoSuspended,
        JobState::UndoFailure,
        JobState::Finished,
        JobState::Aborted,
        JobState::Reverted,
    ];

    /// True only for `Finished`, `Aborted` and `Reverted`.
    pub fn is_final(self) -> bool {
        matches!(self, JobState::Finished | JobState::Aborted | JobState::Reverted)
    }

    /// True for states in which running or suspending the job is meaningful.
    pub fn is_runable(self) -> bool {
        matches!(
            self,
            JobState::Running
                | JobState::Suspended
                | JobState::Failure
                | JobState::Undoing
                | JobState::UndoSuspended
                | JobState::UndoFailure
        )
    }

    pub fn is_undo(self) -> bool {
        matches!(
            self,
            JobState::Undoing | JobState::UndoSuspended | JobState::UndoFailure | JobState::Reverted
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, JobState::Failure | JobState::UndoFailure)
    }

    pub fn is_suspended(self) -> bool {
        matches!(self, JobState::Suspended | JobState::UndoSuspended)
    }

    /// Computes the state reached by applying `command`, or rejects it.
    ///
    /// Rollback availability is not checked here; the job does that before
    /// asking for the transition.
    pub fn apply(self, command: JobCommand) -> Result<JobState, JobError> {
        use JobCommand as C;
        use JobState as S;

        let next = match (self, command) {
            (S::Preparing, C::Start) => S::Running,

            (S::Running, C::Suspend) => S::Suspended,
            (S::Undoing, C::Suspend) => S::UndoSuspended,

            (S::Suspended | S::Failure, C::Resume) => S::Running,
            (S::UndoSuspended | S::UndoFailure, C::Resume) => S::Undoing,

            (
                S::Running
                | S::Suspended
                | S::Failure
                | S::Undoing
                | S::UndoSuspended
                | S::UndoFailure,
                C::Cancel,
            ) => S::Aborted,

            (S::Running | S::Suspended | S::Failure, C::Rollback) => S::Undoing,

            // A suspend issued while a step was in flight is superseded by the
            // failure that step reports.
            (S::Running | S::Suspended, C::Fail) => S::Failure,
            (S::Undoing | S::UndoSuspended, C::Fail) => S::UndoFailure,

            (S::Running | S::Suspended, C::Finish) => S::Finished,
            (S::Undoing | S::UndoSuspended, C::FinishRollback) => S::Reverted,

            (state, command) => return Err(JobError::IllegalTransition { state, command }),
        };
        Ok(next)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Preparing => "PREPARING",
            JobState::Running => "RUNNING",
            JobState::Suspended => "SUSPENDED",
            JobState::Failure => "FAILURE",
            JobState::Undoing => "UNDOING",
            JobState::UndoSuspended => "UNDOSUSPENDED",
            JobState::UndoFailure => "UNDOFAILURE",
            JobState::Finished => "FINISHED",
            JobState::Aborted => "ABORTED",
            JobState::Reverted => "REVERTED",
        };
        f.write_str(name)
    }
}

/// The commands that drive edges of the state machine.
///
/// `Start`, `Suspend`, `Resume`, `Cancel` and `Rollback` are issued from the
/// outside; `Fail`, `Finish` and `FinishRollback` come from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobCommand {
    Start,
    Suspend,
    Resume,
    Cancel,
    Rollback,
    Fail,
    Finish,
    FinishRollback,
}

impl JobCommand {
    pub const ALL: [JobCommand; 8] = [
        JobCommand::Start,
        JobCommand::Suspend,
        JobCommand::Resume,
        JobCommand::Cancel,
        JobCommand::Rollback,
        JobCommand::Fail,
        JobCommand::Finish,
        JobCommand::FinishRollback,
    ];
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobCommand::Start => "START",
            JobCommand::Suspend => "SUSPEND",
            JobCommand::Resume => "RESUME",
            JobCommand::Cancel => "CANCEL",
            JobCommand::Rollback => "ROLLBACK",
            JobCommand::Fail => "FAIL",
            JobCommand::Finish => "FINISH",
            JobCommand::FinishRollback => "FINISH_ROLLBACK",
        };
        f.write_str(name)
    }
}

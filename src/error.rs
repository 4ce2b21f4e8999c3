use thiserror::Error;

use crate::state_machine::{JobCommand, JobFailureOption, JobState};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("command {command} is not allowed in state {state}")]
    IllegalTransition { state: JobState, command: JobCommand },

    #[error("job does not support rollback")]
    RollbackUnsupported,

    #[error("job is not waiting on a failure (state {0})")]
    NotInFailure(JobState),

    #[error("option {0} was not offered by the failure description")]
    OptionNotOffered(JobFailureOption),

    #[error("job configuration is frozen once started (state {0})")]
    AlreadyStarted(JobState),

    #[error("job is already registered with a manager")]
    AlreadyManaged,

    #[error("job manager has been shut down")]
    ManagerShutDown,

    #[error("cannot shut down: {count} job(s) still active")]
    ActiveJobsRemaining { count: usize },

    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T, E = JobError> = std::result::Result<T, E>;

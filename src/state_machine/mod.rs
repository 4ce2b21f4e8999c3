mod failure;
mod job;
mod listener;
mod state;
mod task;

pub use failure::{JobFailureDescription, JobFailureOption};
pub use job::{Job, JobSummary, TransitionRecord};
pub use listener::{JobListener, ListenerSet};
pub use state::{JobCommand, JobState};
pub use task::{JobContext, JobTask};

pub(crate) use listener::guarded;

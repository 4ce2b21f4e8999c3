use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::failure::{JobFailureDescription, JobFailureOption};
use super::listener::{JobListener, ListenerSet, guarded};
use super::state::{JobCommand, JobState};
use super::task::{JobContext, JobTask};
use crate::error::JobError;
use crate::manager::{JobManager, WeakJobManager};

const DEFAULT_WORKER_PREFIX: &str = "job";

/// One accepted edge of the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: JobState,
    pub to: JobState,
    pub command: JobCommand,
    pub at: DateTime<Utc>,
}

/// Serializable snapshot of a job, produced on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub state: JobState,
    pub percentage: i32,
    pub transitions: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

enum JobEvent {
    State {
        old: JobState,
        new: JobState,
        command: JobCommand,
    },
    Progress(i32),
    Description(String),
    Failer(Arc<JobFailureDescription>),
}

/// An event waiting for delivery, tagged with the thread that raised it.
struct Queued {
    origin: ThreadId,
    event: JobEvent,
}

struct Core {
    state: JobState,
    name: String,
    description: String,
    percentage: i32,
    failure: Option<Arc<JobFailureDescription>>,
    history: Vec<TransitionRecord>,
    finished_at: Option<DateTime<Utc>>,
    events: VecDeque<Queued>,
    dispatcher: Option<ThreadId>,
    manager: Option<WeakJobManager>,
}

impl Core {
    fn enqueue(&mut self, event: JobEvent) {
        self.events.push_back(Queued {
            origin: thread::current().id(),
            event,
        });
    }
}

struct Shared {
    id: Uuid,
    created_at: DateTime<Utc>,
    supports_rollback: bool,
    core: Mutex<Core>,
    changed: Condvar,
    listeners: ListenerSet<dyn JobListener>,
    task: Mutex<Option<Box<dyn JobTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a cancelable, suspendable and optionally reversible unit of
/// background work.
///
/// Cloning is cheap; all clones refer to the same job. Command methods may be
/// called from any thread. They change state synchronously and notify
/// listeners on the calling thread before returning. A command issued from
/// inside a listener callback is delivered once that callback returns.
#[derive(Clone)]
pub struct Job {
    shared: Arc<Shared>,
}

impl Job {
    pub fn new(name: impl Into<String>, task: impl JobTask) -> Self {
        let task: Box<dyn JobTask> = Box::new(task);
        let now = Utc::now();
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                created_at: now,
                supports_rollback: task.supports_rollback(),
                core: Mutex::new(Core {
                    state: JobState::Preparing,
                    name: name.into(),
                    description: String::new(),
                    percentage: task.percentage(),
                    failure: None,
                    history: Vec::new(),
                    finished_at: None,
                    events: VecDeque::new(),
                    dispatcher: None,
                    manager: None,
                }),
                changed: Condvar::new(),
                listeners: ListenerSet::new(),
                task: Mutex::new(Some(task)),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Creates a job bound to `manager`; it joins the active list on `start()`.
    pub fn with_manager(name: impl Into<String>, task: impl JobTask, manager: &JobManager) -> Self {
        let job = Self::new(name, task);
        job.lock_core().manager = Some(manager.downgrade());
        job
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> JobState {
        self.lock_core().state
    }

    pub fn job_name(&self) -> String {
        self.lock_core().name.clone()
    }

    pub fn job_description(&self) -> String {
        self.lock_core().description.clone()
    }

    pub fn percentage(&self) -> i32 {
        self.lock_core().percentage
    }

    pub fn supports_rollback(&self) -> bool {
        self.shared.supports_rollback
    }

    /// The pending failure; present only while in `Failure` or `UndoFailure`.
    pub fn failure_description(&self) -> Option<Arc<JobFailureDescription>> {
        self.lock_core().failure.clone()
    }

    pub fn manager(&self) -> Option<JobManager> {
        self.lock_core().manager.as_ref().and_then(WeakJobManager::upgrade)
    }

    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>) -> bool {
        self.shared.listeners.add(listener)
    }

    pub fn remove_job_listener(&self, listener: &Arc<dyn JobListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Fails once the job has left `Preparing`. Configuration setters call this
    /// before mutating anything.
    pub fn check_config_state(&self) -> Result<(), JobError> {
        match self.state() {
            JobState::Preparing => Ok(()),
            state => Err(JobError::AlreadyStarted(state)),
        }
    }

    pub fn set_job_name(&self, name: impl Into<String>) -> Result<(), JobError> {
        let mut core = self.lock_core();
        if core.state != JobState::Preparing {
            return Err(JobError::AlreadyStarted(core.state));
        }
        core.name = name.into();
        Ok(())
    }

    /// Binds the job to `manager`. Only allowed before `start()`, and only once
    /// unless it is the same manager.
    pub fn attach_manager(&self, manager: &JobManager) -> Result<(), JobError> {
        let mut core = self.lock_core();
        if core.state != JobState::Preparing {
            return Err(JobError::AlreadyStarted(core.state));
        }
        match core.manager.as_ref().and_then(WeakJobManager::upgrade) {
            Some(current) if current != *manager => Err(JobError::AlreadyManaged),
            _ => {
                core.manager = Some(manager.downgrade());
                Ok(())
            }
        }
    }

    /// Moves `Preparing` to `Running` and spawns the worker thread.
    pub fn start(&self) -> Result<(), JobError> {
        let manager = self.manager();
        let task = {
            let mut slot = self.shared.task.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                return Err(JobError::IllegalTransition {
                    state: self.state(),
                    command: JobCommand::Start,
                });
            }
            // Listed before the transition so the manager sees the terminal
            // event and a shut down manager refuses the job untouched.
            if let Some(manager) = &manager {
                manager.register(self)?;
            }
            self.transition(JobCommand::Start)?;
            slot.take()
        };
        let Some(task) = task else {
            return Err(JobError::IllegalTransition {
                state: self.state(),
                command: JobCommand::Start,
            });
        };

        let prefix = match &manager {
            Some(manager) => manager.worker_prefix().to_string(),
            None => DEFAULT_WORKER_PREFIX.to_string(),
        };
        tracing::info!(job = %self.id(), name = %self.job_name(), "job started");
        self.dispatch();

        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{prefix}-{}", &self.id().simple().to_string()[..8]))
            .spawn(move || worker.run(task));
        match spawned {
            Ok(handle) => {
                *self.shared.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!(job = %self.id(), error = %e, "failed to spawn worker");
                let _ = self.transition(JobCommand::Cancel);
                self.dispatch();
                Err(JobError::SpawnFailed(e))
            }
        }
    }

    /// The worker finishes its current step and then parks.
    pub fn suspend(&self) -> Result<(), JobError> {
        self.command(JobCommand::Suspend)
    }

    /// Continues a suspended job, or releases a worker waiting on a failure
    /// with whatever response has been written to the failure description.
    pub fn resume(&self) -> Result<(), JobError> {
        self.command(JobCommand::Resume)
    }

    /// Abandons the job. No compensating work runs.
    pub fn cancel(&self) -> Result<(), JobError> {
        self.command(JobCommand::Cancel)
    }

    /// Switches the worker to undoing already applied work.
    pub fn rollback(&self) -> Result<(), JobError> {
        if !self.shared.supports_rollback {
            return Err(JobError::RollbackUnsupported);
        }
        self.command(JobCommand::Rollback)
    }

    /// Writes `option` into the pending failure description and resumes.
    pub fn resolve_failure(&self, option: JobFailureOption) -> Result<(), JobError> {
        {
            let mut core = self.lock_core();
            let failure = match (&core.failure, core.state.is_failure()) {
                (Some(failure), true) => Arc::clone(failure),
                _ => return Err(JobError::NotInFailure(core.state)),
            };
            failure.set_respond(option)?;
            let old = core.state;
            let new = old.apply(JobCommand::Resume)?;
            self.commit(&mut core, old, new, JobCommand::Resume);
        }
        self.dispatch();
        Ok(())
    }

    /// Blocks until the job reaches a final state or `timeout` elapses.
    pub fn wait_until_final(&self, timeout: Duration) -> Option<JobState> {
        let core = self.lock_core();
        let (core, _) = self
            .shared
            .changed
            .wait_timeout_while(core, timeout, |core| !core.state.is_final())
            .unwrap_or_else(PoisonError::into_inner);
        core.state.is_final().then_some(core.state)
    }

    /// Waits for the worker thread to exit, after `post_execution` ran and all
    /// queued events were delivered. Returns immediately if never started.
    pub fn join(&self) {
        let handle = self.shared.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!(job = %self.id(), "worker thread panicked");
        }
    }

    pub fn summary(&self) -> JobSummary {
        let core = self.lock_core();
        JobSummary {
            id: self.shared.id,
            name: core.name.clone(),
            description: core.description.clone(),
            state: core.state,
            percentage: core.percentage,
            transitions: core.history.clone(),
            created_at: self.shared.created_at,
            finished_at: core.finished_at,
            duration_ms: core
                .finished_at
                .map(|end| (end - self.shared.created_at).num_milliseconds()),
        }
    }

    fn command(&self, command: JobCommand) -> Result<(), JobError> {
        self.transition(command)?;
        self.dispatch();
        Ok(())
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.shared.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transition(&self, command: JobCommand) -> Result<JobState, JobError> {
        let mut core = self.lock_core();
        let old = core.state;
        let new = old.apply(command)?;
        self.commit(&mut core, old, new, command);
        Ok(new)
    }

    fn commit(&self, core: &mut Core, old: JobState, new: JobState, command: JobCommand) {
        let now = Utc::now();
        core.state = new;
        if !new.is_failure() {
            core.failure = None;
        }
        if new.is_final() {
            core.finished_at = Some(now);
        }
        core.history.push(TransitionRecord {
            from: old,
            to: new,
            command,
            at: now,
        });
        core.enqueue(JobEvent::State { old, new, command });
        self.shared.changed.notify_all();
        tracing::debug!(job = %self.shared.id, %old, %new, %command, "transition");
    }

    pub(crate) fn set_description(&self, description: String) {
        {
            let mut core = self.lock_core();
            if core.description == description {
                return;
            }
            core.description = description.clone();
            core.enqueue(JobEvent::Description(description));
        }
        self.dispatch();
    }

    pub(crate) fn set_percentage(&self, percentage: i32) {
        let mut core = self.lock_core();
        if core.percentage != percentage {
            core.percentage = percentage;
            core.enqueue(JobEvent::Progress(percentage));
        }
    }

    pub(crate) fn report_failure(&self, failure: Arc<JobFailureDescription>) {
        tracing::warn!(job = %self.shared.id, failure = %failure, "failure reported");
        self.lock_core().enqueue(JobEvent::Failer(failure));
    }

    pub(crate) fn await_failure_resolution(
        &self,
        failure: &Arc<JobFailureDescription>,
    ) -> Result<JobState, JobError> {
        {
            let mut core = self.lock_core();
            let old = core.state;
            if old.is_final() {
                return Ok(old);
            }
            let new = old.apply(JobCommand::Fail)?;
            self.commit(&mut core, old, new, JobCommand::Fail);
            core.failure = Some(Arc::clone(failure));
            core.enqueue(JobEvent::Failer(Arc::clone(failure)));
        }
        tracing::warn!(job = %self.shared.id, failure = %failure, "waiting for failure resolution");
        self.dispatch();

        let core = self.lock_core();
        let core = self
            .shared
            .changed
            .wait_while(core, |core| core.state.is_failure())
            .unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(job = %self.shared.id, state = %core.state, respond = %failure.respond(), "failure resolved");
        Ok(core.state)
    }

    /// Delivers the events raised by the calling thread.
    ///
    /// The queue is delivered strictly in order and every event on the thread
    /// that raised it, so this waits while earlier events from other threads
    /// are still pending. Calls made from inside a listener callback return at
    /// once; the enclosing delivery loop picks their events up.
    pub(crate) fn dispatch(&self) {
        let me = thread::current().id();
        let mut core = self.lock_core();
        if core.dispatcher == Some(me) {
            return;
        }
        loop {
            if !core.events.iter().any(|q| q.origin == me) {
                return;
            }
            let ready = core.dispatcher.is_none()
                && core.events.front().is_some_and(|q| q.origin == me);
            if !ready {
                core = self
                    .shared
                    .changed
                    .wait(core)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            core.dispatcher = Some(me);
            while core.events.front().is_some_and(|q| q.origin == me) {
                let Some(queued) = core.events.pop_front() else {
                    break;
                };
                drop(core);
                self.deliver(queued.event);
                core = self.lock_core();
            }
            core.dispatcher = None;
            self.shared.changed.notify_all();
        }
    }

    fn deliver(&self, event: JobEvent) {
        let listeners = self.shared.listeners.snapshot();
        match event {
            JobEvent::State { old, new, command } => {
                for l in listeners.iter() {
                    guarded("state_changed", || l.state_changed(self, old, new, command));
                }
            }
            JobEvent::Progress(percentage) => {
                for l in listeners.iter() {
                    guarded("progress_changed", || l.progress_changed(self, percentage));
                }
            }
            JobEvent::Description(description) => {
                for l in listeners.iter() {
                    guarded("description_changed", || l.description_changed(self, &description));
                }
            }
            JobEvent::Failer(failure) => {
                for l in listeners.iter() {
                    guarded("failer_emerged", || l.failer_emerged(self, &failure));
                }
            }
        }
    }

    /// Waits until every queued event, from any thread, has been delivered.
    fn settle(&self) {
        loop {
            self.dispatch();
            let core = self.lock_core();
            if core.dispatcher.is_none() && core.events.is_empty() {
                return;
            }
            let _unused = self
                .shared
                .changed
                .wait_timeout(core, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks while suspended or failed and returns the state to act on.
    fn await_work(&self) -> JobState {
        let core = self.lock_core();
        let core = self
            .shared
            .changed
            .wait_while(core, |core| core.state.is_suspended() || core.state.is_failure())
            .unwrap_or_else(PoisonError::into_inner);
        core.state
    }

    /// Lands in `Finished`/`Reverted` after the last step, unless the job was
    /// redirected or ended while that step ran.
    fn complete(&self, undo: bool) {
        let command = if undo {
            JobCommand::FinishRollback
        } else {
            JobCommand::Finish
        };
        let mut core = self.lock_core();
        let old = core.state;
        if old.is_final() {
            return;
        }
        match old.apply(command) {
            Ok(new) => self.commit(&mut core, old, new, command),
            Err(_) => tracing::debug!(job = %self.shared.id, state = %old, "direction changed during last step"),
        }
    }

    /// Reports an unexpected task error to listeners and aborts the job.
    fn fatal(&self, error: anyhow::Error, during: &str) {
        tracing::error!(job = %self.shared.id, during, error = %format!("{error:#}"), "job failed unexpectedly");
        let name = self.job_name();
        let failure = JobFailureDescription::new(
            format!("{name}: unexpected error during {during}"),
            vec![JobFailureOption::Cancel],
        )
        .with_cause(error);
        {
            let mut core = self.lock_core();
            core.enqueue(JobEvent::Failer(Arc::new(failure)));
            let old = core.state;
            if let Ok(new) = old.apply(JobCommand::Cancel) {
                self.commit(&mut core, old, new, JobCommand::Cancel);
            }
        }
        self.dispatch();
    }

    fn run(&self, mut task: Box<dyn JobTask>) {
        let ctx = JobContext { job: self.clone() };
        let started = Instant::now();

        if let Err(e) = run_guarded(|| task.pre_execution(&ctx)) {
            self.fatal(e, "preparation");
        }

        loop {
            self.settle();
            let state = self.await_work();
            let outcome = match state {
                JobState::Running => run_guarded(|| task.next_step(&ctx)),
                JobState::Undoing => run_guarded(|| task.next_rollback_step(&ctx)),
                _ => break,
            };
            self.set_percentage(task.percentage());
            match outcome {
                Ok(true) => self.complete(state == JobState::Undoing),
                Ok(false) => {}
                Err(e) => self.fatal(e, if state == JobState::Undoing { "rollback" } else { "step" }),
            }
            self.dispatch();
        }

        if run_guarded(|| {
            task.post_execution(&ctx);
            Ok(())
        })
        .is_err()
        {
            tracing::error!(job = %self.shared.id, "post_execution panicked");
        }
        self.settle();
        tracing::info!(
            job = %self.shared.id,
            state = %self.state(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job ended"
        );
    }
}

/// Runs a task callback, turning a panic into an error.
fn run_guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("panicked: {message}"))
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Job {}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.lock_core();
        f.debug_struct("Job")
            .field("id", &self.shared.id)
            .field("name", &core.name)
            .field("state", &core.state)
            .field("percentage", &core.percentage)
            .finish()
    }
}

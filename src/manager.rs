//! Registry of active and finished jobs.
//!
//! [`JobManager`] tracks which jobs are running and which have ended, and
//! fans membership changes out to [`JobManagerListener`]s. Jobs report their
//! own termination through a relay listener the manager installs when it
//! registers them; `clear_finished_jobs()` detaches it again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use uuid::Uuid;

use crate::error::JobError;
use crate::state_machine::{
    Job, JobCommand, JobFailureDescription, JobListener, JobState, ListenerSet, guarded,
};

/// Observer of the manager's job lists.
pub trait JobManagerListener: Send + Sync {
    fn job_added_to_active_list(&self, _manager: &JobManager, _job: &Job) {}

    fn job_removed_from_active_list(&self, _manager: &JobManager, _job: &Job) {}

    fn job_added_to_finished_list(&self, _manager: &JobManager, _job: &Job) {}

    /// The finished list was emptied; drop any per-job listeners attached to
    /// those jobs.
    fn finished_list_flushed(&self, _manager: &JobManager) {}

    /// A managed job reported a failure.
    fn failure_escalated(
        &self,
        _manager: &JobManager,
        _job: &Job,
        _failure: &Arc<JobFailureDescription>,
    ) {
    }
}

#[derive(Default)]
struct Lists {
    active: Vec<Job>,
    finished: Vec<Job>,
}

struct ManagerShared {
    lists: Mutex<Lists>,
    listeners: ListenerSet<dyn JobManagerListener>,
    relay: Arc<dyn JobListener>,
    shut_down: AtomicBool,
    worker_prefix: String,
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerShared>,
}

/// Non-owning reference held by jobs, so manager and jobs do not keep each
/// other alive.
#[derive(Clone)]
pub(crate) struct WeakJobManager(Weak<ManagerShared>);

impl WeakJobManager {
    pub(crate) fn upgrade(&self) -> Option<JobManager> {
        self.0.upgrade().map(|inner| JobManager { inner })
    }
}

/// Forwards job events the manager cares about.
struct ManagerRelay {
    manager: Weak<ManagerShared>,
}

impl JobListener for ManagerRelay {
    fn state_changed(&self, job: &Job, _old: JobState, new: JobState, _command: JobCommand) {
        if !new.is_final() {
            return;
        }
        if let Some(inner) = self.manager.upgrade() {
            JobManager { inner }.job_terminated(job);
        }
    }

    fn failer_emerged(&self, job: &Job, failure: &Arc<JobFailureDescription>) {
        if let Some(inner) = self.manager.upgrade() {
            let manager = JobManager { inner };
            for l in manager.inner.listeners.snapshot().iter() {
                guarded("failure_escalated", || l.failure_escalated(&manager, job, failure));
            }
        }
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self::with_worker_prefix("job")
    }

    /// Worker threads of managed jobs are named `<prefix>-<id>`.
    pub fn with_worker_prefix(prefix: impl Into<String>) -> Self {
        let worker_prefix = prefix.into();
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerShared>| ManagerShared {
            lists: Mutex::new(Lists::default()),
            listeners: ListenerSet::new(),
            relay: Arc::new(ManagerRelay {
                manager: weak.clone(),
            }),
            shut_down: AtomicBool::new(false),
            worker_prefix,
        });
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> WeakJobManager {
        WeakJobManager(Arc::downgrade(&self.inner))
    }

    pub(crate) fn worker_prefix(&self) -> &str {
        &self.inner.worker_prefix
    }

    fn ensure_accepting(&self) -> Result<(), JobError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(JobError::ManagerShutDown);
        }
        Ok(())
    }

    fn lock_lists(&self) -> MutexGuard<'_, Lists> {
        self.inner.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_job_manager_listener(&self, listener: Arc<dyn JobManagerListener>) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn remove_job_manager_listener(&self, listener: &Arc<dyn JobManagerListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    pub fn active_jobs(&self) -> Vec<Job> {
        self.lock_lists().active.clone()
    }

    pub fn finished_jobs(&self) -> Vec<Job> {
        self.lock_lists().finished.clone()
    }

    pub fn find_job(&self, id: Uuid) -> Option<Job> {
        let lists = self.lock_lists();
        lists
            .active
            .iter()
            .chain(lists.finished.iter())
            .find(|job| job.id() == id)
            .cloned()
    }

    /// Binds `job` to this manager and lists it as active right away, before
    /// it is started.
    pub fn add_job(&self, job: &Job) -> Result<(), JobError> {
        self.ensure_accepting()?;
        job.attach_manager(self)?;
        self.register(job)?;
        Ok(())
    }

    /// Puts `job` on the active list. Registering the same job twice is a
    /// no-op; registering with a shut down manager is refused.
    pub(crate) fn register(&self, job: &Job) -> Result<bool, JobError> {
        {
            let mut lists = self.lock_lists();
            if self.is_shut_down() {
                return Err(JobError::ManagerShutDown);
            }
            if lists.active.contains(job) || lists.finished.contains(job) {
                return Ok(false);
            }
            lists.active.push(job.clone());
        }
        job.add_job_listener(Arc::clone(&self.inner.relay));
        tracing::debug!(job = %job.id(), name = %job.job_name(), "job added to active list");
        for l in self.inner.listeners.snapshot().iter() {
            guarded("job_added_to_active_list", || l.job_added_to_active_list(self, job));
        }
        // The job may have ended before the relay was attached.
        if job.state().is_final() {
            self.job_terminated(job);
        }
        Ok(true)
    }

    /// Moves `job` from the active to the finished list. Only the first call
    /// for a job has any effect.
    fn job_terminated(&self, job: &Job) {
        {
            let mut lists = self.lock_lists();
            let Some(pos) = lists.active.iter().position(|j| j == job) else {
                return;
            };
            let job = lists.active.remove(pos);
            lists.finished.push(job);
        }
        tracing::debug!(job = %job.id(), state = %job.state(), "job moved to finished list");
        let listeners = self.inner.listeners.snapshot();
        for l in listeners.iter() {
            guarded("job_removed_from_active_list", || {
                l.job_removed_from_active_list(self, job)
            });
        }
        for l in listeners.iter() {
            guarded("job_added_to_finished_list", || l.job_added_to_finished_list(self, job));
        }
    }

    /// Empties the finished list and detaches the manager from those jobs.
    pub fn clear_finished_jobs(&self) {
        let flushed = std::mem::take(&mut self.lock_lists().finished);
        for job in &flushed {
            job.remove_job_listener(&self.inner.relay);
        }
        tracing::debug!(count = flushed.len(), "finished list flushed");
        for l in self.inner.listeners.snapshot().iter() {
            guarded("finished_list_flushed", || l.finished_list_flushed(self));
        }
    }

    /// Cancels every active job that can still be cancelled. Returns how many
    /// were.
    pub fn cancel_all(&self) -> usize {
        self.active_jobs()
            .iter()
            .filter(|job| job.cancel().is_ok())
            .count()
    }

    /// Stops accepting jobs. Refused while any job is still active.
    pub fn shutdown(&self) -> Result<(), JobError> {
        {
            // Registration checks the flag under the same lock.
            let lists = self.lock_lists();
            let count = lists.active.len();
            if count > 0 {
                return Err(JobError::ActiveJobsRemaining { count });
            }
            self.inner.shut_down.store(true, Ordering::Release);
        }
        self.clear_finished_jobs();
        tracing::info!("job manager shut down");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for JobManager {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for JobManager {}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lists = self.lock_lists();
        f.debug_struct("JobManager")
            .field("active", &lists.active.len())
            .field("finished", &lists.finished.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

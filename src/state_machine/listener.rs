use std::sync::Arc;

use arc_swap::ArcSwap;

use super::failure::JobFailureDescription;
use super::job::Job;
use super::state::{JobCommand, JobState};

/// Observer of a single job.
///
/// Callbacks run on the thread that caused the event: the caller of a command,
/// or the worker for progress, description and failure reports. Listeners may
/// call back into the job (e.g. `resume()` from `failer_emerged`); the
/// resulting events are delivered after the current callback returns.
pub trait JobListener: Send + Sync {
    fn state_changed(&self, _job: &Job, _old: JobState, _new: JobState, _command: JobCommand) {}

    fn progress_changed(&self, _job: &Job, _percentage: i32) {}

    fn description_changed(&self, _job: &Job, _description: &str) {}

    /// A failure needs resolving. If the job is in `Failure`/`UndoFailure`, the
    /// worker stays blocked until someone resumes, cancels or rolls back.
    fn failer_emerged(&self, _job: &Job, _failure: &Arc<JobFailureDescription>) {}
}

/// Copy-on-write set of listeners.
///
/// Notification iterates a snapshot, so adding or removing during a callback
/// never affects the delivery already in progress.
pub struct ListenerSet<L: ?Sized> {
    inner: ArcSwap<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Adds `listener` unless the same instance is already present.
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut added = false;
        self.inner.rcu(|current| {
            if current.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                added = false;
                Arc::clone(current)
            } else {
                added = true;
                let mut next = Vec::with_capacity(current.len() + 1);
                next.extend(current.iter().cloned());
                next.push(Arc::clone(&listener));
                Arc::new(next)
            }
        });
        added
    }

    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut removed = false;
        self.inner.rcu(|current| {
            removed = current.iter().any(|l| Arc::ptr_eq(l, listener));
            if !removed {
                return Arc::clone(current);
            }
            let next: Vec<Arc<L>> = current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect();
            Arc::new(next)
        });
        removed
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.inner.load_full()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    pub fn clear(&self) {
        self.inner.store(Arc::new(Vec::new()));
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a listener callback, containing a panic so the remaining listeners
/// and the caller keep going.
pub(crate) fn guarded(what: &str, f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::error!(callback = what, "listener panicked; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct N(&'static str);

    impl Named for N {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn add_is_idempotent_per_instance() {
        let set: ListenerSet<dyn Named> = ListenerSet::new();
        let a: Arc<dyn Named> = Arc::new(N("a"));
        assert!(set.add(Arc::clone(&a)));
        assert!(!set.add(Arc::clone(&a)));
        assert!(set.add(Arc::new(N("a"))));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn remove_only_matches_same_instance() {
        let set: ListenerSet<dyn Named> = ListenerSet::new();
        let a: Arc<dyn Named> = Arc::new(N("a"));
        let b: Arc<dyn Named> = Arc::new(N("b"));
        set.add(Arc::clone(&a));
        set.add(Arc::clone(&b));
        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        let names: Vec<_> = set.snapshot().iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_mutation() {
        let set: ListenerSet<dyn Named> = ListenerSet::new();
        let a: Arc<dyn Named> = Arc::new(N("a"));
        set.add(Arc::clone(&a));
        let snapshot = set.snapshot();
        set.remove(&a);
        set.add(Arc::new(N("c")));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name(), "a");
        assert_eq!(set.snapshot()[0].name(), "c");
    }

    #[test]
    fn guarded_contains_panics() {
        let mut ran_after = false;
        guarded("test", || panic!("boom"));
        guarded("test", || ran_after = true);
        assert!(ran_after);
    }
}

//! The scheduler capability consumed by the task engine.
//!
//! A scheduler is anything that can run a queued thunk exactly once. The
//! engine never owns threads; it only posts [`Job`]s. Continuations capture
//! a [`SchedulerHandle`] at attach time, which is the type-erased adapter
//! that later forwards the queued run thunk to the right execution context.

use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

/// A queued unit of work: move-only, invoked exactly once.
pub type Job = Box<dyn FnOnce() + Send>;

/// The capability of queueing thunks for later (or immediate) execution.
pub trait Scheduler {
    /// Queues a job. Each job must run exactly once.
    fn schedule(&self, job: Job);

    /// Returns an owned handle that continuations keep to queue onto this
    /// scheduler after their parent completes.
    fn handle(&self) -> SchedulerHandle;
}

/// Owned, cheap-clone posting handle onto some scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    post: Arc<dyn Fn(Job) + Send + Sync>,
}

impl SchedulerHandle {
    /// Wraps a posting closure.
    pub fn new(post: impl Fn(Job) + Send + Sync + 'static) -> Self {
        Self {
            post: Arc::new(post),
        }
    }

    /// The handle that invokes jobs on the calling thread.
    #[must_use]
    pub fn inline() -> Self {
        static INLINE: OnceLock<SchedulerHandle> = OnceLock::new();
        INLINE
            .get_or_init(|| SchedulerHandle::new(|job| job()))
            .clone()
    }

    /// Posts a job through this handle.
    pub fn post(&self, job: Job) {
        (self.post)(job);
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SchedulerHandle")
    }
}

impl Scheduler for SchedulerHandle {
    fn schedule(&self, job: Job) {
        self.post(job);
    }

    fn handle(&self) -> SchedulerHandle {
        self.clone()
    }
}

/// Runs each thunk immediately on the caller.
///
/// Used for continuations that must observe results without a context hop:
/// completion-source plumbing, state-machine wiring, `when_all` aggregation.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, job: Job) {
        job();
    }

    fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::inline()
    }
}

/// Thread affinity of a dispatcher.
///
/// Once set, affinity-checked entry points must be called from that thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Affinity {
    thread: Option<ThreadId>,
}

impl Affinity {
    /// An affinity bound to the calling thread.
    #[must_use]
    pub fn here() -> Self {
        Self {
            thread: Some(thread::current().id()),
        }
    }

    /// No affinity: every thread passes the check.
    #[must_use]
    pub const fn any() -> Self {
        Self { thread: None }
    }

    /// Returns true if the calling thread satisfies this affinity.
    #[must_use]
    pub fn check(&self) -> bool {
        match self.thread {
            Some(id) => thread::current().id() == id,
            None => true,
        }
    }

    /// Returns true if an affinity thread is set.
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.thread.is_some()
    }
}

/// Schedulers that know which thread they drain on.
pub trait HasAffinity {
    /// The scheduler's current affinity.
    fn affinity(&self) -> Affinity;
}

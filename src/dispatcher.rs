//! Queue-backed schedulers.
//!
//! [`ManualDispatcher`] is a work queue drained explicitly with
//! [`tick`](ManualDispatcher::tick); tests and single-threaded hosts use it
//! to control exactly when continuations run. [`BackgroundDispatcher`] owns
//! one worker thread that drains the same kind of queue until cancelled.
//!
//! A tick drains the *current batch*: jobs queued while the batch runs land
//! in the next tick. This is what gives dispatcher-driven chains their
//! breadth-first ordering.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::cancellation::{Cancellation, CancellationSource};
use crate::containers::Ticket;
use crate::scheduler::{Affinity, HasAffinity, Job, Scheduler, SchedulerHandle};
use crate::tracing_compat::debug;

struct QueueCore {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
    affinity: Mutex<Affinity>,
}

impl QueueCore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            affinity: Mutex::new(Affinity::any()),
        })
    }

    fn push(&self, job: Job) {
        self.jobs.lock().push_back(job);
        self.available.notify_all();
    }

    /// Takes the whole current batch, leaving the queue ready for jobs
    /// queued by the batch itself.
    fn drain(&self) -> VecDeque<Job> {
        std::mem::take(&mut *self.jobs.lock())
    }

    fn blocking_drain(&self, cancel: &Cancellation) -> VecDeque<Job> {
        let mut jobs = self.jobs.lock();
        while jobs.is_empty() && !cancel.cancelled() {
            self.available.wait(&mut jobs);
        }
        std::mem::take(&mut *jobs)
    }
}

/// A dispatcher drained by explicit `tick` calls.
///
/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct ManualDispatcher {
    core: Arc<QueueCore>,
}

impl ManualDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: QueueCore::new(),
        }
    }

    /// Runs the current batch of jobs.
    ///
    /// Returns true if at least one job ran. Jobs queued while the batch
    /// runs are deferred to the next tick. `cancel` is consulted on entry;
    /// once a batch is taken every job in it runs, per the exactly-once
    /// scheduler contract.
    pub fn tick(&self, cancel: &Cancellation) -> bool {
        if cancel.cancelled() {
            return false;
        }
        let batch = self.core.drain();
        if batch.is_empty() {
            return false;
        }
        for job in batch {
            job();
        }
        true
    }

    /// Like [`tick`](Self::tick), but blocks until work arrives or `cancel`
    /// is requested. Wake-up on cancellation requires [`notify`](Self::notify)
    /// to be wired to the token (the background dispatcher does this).
    pub fn blocking_tick(&self, cancel: &Cancellation) -> bool {
        let batch = self.core.blocking_drain(cancel);
        if batch.is_empty() {
            return false;
        }
        for job in batch {
            job();
        }
        true
    }

    /// Wakes any thread blocked in [`blocking_tick`](Self::blocking_tick).
    pub fn notify(&self) {
        self.core.available.notify_all();
    }

    /// Discards all queued jobs.
    pub fn clear(&self) {
        self.core.jobs.lock().clear();
    }

    /// Number of jobs waiting in the queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.core.jobs.lock().len()
    }

    /// Binds the drain side of this dispatcher to a thread.
    pub fn set_affinity(&self, affinity: Affinity) {
        *self.core.affinity.lock() = affinity;
    }
}

impl Default for ManualDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManualDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualDispatcher")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Scheduler for ManualDispatcher {
    fn schedule(&self, job: Job) {
        self.core.push(job);
    }

    fn handle(&self) -> SchedulerHandle {
        let core = Arc::clone(&self.core);
        SchedulerHandle::new(move |job| core.push(job))
    }
}

impl HasAffinity for ManualDispatcher {
    fn affinity(&self) -> Affinity {
        *self.core.affinity.lock()
    }
}

/// A dispatcher drained by a dedicated worker thread.
///
/// The worker loops on `blocking_tick` under the dispatcher's own
/// cancellation source; `cancel` (or drop) requests cancellation, wakes the
/// worker, joins it, and clears the queue.
pub struct BackgroundDispatcher {
    queue: ManualDispatcher,
    cancel: CancellationSource,
    _registration: Ticket,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundDispatcher {
    /// Spawns the worker thread.
    #[must_use]
    pub fn new() -> Self {
        let queue = ManualDispatcher::new();
        let cancel = CancellationSource::new();

        let waker = queue.clone();
        let registration = cancel.add_requested_listener(move || waker.notify());

        let worker_queue = queue.clone();
        let token = cancel.token();
        let worker = std::thread::spawn(move || {
            worker_queue.set_affinity(Affinity::here());
            debug!("background dispatcher started");
            while !token.cancelled() {
                worker_queue.blocking_tick(&token);
            }
            debug!("background dispatcher stopped");
        });

        Self {
            queue,
            cancel,
            _registration: registration,
            worker: Some(worker),
        }
    }

    /// Stops the worker: requests cancellation, joins, clears the queue.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.queue.clear();
    }
}

impl Default for BackgroundDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackgroundDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundDispatcher")
            .field("pending", &self.queue.pending())
            .finish()
    }
}

impl Drop for BackgroundDispatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Scheduler for BackgroundDispatcher {
    fn schedule(&self, job: Job) {
        self.queue.schedule(job);
    }

    fn handle(&self) -> SchedulerHandle {
        self.queue.handle()
    }
}

impl HasAffinity for BackgroundDispatcher {
    fn affinity(&self) -> Affinity {
        self.queue.affinity()
    }
}

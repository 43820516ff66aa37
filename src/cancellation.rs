//! Broadcast-once cancellation with ordered listener tickets and pinning.
//!
//! A cancellation source moves through `not_started -> started -> finished`.
//! The two observable edges are *requested* (the `started` transition) and
//! *completed* (the `finished` transition). A pin holds the source in the
//! `started` state so in-flight work can flush before cancellation is
//! declared complete; the last pin dropped performs the finish transition.
//!
//! Listeners fire in reverse registration order: registrations installed by
//! later (inner) code are released before the registrations of the code that
//! installed them. Listeners always run outside the source's mutex, and a
//! listener registered while a fire pass is running is not invoked in that
//! same pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};

use crate::containers::{Ticket, TicketedCollection};
use crate::error::ErrorCode;
use crate::tracing_compat::{debug, trace};

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Started,
    Finished,
}

struct CancelState {
    phase: Phase,
    pins: usize,
    requested: TicketedCollection<Listener>,
    completed: TicketedCollection<Listener>,
}

struct CancelInner {
    state: Mutex<CancelState>,
    finished_cv: Condvar,
    cancelled: AtomicBool,
    inert: bool,
}

impl CancelInner {
    fn new(inert: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CancelState {
                phase: Phase::NotStarted,
                pins: 0,
                requested: TicketedCollection::new(),
                completed: TicketedCollection::new(),
            }),
            finished_cv: Condvar::new(),
            cancelled: AtomicBool::new(false),
            inert,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Finish transition: must be called with the state lock held and the
    /// preconditions (`phase == Started`, `pins == 0`) verified. Returns the
    /// completed-listener snapshot to fire outside the lock.
    fn finish_locked(&self, state: &mut CancelState) -> Vec<Listener> {
        state.phase = Phase::Finished;
        self.finished_cv.notify_all();
        state.completed.snapshot()
    }

    fn fire_reversed(listeners: Vec<Listener>) {
        for listener in listeners.into_iter().rev() {
            listener();
        }
    }
}

/// Observer handle onto a cancellation source.
///
/// Cheap to clone; all clones observe the same source. Obtain one from a
/// [`CancellationSource`] or use [`Cancellation::none`] for operations that
/// cannot be cancelled.
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<CancelInner>,
}

impl std::fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

impl Cancellation {
    /// The process-wide inert source: never reports cancelled, and listener
    /// registration returns an inert ticket.
    #[must_use]
    pub fn none() -> &'static Self {
        static NONE: OnceLock<Cancellation> = OnceLock::new();
        NONE.get_or_init(|| Self {
            inner: CancelInner::new(true),
        })
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Fails with the cancellation code when cancellation was requested.
    pub fn check(&self) -> Result<(), ErrorCode> {
        if self.cancelled() {
            Err(ErrorCode::operation_cancelled())
        } else {
            Ok(())
        }
    }

    /// Registers a listener for the *requested* edge.
    ///
    /// If cancellation has already been requested the listener is invoked
    /// synchronously before this returns. The ticket's drop removes the
    /// listener under the source's mutex.
    pub fn add_requested_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> Ticket {
        self.add_listener(listener, false)
    }

    /// Registers a listener for the *completed* edge; symmetric to
    /// [`add_requested_listener`](Self::add_requested_listener), firing
    /// synchronously iff the source is already finished.
    pub fn add_completed_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> Ticket {
        self.add_listener(listener, true)
    }

    fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static, completed: bool) -> Ticket {
        if self.inner.inert {
            return Ticket::inert();
        }

        let listener: Listener = Arc::new(listener);
        let fire_now;
        let id;
        {
            let mut state = self.inner.lock();
            fire_now = if completed {
                state.phase == Phase::Finished
            } else {
                state.phase != Phase::NotStarted
            };
            id = if completed {
                state.completed.insert(Arc::clone(&listener))
            } else {
                state.requested.insert(Arc::clone(&listener))
            };
        }

        if fire_now {
            listener();
        }

        let weak: Weak<CancelInner> = Arc::downgrade(&self.inner);
        Ticket::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.lock();
                if completed {
                    state.completed.remove(id);
                } else {
                    state.requested.remove(id);
                }
            }
        })
    }

    /// Holds the source in the `started` state until the guard drops.
    ///
    /// Returns `None` once cancellation has been requested: work that failed
    /// to pin must not start. While at least one pin is live, a cancel
    /// request fires the requested edge but defers the completed edge; the
    /// last pin dropped performs the finish transition.
    #[must_use]
    pub fn pin(&self) -> Option<CancellationPin> {
        if self.inner.inert {
            // The inert source can always be pinned; the guard does nothing.
            return Some(CancellationPin { inner: None });
        }

        let mut state = self.inner.lock();
        if state.phase != Phase::NotStarted {
            return None;
        }
        state.pins += 1;
        trace!(pins = state.pins, "cancellation pinned");
        Some(CancellationPin {
            inner: Some(Arc::clone(&self.inner)),
        })
    }
}

/// RAII guard deferring the *completed* edge of a cancellation source.
#[derive(Debug)]
pub struct CancellationPin {
    inner: Option<Arc<CancelInner>>,
}

impl std::fmt::Debug for CancelInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelInner")
            .field("inert", &self.inert)
            .finish()
    }
}

impl Drop for CancellationPin {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let to_fire = {
            let mut state = inner.lock();
            state.pins -= 1;
            trace!(pins = state.pins, "cancellation unpinned");
            if state.pins == 0 && state.phase == Phase::Started {
                inner.finish_locked(&mut state)
            } else {
                Vec::new()
            }
        };
        CancelInner::fire_reversed(to_fire);
    }
}

/// Owner handle: the only way to request cancellation.
///
/// Dereferences to [`Cancellation`] for the observer surface.
#[derive(Clone, Debug)]
pub struct CancellationSource {
    handle: Cancellation,
}

impl CancellationSource {
    /// Creates a fresh, un-cancelled source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handle: Cancellation {
                inner: CancelInner::new(false),
            },
        }
    }

    /// Returns an observer handle onto this source.
    #[must_use]
    pub fn token(&self) -> Cancellation {
        self.handle.clone()
    }

    /// Requests cancellation.
    ///
    /// Transitions `not_started -> started` and fires requested listeners in
    /// reverse registration order; if no pin is live, additionally
    /// transitions to `finished` and fires completed listeners. Calling
    /// twice has the same effect as calling once.
    pub fn cancel(&self) {
        let inner = &self.handle.inner;
        let requested = {
            let mut state = inner.lock();
            if state.phase != Phase::NotStarted {
                return;
            }
            state.phase = Phase::Started;
            inner.cancelled.store(true, Ordering::Release);
            debug!(listeners = state.requested.len(), "cancellation requested");
            state.requested.snapshot()
        };
        CancelInner::fire_reversed(requested);

        let completed = {
            let mut state = inner.lock();
            if state.pins == 0 && state.phase == Phase::Started {
                debug!("cancellation finished");
                inner.finish_locked(&mut state)
            } else {
                Vec::new()
            }
        };
        CancelInner::fire_reversed(completed);
    }

    /// Requests cancellation and blocks until the source reaches `finished`.
    pub fn cancel_and_wait(&self) {
        self.cancel();
        let inner = &self.handle.inner;
        let mut state = inner.lock();
        while state.phase != Phase::Finished {
            state = match inner.finished_cv.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for CancellationSource {
    type Target = Cancellation;

    fn deref(&self) -> &Cancellation {
        &self.handle
    }
}

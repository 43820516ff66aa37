//! The internal node backing tasks and completion sources.
//!
//! A payload moves from `pending` to `completed` exactly once. Completion
//! takes ownership of the continuation list under the payload mutex, then
//! fires every continuation outside it. Attachment follows redirects
//! (lock-hop, one mutex at a time), fires immediately on completed payloads,
//! and otherwise appends.
//!
//! A pending continuation holds only its child payload and a scheduling
//! handle; the strong reference to the parent is handed to the queued run
//! thunk for just the duration of the dispatch, so there is never a strong
//! edge from a pending continuation back to its parent.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use smallvec::SmallVec;

use crate::error::ErrorChannel;
use crate::expected::Expected;
use crate::scheduler::SchedulerHandle;

/// A queued child: fired with a strong reference to the (possibly
/// reparented) payload that now holds its input.
pub(crate) struct Continuation<T, E> {
    fire: Box<dyn FnOnce(Arc<Payload<T, E>>) + Send>,
}

impl<T, E> Continuation<T, E> {
    fn fire(self, parent: Arc<Payload<T, E>>) {
        (self.fire)(parent);
    }
}

type ContinuationList<T, E> = SmallVec<[Continuation<T, E>; 1]>;

struct NodeState<T, E> {
    completed: bool,
    continuations: ContinuationList<T, E>,
    /// Forwarding address installed by the unwrap protocol. Once set, this
    /// payload never completes itself; attachments walk to the target.
    redirect: Option<Arc<Payload<T, E>>>,
}

/// Shared-owned task node.
pub(crate) struct Payload<T, E> {
    weak_self: Weak<Payload<T, E>>,
    result: OnceLock<Expected<T, E>>,
    state: Mutex<NodeState<T, E>>,
}

impl<T, E> Payload<T, E>
where
    T: Send + Sync + 'static,
    E: ErrorChannel,
{
    pub(crate) fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            result: OnceLock::new(),
            state: Mutex::new(NodeState {
                completed: false,
                continuations: SmallVec::new(),
                redirect: None,
            }),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .unwrap_or_else(|| unreachable!("payload methods run behind a strong handle"))
    }

    fn lock(&self) -> MutexGuard<'_, NodeState<T, E>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn completed(&self) -> bool {
        self.lock().completed
    }

    /// The completed result. Only reachable from continuation thunks, which
    /// are handed their parent strictly after its result is published.
    pub(crate) fn result(&self) -> &Expected<T, E> {
        self.result
            .get()
            .unwrap_or_else(|| unreachable!("task result read before completion"))
    }

    /// Completion protocol: publish the result, take the continuation list,
    /// then fire each continuation outside the mutex.
    ///
    /// # Panics
    ///
    /// Panics if the payload already completed (or was collapsed into
    /// another task): completing twice is a programmer error.
    pub(crate) fn complete(&self, result: Expected<T, E>) {
        let continuations = {
            let mut state = self.lock();
            assert!(!state.completed, "task completed twice");
            if self.result.set(result).is_err() {
                unreachable!("task result slot set twice");
            }
            state.completed = true;
            std::mem::take(&mut state.continuations)
        };

        let this = self.strong();
        for continuation in continuations {
            continuation.fire(Arc::clone(&this));
        }
    }

    /// Attachment protocol: walk redirects, fire immediately when the
    /// target has completed, append otherwise.
    pub(crate) fn add_continuation(&self, continuation: Continuation<T, E>) {
        let mut target = self.strong();
        loop {
            enum Next<T, E> {
                Walk(Arc<Payload<T, E>>),
                FireNow,
            }

            let next = {
                let mut state = target.lock();
                if let Some(redirect) = &state.redirect {
                    Next::Walk(Arc::clone(redirect))
                } else if state.completed {
                    Next::FireNow
                } else {
                    state.continuations.push(continuation);
                    return;
                }
            };

            match next {
                Next::Walk(redirect) => target = redirect,
                Next::FireNow => {
                    continuation.fire(target);
                    return;
                }
            }
        }
    }

    /// Unwrap splice: atomically take this payload's continuations, mark it
    /// completed, and leave a forwarding address. The caller reattaches the
    /// taken continuations to the redirect target, which reparents them.
    ///
    /// # Panics
    ///
    /// Panics if the payload already completed; the stand-in source of an
    /// unwrap must still be pending when its inner task materializes.
    pub(crate) fn collapse_into(&self, inner: &Arc<Self>) {
        let continuations = {
            let mut state = self.lock();
            assert!(!state.completed, "task completed twice");
            state.completed = true;
            state.redirect = Some(Arc::clone(inner));
            std::mem::take(&mut state.continuations)
        };

        for continuation in continuations {
            inner.add_continuation(continuation);
        }
    }
}

/// Builds a child payload and wires it as a continuation of `parent`.
///
/// `work` receives the parent result by reference and produces the child
/// result; it runs inside the queued thunk, on `scheduler`, after the parent
/// completes. The thunk owns the strong parent reference for the duration of
/// the dispatch, keeping the input alive without creating a cycle.
pub(crate) fn attach<T, E, U, E2, W>(
    parent: &Arc<Payload<T, E>>,
    scheduler: SchedulerHandle,
    work: W,
) -> Arc<Payload<U, E2>>
where
    T: Send + Sync + 'static,
    E: ErrorChannel,
    U: Send + Sync + 'static,
    E2: ErrorChannel,
    W: FnOnce(&Expected<T, E>) -> Expected<U, E2> + Send + 'static,
{
    let child = Payload::<U, E2>::new();
    let queued_child = Arc::clone(&child);

    parent.add_continuation(Continuation {
        fire: Box::new(move |parent: Arc<Payload<T, E>>| {
            scheduler.post(Box::new(move || {
                let result = work(parent.result());
                queued_child.complete(result);
            }));
        }),
    });

    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn inline() -> SchedulerHandle {
        SchedulerHandle::inline()
    }

    #[test]
    fn attach_before_completion_defers() {
        let parent = Payload::<i32, ErrorCode>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let child = attach(&parent, inline(), move |input: &Expected<i32, ErrorCode>| {
            h.fetch_add(1, Ordering::SeqCst);
            Expected::<i32, ErrorCode>::from_value(*input.value() + 1)
        });

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        parent.complete(Expected::from_value(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(*child.result().value(), 2);
    }

    #[test]
    fn attach_after_completion_fires_immediately() {
        let parent = Payload::<i32, ErrorCode>::new();
        parent.complete(Expected::from_value(5));

        let child = attach(&parent, inline(), |input: &Expected<i32, ErrorCode>| {
            Expected::<i32, ErrorCode>::from_value(input.value() * 2)
        });
        assert_eq!(*child.result().value(), 10);
    }

    #[test]
    #[should_panic(expected = "task completed twice")]
    fn double_completion_is_fatal() {
        let payload = Payload::<(), ErrorCode>::new();
        payload.complete(Expected::valid());
        payload.complete(Expected::valid());
    }

    #[test]
    fn collapse_moves_continuations_to_the_inner_payload() {
        let stand_in = Payload::<i32, ErrorCode>::new();
        let inner = Payload::<i32, ErrorCode>::new();

        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        attach(&stand_in, inline(), move |input: &Expected<i32, ErrorCode>| {
            s.store(usize::try_from(*input.value()).unwrap(), Ordering::SeqCst);
            Expected::<(), ErrorCode>::valid()
        });

        stand_in.collapse_into(&inner);
        assert!(stand_in.completed());
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        inner.complete(Expected::from_value(42));
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn attachment_after_collapse_walks_the_redirect() {
        let stand_in = Payload::<i32, ErrorCode>::new();
        let inner = Payload::<i32, ErrorCode>::new();
        stand_in.collapse_into(&inner);

        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        attach(&stand_in, inline(), move |input: &Expected<i32, ErrorCode>| {
            s.store(usize::try_from(*input.value()).unwrap(), Ordering::SeqCst);
            Expected::<(), ErrorCode>::valid()
        });

        inner.complete(Expected::from_value(7));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn redirect_chains_are_walked_to_the_tail() {
        let first = Payload::<i32, ErrorCode>::new();
        let second = Payload::<i32, ErrorCode>::new();
        let third = Payload::<i32, ErrorCode>::new();
        first.collapse_into(&second);
        second.collapse_into(&third);

        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        attach(&first, inline(), move |input: &Expected<i32, ErrorCode>| {
            s.store(usize::try_from(*input.value()).unwrap(), Ordering::SeqCst);
            Expected::<(), ErrorCode>::valid()
        });

        third.complete(Expected::from_value(3));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}

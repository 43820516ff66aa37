//! In-flight task tracking for shutdown flushing.
//!
//! Components that keep spawning chained work register each chain here;
//! shutdown cancels the component's token and awaits
//! [`when_all`](PendingTaskScope::when_all), which resolves once every
//! tracked task has reached a terminal state. The first error observed by
//! the scope is sticky and carried by the flush task.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{task_from_error, task_from_result, Task, TaskCompletionSource};
use crate::cancellation::Cancellation;
use crate::error::ErrorChannel;
use crate::expected::Expected;
use crate::scheduler::InlineScheduler;

struct ScopeState<E> {
    pending: usize,
    error: Option<E>,
    waiter: Option<TaskCompletionSource<(), E>>,
}

/// Tracks outstanding unit tasks until they all complete.
pub struct PendingTaskScope<E: ErrorChannel> {
    inner: Arc<Mutex<ScopeState<E>>>,
}

fn lock<E>(inner: &Mutex<ScopeState<E>>) -> MutexGuard<'_, ScopeState<E>> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<E: ErrorChannel> PendingTaskScope<E> {
    /// Creates an empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScopeState {
                pending: 0,
                error: None,
                waiter: None,
            })),
        }
    }

    /// Tracks a task until it completes.
    pub fn add(&self, task: &Task<(), E>) {
        lock(&self.inner).pending += 1;

        let inner = Arc::clone(&self.inner);
        task.then_expected(
            &InlineScheduler,
            Cancellation::none(),
            move |exp: &Expected<(), E>| {
                let release = {
                    let mut state = lock(&inner);
                    state.pending -= 1;
                    if let Err(error) = exp.as_result() {
                        if state.error.is_none() {
                            state.error = Some(error.clone());
                        }
                    }
                    if state.pending == 0 {
                        state.waiter.take().map(|waiter| (waiter, state.error.clone()))
                    } else {
                        None
                    }
                };
                if let Some((waiter, error)) = release {
                    match error {
                        Some(error) => waiter.complete_expected(Expected::from_error(error)),
                        None => waiter.complete(()),
                    }
                }
            },
        );
    }

    /// Returns true when no tracked task is still pending.
    #[must_use]
    pub fn completed(&self) -> bool {
        lock(&self.inner).pending == 0
    }

    /// Returns true if any tracked task has failed.
    #[must_use]
    pub fn has_error(&self) -> bool {
        lock(&self.inner).error.is_some()
    }

    /// The first error observed by the scope, if any.
    #[must_use]
    pub fn error(&self) -> Option<E> {
        lock(&self.inner).error.clone()
    }

    /// A task resolving when every tracked task has completed.
    ///
    /// Resolves synchronously if the scope is already quiescent; carries the
    /// scope's sticky error either way.
    #[must_use]
    pub fn when_all(&self) -> Task<(), E> {
        let mut state = lock(&self.inner);
        if state.pending == 0 {
            return match &state.error {
                Some(error) => task_from_error(error.clone()),
                None => task_from_result(()),
            };
        }
        state
            .waiter
            .get_or_insert_with(TaskCompletionSource::new)
            .as_task()
    }
}

impl<E: ErrorChannel> Default for PendingTaskScope<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ErrorChannel> std::fmt::Debug for PendingTaskScope<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner);
        f.debug_struct("PendingTaskScope")
            .field("pending", &state.pending)
            .field("has_error", &state.error.is_some())
            .finish()
    }
}

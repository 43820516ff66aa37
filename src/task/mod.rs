//! Tasks, completion sources, and continuation composition.
//!
//! A [`Task`] is a cheap-clone handle onto a shared payload node. Work runs
//! on whatever [`Scheduler`] each continuation was attached with; results
//! flow forward by reference, errors and cancellation short-circuit unless a
//! continuation takes the full [`Expected`] and recovers.
//!
//! The continuation family is split by input and output shape:
//!
//! | method | input | output |
//! |---|---|---|
//! | [`Task::then`] | `&T` | value |
//! | [`Task::then_result`] | `&T` | `Expected` |
//! | [`Task::then_task`] | `&T` | `Task` (unwrapped) |
//! | [`Task::then_expected`] | `&Expected<T, E>` | value |
//! | [`Task::then_expected_result`] | `&Expected<T, E>` | `Expected` |
//! | [`Task::then_expected_task`] | `&Expected<T, E>` | `Task` (unwrapped) |
//!
//! Value-input continuations never see a parent error: it is forwarded to
//! their child (upgraded across channels when needed). Expected-input
//! continuations always run and may recover, except when their cancellation
//! token has fired, which short-circuits the child to *cancelled* either way.

mod payload;
mod scope;
mod when_all;

pub use scope::PendingTaskScope;
pub use when_all::{when_all, when_all2, when_all3, when_all_void};

use std::any::Any;
use std::sync::Arc;

use payload::{attach, Payload};

use crate::cancellation::Cancellation;
use crate::error::{ErrorCapsule, ErrorChannel, ErrorCode, ErrorUnion, IntoError};
use crate::expected::Expected;
use crate::scheduler::{Scheduler, SchedulerHandle};

/// Adapts a value-input continuation: forwards parent errors (upgrading the
/// channel when needed), short-circuits on cancellation, and runs the user
/// work under the child channel's invocation discipline.
fn forward_value<T, E, U, E2, F>(
    cancel: Cancellation,
    f: F,
) -> impl FnOnce(&Expected<T, E>) -> Expected<U, E2> + Send + 'static
where
    E: IntoError<E2>,
    E2: ErrorChannel,
    F: FnOnce(&T) -> Expected<U, E2> + Send + 'static,
{
    move |input| match input.as_result() {
        Err(error) => Expected::from_error(error.clone().into_error()),
        Ok(value) => {
            if cancel.cancelled() {
                Expected::from_error(E2::cancelled())
            } else {
                E2::run(|| f(value))
            }
        }
    }
}

/// Adapts an expected-input continuation: the user work always runs (it may
/// recover from the parent error), unless cancellation has fired.
fn forward_expected<T, E, U, E2, F>(
    cancel: Cancellation,
    f: F,
) -> impl FnOnce(&Expected<T, E>) -> Expected<U, E2> + Send + 'static
where
    E: ErrorChannel,
    E2: ErrorChannel,
    F: FnOnce(&Expected<T, E>) -> Expected<U, E2> + Send + 'static,
{
    move |input| {
        if cancel.cancelled() {
            Expected::from_error(E2::cancelled())
        } else {
            E2::run(|| f(input))
        }
    }
}

/// A handle onto an asynchronous computation producing `Expected<T, E>`.
///
/// Tasks clone cheaply; all clones share one payload, and equality compares
/// payload identity.
pub struct Task<T, E> {
    pub(crate) payload: Arc<Payload<T, E>>,
}

impl<T, E> Clone for Task<T, E> {
    fn clone(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
        }
    }
}

impl<T, E> PartialEq for Task<T, E> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }
}

impl<T, E> std::fmt::Debug for Task<T, E>
where
    T: Send + Sync + 'static,
    E: ErrorChannel,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("completed", &self.payload.completed())
            .finish()
    }
}

impl<T, E> Task<T, E>
where
    T: Send + Sync + 'static,
    E: ErrorChannel,
{
    /// Runs `f` with the parent value once this task completes.
    ///
    /// Parent errors and cancellation bypass `f` and flow to the child.
    pub fn then<S, F, U>(&self, scheduler: &S, cancel: &Cancellation, f: F) -> Task<U, E>
    where
        S: Scheduler + ?Sized,
        F: FnOnce(&T) -> U + Send + 'static,
        U: Send + Sync + 'static,
    {
        let work = forward_value(cancel.clone(), move |value: &T| {
            Expected::from_value(f(value))
        });
        Task {
            payload: attach(&self.payload, scheduler.handle(), work),
        }
    }

    /// Like [`then`](Self::then), but `f` reports success or failure itself.
    ///
    /// The child's error channel `E2` may upgrade the parent's (never
    /// downgrade).
    pub fn then_result<S, F, U, E2>(&self, scheduler: &S, cancel: &Cancellation, f: F) -> Task<U, E2>
    where
        S: Scheduler + ?Sized,
        F: FnOnce(&T) -> Expected<U, E2> + Send + 'static,
        U: Send + Sync + 'static,
        E2: ErrorChannel,
        E: IntoError<E2>,
    {
        Task {
            payload: attach(
                &self.payload,
                scheduler.handle(),
                forward_value(cancel.clone(), f),
            ),
        }
    }

    /// Like [`then`](Self::then), but `f` returns a task; the result is
    /// unwrapped so the visible child produces `U`, not a task-of-`U`.
    ///
    /// The child's channel is the upper bound of `E` and the inner task's
    /// `E2`. Unwrapping splices the inner task into the chain (redirect
    /// collapse), so recursively generated tasks run in constant space.
    pub fn then_task<S, F, U, E2>(
        &self,
        scheduler: &S,
        cancel: &Cancellation,
        f: F,
    ) -> Task<U, <E as ErrorUnion<E2>>::Output>
    where
        S: Scheduler + ?Sized,
        F: FnOnce(&T) -> Task<U, E2> + Send + 'static,
        U: Send + Sync + 'static,
        E2: ErrorChannel,
        E: ErrorUnion<E2> + IntoError<<E as ErrorUnion<E2>>::Output>,
        Task<U, E2>: CollapseInto<U, <E as ErrorUnion<E2>>::Output>,
    {
        let work = forward_value(cancel.clone(), move |value: &T| {
            Expected::from_value(f(value))
        });
        let nested = attach(&self.payload, scheduler.handle(), work);
        unwrap_nested(&nested)
    }

    /// Runs `f` with the full parent result (error included) once this task
    /// completes; the recovery point of a chain.
    pub fn then_expected<S, F, U>(&self, scheduler: &S, cancel: &Cancellation, f: F) -> Task<U, E>
    where
        S: Scheduler + ?Sized,
        F: FnOnce(&Expected<T, E>) -> U + Send + 'static,
        U: Send + Sync + 'static,
    {
        let work = forward_expected(cancel.clone(), move |input: &Expected<T, E>| {
            Expected::from_value(f(input))
        });
        Task {
            payload: attach(&self.payload, scheduler.handle(), work),
        }
    }

    /// Recovery continuation that reports success or failure itself.
    pub fn then_expected_result<S, F, U, E2>(
        &self,
        scheduler: &S,
        cancel: &Cancellation,
        f: F,
    ) -> Task<U, E2>
    where
        S: Scheduler + ?Sized,
        F: FnOnce(&Expected<T, E>) -> Expected<U, E2> + Send + 'static,
        U: Send + Sync + 'static,
        E2: ErrorChannel,
        E: IntoError<E2>,
    {
        Task {
            payload: attach(
                &self.payload,
                scheduler.handle(),
                forward_expected(cancel.clone(), f),
            ),
        }
    }

    /// Recovery continuation returning a task, unwrapped like
    /// [`then_task`](Self::then_task).
    pub fn then_expected_task<S, F, U, E2>(
        &self,
        scheduler: &S,
        cancel: &Cancellation,
        f: F,
    ) -> Task<U, <E as ErrorUnion<E2>>::Output>
    where
        S: Scheduler + ?Sized,
        F: FnOnce(&Expected<T, E>) -> Task<U, E2> + Send + 'static,
        U: Send + Sync + 'static,
        E2: ErrorChannel,
        E: ErrorUnion<E2>,
        Task<U, E2>: CollapseInto<U, <E as ErrorUnion<E2>>::Output>,
    {
        let work = forward_expected(cancel.clone(), move |input: &Expected<T, E>| {
            Expected::from_value(f(input))
        });
        let nested = attach(&self.payload, scheduler.handle(), work);
        unwrap_nested(&nested)
    }
}

/// The unwrap protocol: a stand-in source becomes the visible child; a shim
/// continuation on the task-of-task either completes the stand-in with the
/// error, or collapses it into the produced inner task.
fn unwrap_nested<U, E2, EOut>(nested: &Arc<Payload<Task<U, E2>, EOut>>) -> Task<U, EOut>
where
    U: Send + Sync + 'static,
    E2: ErrorChannel,
    EOut: ErrorChannel,
    Task<U, E2>: CollapseInto<U, EOut>,
{
    let source = TaskCompletionSource::<U, EOut>::new();
    let stand_in = source.clone();
    attach(
        nested,
        SchedulerHandle::inline(),
        move |produced: &Expected<Task<U, E2>, EOut>| {
            match produced.as_result() {
                Err(error) => stand_in.complete_expected(Expected::from_error(error.clone())),
                Ok(inner) => inner.clone().collapse_into(&stand_in),
            }
            Expected::<(), EOut>::valid()
        },
    );
    source.into_task()
}

/// Completes a stand-in source of the unwrap protocol with this task's
/// eventual result.
///
/// The same-channel case splices payloads directly (redirect collapse); the
/// `code`-into-`capsule` boundary completes through a converting
/// continuation instead, which can occur at most once per chain.
pub trait CollapseInto<U, EOut>
where
    U: Send + Sync + 'static,
    EOut: ErrorChannel,
{
    /// Wires `source` to complete with this task's result.
    fn collapse_into(self, source: &TaskCompletionSource<U, EOut>);
}

impl<U, E> CollapseInto<U, E> for Task<U, E>
where
    U: Send + Sync + 'static,
    E: ErrorChannel,
{
    fn collapse_into(self, source: &TaskCompletionSource<U, E>) {
        source.payload.collapse_into(&self.payload);
    }
}

impl<U> CollapseInto<U, ErrorCapsule> for Task<U, ErrorCode>
where
    U: Clone + Send + Sync + 'static,
{
    fn collapse_into(self, source: &TaskCompletionSource<U, ErrorCapsule>) {
        let stand_in = source.clone();
        attach(
            &self.payload,
            SchedulerHandle::inline(),
            move |input: &Expected<U, ErrorCode>| {
                let upgraded = match input.as_result() {
                    Ok(value) => Expected::from_value(value.clone()),
                    Err(error) => Expected::from_error(error.clone().into_error()),
                };
                stand_in.complete_expected(upgraded);
                Expected::<(), ErrorCapsule>::valid()
            },
        );
    }
}

/// The promise side of a task: completes the payload exactly once.
pub struct TaskCompletionSource<T, E> {
    payload: Arc<Payload<T, E>>,
}

impl<T, E> Clone for TaskCompletionSource<T, E> {
    fn clone(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
        }
    }
}

impl<T, E> std::fmt::Debug for TaskCompletionSource<T, E>
where
    T: Send + Sync + 'static,
    E: ErrorChannel,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCompletionSource")
            .field("completed", &self.payload.completed())
            .finish()
    }
}

impl<T, E> TaskCompletionSource<T, E>
where
    T: Send + Sync + 'static,
    E: ErrorChannel,
{
    /// Creates a pending source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            payload: Payload::new(),
        }
    }

    /// Completes with a value.
    ///
    /// Synchronously runs the completion protocol: every waiting
    /// continuation is dispatched on its own scheduler before this returns
    /// (inline-scheduler continuations run on the calling thread).
    ///
    /// # Panics
    ///
    /// Panics if the source already completed.
    pub fn complete(&self, value: T) {
        self.payload.complete(Expected::from_value(value));
    }

    /// Completes with an error (upgrading its channel when needed).
    pub fn complete_error(&self, error: impl IntoError<E>) {
        self.payload
            .complete(Expected::from_error(error.into_error()));
    }

    /// Completes with a full result.
    pub fn complete_expected(&self, result: Expected<T, E>) {
        self.payload.complete(result);
    }

    /// Returns true once this source has been completed.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.payload.completed()
    }

    /// Obtains a task handle bound to this source.
    #[must_use]
    pub fn as_task(&self) -> Task<T, E> {
        Task {
            payload: Arc::clone(&self.payload),
        }
    }

    /// Consumes the source into its task handle.
    #[must_use]
    pub fn into_task(self) -> Task<T, E> {
        Task {
            payload: self.payload,
        }
    }
}

impl<T, E> Default for TaskCompletionSource<T, E>
where
    T: Send + Sync + 'static,
    E: ErrorChannel,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> From<TaskCompletionSource<T, E>> for Task<T, E> {
    fn from(source: TaskCompletionSource<T, E>) -> Self {
        Self {
            payload: source.payload,
        }
    }
}

/// A completion source with the payload type erased.
///
/// Lets heterogeneous sources live in one collection (the state-machine
/// driver stores per-state exits this way); the holder recovers the typed
/// source with [`unsafe_cast`](Self::unsafe_cast) when it can prove the type.
#[derive(Clone)]
pub struct AbstractTaskCompletionSource {
    payload: Arc<dyn Any + Send + Sync>,
    probe: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl std::fmt::Debug for AbstractTaskCompletionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbstractTaskCompletionSource")
            .field("completed", &self.completed())
            .finish()
    }
}

impl AbstractTaskCompletionSource {
    /// Returns true once the underlying source has been completed.
    #[must_use]
    pub fn completed(&self) -> bool {
        (self.probe)()
    }

    /// Recovers the typed source.
    ///
    /// # Panics
    ///
    /// Panics if `<T, E>` is not the type this source was erased from.
    #[must_use]
    pub fn unsafe_cast<T, E>(&self) -> TaskCompletionSource<T, E>
    where
        T: Send + Sync + 'static,
        E: ErrorChannel,
    {
        let payload = Arc::clone(&self.payload)
            .downcast::<Payload<T, E>>()
            .unwrap_or_else(|_| panic!("abstract completion source cast to the wrong type"));
        TaskCompletionSource { payload }
    }
}

impl<T, E> From<TaskCompletionSource<T, E>> for AbstractTaskCompletionSource
where
    T: Send + Sync + 'static,
    E: ErrorChannel,
{
    fn from(source: TaskCompletionSource<T, E>) -> Self {
        let probe_payload = Arc::clone(&source.payload);
        Self {
            payload: source.payload,
            probe: Arc::new(move || probe_payload.completed()),
        }
    }
}

/// Creates a task whose work is queued on `scheduler` immediately; the first
/// execution happens when the scheduler runs the thunk.
///
/// Cancellation is consulted when the thunk runs, not when it is queued.
pub fn make_task<E, U, S, F>(scheduler: &S, cancel: &Cancellation, f: F) -> Task<U, E>
where
    E: ErrorChannel,
    U: Send + Sync + 'static,
    S: Scheduler + ?Sized,
    F: FnOnce() -> U + Send + 'static,
{
    make_task_result::<E, U, S, _>(scheduler, cancel, move || Expected::from_value(f()))
}

/// [`make_task`] for work that reports success or failure itself.
pub fn make_task_result<E, U, S, F>(scheduler: &S, cancel: &Cancellation, f: F) -> Task<U, E>
where
    E: ErrorChannel,
    U: Send + Sync + 'static,
    S: Scheduler + ?Sized,
    F: FnOnce() -> Expected<U, E> + Send + 'static,
{
    let payload = Payload::<U, E>::new();
    let completing = Arc::clone(&payload);
    let cancel = cancel.clone();
    scheduler.schedule(Box::new(move || {
        let result = if cancel.cancelled() {
            Expected::from_error(E::cancelled())
        } else {
            E::run(f)
        };
        completing.complete(result);
    }));
    Task { payload }
}

/// [`make_task`] for work that returns a task; the result is unwrapped.
pub fn make_task_flat<E, U, S, F>(scheduler: &S, cancel: &Cancellation, f: F) -> Task<U, E>
where
    E: ErrorChannel,
    U: Send + Sync + 'static,
    S: Scheduler + ?Sized,
    F: FnOnce() -> Task<U, E> + Send + 'static,
{
    let source = TaskCompletionSource::<U, E>::new();
    let stand_in = source.clone();
    let cancel = cancel.clone();
    scheduler.schedule(Box::new(move || {
        let produced = if cancel.cancelled() {
            Expected::from_error(E::cancelled())
        } else {
            E::run(|| Expected::from_value(f()))
        };
        match produced.into_result() {
            Err(error) => stand_in.complete_expected(Expected::from_error(error)),
            Ok(inner) => inner.collapse_into(&stand_in),
        }
    }));
    source.into_task()
}

/// Creates an already-completed task from a value.
pub fn task_from_result<E, T>(value: T) -> Task<T, E>
where
    E: ErrorChannel,
    T: Send + Sync + 'static,
{
    let source = TaskCompletionSource::new();
    source.complete(value);
    source.into_task()
}

/// Creates an already-completed task from an error (upgrading its channel
/// when needed).
pub fn task_from_error<T, E, E0>(error: E0) -> Task<T, E>
where
    T: Send + Sync + 'static,
    E: ErrorChannel,
    E0: IntoError<E>,
{
    let source = TaskCompletionSource::<T, E>::new();
    source.complete_error(error);
    source.into_task()
}

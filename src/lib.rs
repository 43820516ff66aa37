//! Arcana: scheduler-parametric task graph engine for composing asynchronous
//! computations across arbitrary execution contexts.
//!
//! # Overview
//!
//! Arcana is built around a lazily-chained future/promise system. A task is a
//! handle onto a heap-allocated payload node; continuations attach child
//! nodes; when a node completes, each continuation is queued on its own
//! scheduler. Results flow forward, errors and cancellation short-circuit
//! unless a continuation explicitly handles the error variant.
//!
//! # Core Guarantees
//!
//! - **No lost work**: every attached continuation runs exactly once, on its
//!   own scheduler, after its parent completes
//! - **Cancel-correctness**: cancellation is a dual-edged protocol
//!   (requested / completed) with pin-gated shutdown flushing, never a
//!   silent drop
//! - **Bounded chains**: task-returning tasks collapse their completion
//!   chain through redirect splicing, so recursive generators run in
//!   constant space
//! - **Typed error channels**: a lightweight code channel and a rethrowable
//!   capsule channel, with one-way upgrade enforced at compile time
//!
//! # Module Structure
//!
//! - [`error`]: Error codes, capsules, and the channel traits
//! - [`expected`]: Value-or-error sum type with cross-channel conversion
//! - [`containers`]: Ticketed collection with RAII row ownership
//! - [`cancellation`]: Broadcast-once cancellation with listener tickets
//! - [`scheduler`]: The scheduler capability and the inline scheduler
//! - [`dispatcher`]: Queue-backed schedulers (manual and background)
//! - [`task`]: Tasks, completion sources, `when_all`, pending-task scopes
//! - [`state_machine`]: Driver/observer rendezvous per state token
//! - [`messaging`]: Typed multi-listener router and dispatcher-affine mediator
//! - [`tracing_compat`]: Structured logging shim

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod cancellation;
pub mod containers;
pub mod dispatcher;
pub mod error;
pub mod expected;
pub mod messaging;
pub mod scheduler;
pub mod state_machine;
pub mod task;
pub mod tracing_compat;

// Re-exports for convenient access to core types
pub use cancellation::{Cancellation, CancellationPin, CancellationSource};
pub use containers::{Ticket, TicketScope, TicketedCollection};
pub use dispatcher::{BackgroundDispatcher, ManualDispatcher};
pub use error::{Category, ErrorCapsule, ErrorChannel, ErrorCode, ErrorUnion, IntoError};
pub use expected::{make_unexpected, Expected, Unexpected};
pub use messaging::{Mediator, Router};
pub use scheduler::{Affinity, HasAffinity, InlineScheduler, Job, Scheduler, SchedulerHandle};
pub use state_machine::{StateMachineDriver, StateMachineObserver, StateMachineState};
pub use task::{
    make_task, make_task_flat, make_task_result, task_from_error, task_from_result, when_all,
    when_all2, when_all3, when_all_void, AbstractTaskCompletionSource, PendingTaskScope, Task,
    TaskCompletionSource,
};

//! Error domains for task chains.
//!
//! Two error channels are first-class, with a total order between them:
//!
//! - [`ErrorCode`]: a lightweight code (category + integer), cheap to copy
//!   and compare. The channel for non-panicking chains.
//! - [`ErrorCapsule`]: a dynamically typed, rethrowable capsule. Carries a
//!   wrapped code, a captured panic, or an arbitrary error value.
//!
//! `code < capsule`: a code-channel chain can flow into a capsule-channel
//! chain (the code is wrapped on the boundary), but a live capsule cannot be
//! losslessly demoted to a code, so the reverse conversion does not exist.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::expected::Expected;

/// The category a code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// General-purpose codes (errno-style values).
    Generic,
    /// Codes raised by the task engine itself.
    Task,
    /// Codes raised by the state-machine coordinator.
    State,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "generic"),
            Self::Task => write!(f, "task"),
            Self::State => write!(f, "state"),
        }
    }
}

/// Well-known error conditions carried by [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    /// The operation was cancelled through a cancellation token.
    #[error("operation cancelled")]
    OperationCancelled,
    /// An argument was rejected.
    #[error("invalid argument")]
    InvalidArgument,
    /// The other end of a pipeline went away.
    #[error("broken pipe")]
    BrokenPipe,
    /// A message failed validation.
    #[error("bad message")]
    BadMessage,
    /// The owner of a shared resource died.
    #[error("owner dead")]
    OwnerDead,
    /// Wrong-variant access on an [`Expected`].
    #[error("bad expected access")]
    BadAccess,
    /// A state token already has pending observer work.
    #[error("state already has pending work")]
    StateBusy,
    /// A code with no well-known mapping.
    #[error("unrecognized error")]
    Other,
}

/// A lightweight error code: category plus integer value.
///
/// Codes are `Copy` and compare by `(category, value)`. Well-known values
/// have named constructors; arbitrary values can be built with
/// [`ErrorCode::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    category: Category,
    value: i32,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error {}: {}", self.category, self.value, self.kind())
    }
}

impl std::error::Error for ErrorCode {}

impl ErrorCode {
    const CANCELLED: i32 = 125;
    const INVALID_ARGUMENT: i32 = 22;
    const BROKEN_PIPE: i32 = 32;
    const BAD_MESSAGE: i32 = 74;
    const OWNER_DEAD: i32 = 130;
    const BAD_ACCESS: i32 = 1;
    const STATE_BUSY: i32 = 2;

    /// Creates a code from a category and raw value.
    #[must_use]
    pub const fn new(category: Category, value: i32) -> Self {
        Self { category, value }
    }

    /// The code reported when a chain is short-circuited by cancellation.
    #[must_use]
    pub const fn operation_cancelled() -> Self {
        Self::new(Category::Generic, Self::CANCELLED)
    }

    /// A rejected argument.
    #[must_use]
    pub const fn invalid_argument() -> Self {
        Self::new(Category::Generic, Self::INVALID_ARGUMENT)
    }

    /// The other end of a pipeline went away.
    #[must_use]
    pub const fn broken_pipe() -> Self {
        Self::new(Category::Generic, Self::BROKEN_PIPE)
    }

    /// A message failed validation.
    #[must_use]
    pub const fn bad_message() -> Self {
        Self::new(Category::Generic, Self::BAD_MESSAGE)
    }

    /// The owner of a shared resource died.
    #[must_use]
    pub const fn owner_dead() -> Self {
        Self::new(Category::Generic, Self::OWNER_DEAD)
    }

    /// Wrong-variant access on an [`Expected`].
    #[must_use]
    pub const fn bad_access() -> Self {
        Self::new(Category::Task, Self::BAD_ACCESS)
    }

    /// A state token already has pending observer work.
    #[must_use]
    pub const fn state_busy() -> Self {
        Self::new(Category::State, Self::STATE_BUSY)
    }

    /// Returns the category of this code.
    #[must_use]
    pub const fn category(&self) -> Category {
        self.category
    }

    /// Returns the raw integer value of this code.
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.value
    }

    /// Maps this code onto a well-known condition.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match (self.category, self.value) {
            (Category::Generic, Self::CANCELLED) => ErrorKind::OperationCancelled,
            (Category::Generic, Self::INVALID_ARGUMENT) => ErrorKind::InvalidArgument,
            (Category::Generic, Self::BROKEN_PIPE) => ErrorKind::BrokenPipe,
            (Category::Generic, Self::BAD_MESSAGE) => ErrorKind::BadMessage,
            (Category::Generic, Self::OWNER_DEAD) => ErrorKind::OwnerDead,
            (Category::Task, Self::BAD_ACCESS) => ErrorKind::BadAccess,
            (Category::State, Self::STATE_BUSY) => ErrorKind::StateBusy,
            _ => ErrorKind::Other,
        }
    }

    /// Returns true if this code means cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind(), ErrorKind::OperationCancelled)
    }
}

/// Message extracted from a caught panic payload.
///
/// Panic payloads are `Box<dyn Any>`; the message is pulled out at capture
/// time so the capsule stays cheap to clone and to transport.
#[derive(Debug, Clone)]
pub struct PanicNote {
    message: String,
}

impl PanicNote {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = payload.downcast_ref::<&str>().map_or_else(
            || {
                payload
                    .downcast_ref::<String>()
                    .cloned()
                    .unwrap_or_else(|| "non-string panic payload".to_owned())
            },
            |s| (*s).to_owned(),
        );
        Self { message }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

#[derive(Debug)]
enum CapsuleKind {
    Code(ErrorCode),
    Panic(PanicNote),
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

/// A dynamically typed, rethrowable error capsule.
///
/// The capsule channel is the upper bound of the error order: codes upgrade
/// into it, captured panics are materialized into it, and arbitrary error
/// values can be wrapped in it. Cloning is cheap (shared inner).
#[derive(Debug, Clone)]
pub struct ErrorCapsule {
    inner: Arc<CapsuleKind>,
}

impl ErrorCapsule {
    /// Wraps a code into a capsule. The embedded code survives the trip:
    /// `ErrorCapsule::from_code(c).code() == Some(c)`.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            inner: Arc::new(CapsuleKind::Code(code)),
        }
    }

    /// Captures a panic payload (as produced by `catch_unwind`).
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self {
            inner: Arc::new(CapsuleKind::Panic(PanicNote::from_payload(payload))),
        }
    }

    /// Wraps an arbitrary error value.
    #[must_use]
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(CapsuleKind::Other(Arc::new(error))),
        }
    }

    /// Returns the embedded code, if this capsule wraps one.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match &*self.inner {
            CapsuleKind::Code(code) => Some(*code),
            CapsuleKind::Panic(_) | CapsuleKind::Other(_) => None,
        }
    }

    /// Returns the captured panic message, if this capsule holds one.
    #[must_use]
    pub fn panic_message(&self) -> Option<&str> {
        match &*self.inner {
            CapsuleKind::Panic(note) => Some(note.message()),
            CapsuleKind::Code(_) | CapsuleKind::Other(_) => None,
        }
    }

    /// Attempts to view the wrapped error value as a concrete type.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match &*self.inner {
            CapsuleKind::Other(err) => err.downcast_ref::<E>(),
            CapsuleKind::Code(_) | CapsuleKind::Panic(_) => None,
        }
    }

    /// Returns true if this capsule carries a cancellation code.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.code().is_some_and(|c| c.is_cancelled())
    }

    /// Resumes unwinding with this capsule as the payload.
    ///
    /// Callers that want to inspect the rethrown value can `catch_unwind`
    /// and downcast the payload back to `ErrorCapsule`.
    pub fn rethrow(&self) -> ! {
        std::panic::resume_unwind(Box::new(self.clone()))
    }
}

impl fmt::Display for ErrorCapsule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            CapsuleKind::Code(code) => write!(f, "{code}"),
            CapsuleKind::Panic(note) => write!(f, "{note}"),
            CapsuleKind::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ErrorCapsule {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.inner {
            CapsuleKind::Other(err) => Some(err.as_ref()),
            CapsuleKind::Code(_) | CapsuleKind::Panic(_) => None,
        }
    }
}

impl From<ErrorCode> for ErrorCapsule {
    fn from(code: ErrorCode) -> Self {
        Self::from_code(code)
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::ErrorCode {}
    impl Sealed for super::ErrorCapsule {}
}

/// The capability shared by the two error channels.
///
/// This trait is sealed: `ErrorCode` and `ErrorCapsule` are the only
/// channels, and the task engine's conversion rules rely on that.
pub trait ErrorChannel: Clone + Send + Sync + fmt::Debug + fmt::Display + 'static + sealed::Sealed {
    /// Position of this channel in the `code < capsule` order.
    const PRIORITY: u8;

    /// Wraps a code into this channel.
    fn from_code(code: ErrorCode) -> Self;

    /// The cancellation value of this channel.
    #[must_use]
    fn cancelled() -> Self {
        Self::from_code(ErrorCode::operation_cancelled())
    }

    /// Returns true if this error means cancellation.
    fn is_cancelled(&self) -> bool;

    /// Runs user work under this channel's invocation discipline.
    ///
    /// The capsule channel traps unwinds and materializes them into the
    /// error slot; the code channel calls through directly, so work on a
    /// code chain must not panic.
    fn run<T, F>(f: F) -> Expected<T, Self>
    where
        F: FnOnce() -> Expected<T, Self>;
}

impl ErrorChannel for ErrorCode {
    const PRIORITY: u8 = 0;

    fn from_code(code: ErrorCode) -> Self {
        code
    }

    fn is_cancelled(&self) -> bool {
        Self::is_cancelled(self)
    }

    fn run<T, F>(f: F) -> Expected<T, Self>
    where
        F: FnOnce() -> Expected<T, Self>,
    {
        f()
    }
}

impl ErrorChannel for ErrorCapsule {
    const PRIORITY: u8 = 1;

    fn from_code(code: ErrorCode) -> Self {
        Self::from_code(code)
    }

    fn is_cancelled(&self) -> bool {
        Self::is_cancelled(self)
    }

    fn run<T, F>(f: F) -> Expected<T, Self>
    where
        F: FnOnce() -> Expected<T, Self>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => {
                // A rethrown capsule keeps its identity instead of being
                // re-captured as an opaque panic note.
                let capsule = match payload.downcast::<Self>() {
                    Ok(capsule) => *capsule,
                    Err(other) => Self::from_panic(other.as_ref()),
                };
                Expected::from_error(capsule)
            }
        }
    }
}

/// One-way conversion between channels: `parent E <= child E`.
///
/// `Code -> Code`, `Code -> Capsule`, and `Capsule -> Capsule` exist;
/// `Capsule -> Code` deliberately does not, because a live capsule cannot be
/// losslessly demoted to a code.
pub trait IntoError<E: ErrorChannel>: ErrorChannel {
    /// Converts into the (equal or higher) target channel.
    fn into_error(self) -> E;
}

impl<E: ErrorChannel> IntoError<E> for E {
    fn into_error(self) -> E {
        self
    }
}

impl IntoError<ErrorCapsule> for ErrorCode {
    fn into_error(self) -> ErrorCapsule {
        ErrorCapsule::from_code(self)
    }
}

/// Type-level `max` of two channels, used by the unwrap protocol.
pub trait ErrorUnion<E2: ErrorChannel>: ErrorChannel {
    /// The higher of the two channels.
    type Output: ErrorChannel;
}

impl ErrorUnion<ErrorCode> for ErrorCode {
    type Output = ErrorCode;
}

impl ErrorUnion<ErrorCapsule> for ErrorCode {
    type Output = ErrorCapsule;
}

impl ErrorUnion<ErrorCode> for ErrorCapsule {
    type Output = ErrorCapsule;
}

impl ErrorUnion<ErrorCapsule> for ErrorCapsule {
    type Output = ErrorCapsule;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_round_trips_known_codes() {
        assert_eq!(
            ErrorCode::operation_cancelled().kind(),
            ErrorKind::OperationCancelled
        );
        assert_eq!(ErrorCode::bad_access().kind(), ErrorKind::BadAccess);
        assert_eq!(ErrorCode::state_busy().kind(), ErrorKind::StateBusy);
        assert_eq!(
            ErrorCode::new(Category::Generic, 9999).kind(),
            ErrorKind::Other
        );
    }

    #[test]
    fn display_includes_category_and_kind() {
        let code = ErrorCode::broken_pipe();
        let text = code.to_string();
        assert!(text.contains("generic"), "{text}");
        assert!(text.contains("broken pipe"), "{text}");
    }

    #[test]
    fn capsule_preserves_embedded_code() {
        let code = ErrorCode::invalid_argument();
        let capsule = ErrorCapsule::from_code(code);
        assert_eq!(capsule.code(), Some(code));
        assert!(!capsule.is_cancelled());
        assert!(ErrorCapsule::from_code(ErrorCode::operation_cancelled()).is_cancelled());
    }

    #[test]
    fn capsule_rethrow_keeps_identity() {
        let code = ErrorCode::bad_message();
        let capsule = ErrorCapsule::from_code(code);
        let payload =
            catch_unwind(AssertUnwindSafe(|| capsule.rethrow())).expect_err("must unwind");
        let recovered = payload
            .downcast::<ErrorCapsule>()
            .expect("payload is the capsule");
        assert_eq!(recovered.code(), Some(code));
    }

    #[test]
    fn capsule_channel_traps_panics() {
        let result: Expected<i32, ErrorCapsule> =
            ErrorCapsule::run(|| panic!("boom in user work"));
        assert!(result.has_error());
        assert_eq!(result.error().panic_message(), Some("boom in user work"));
    }

    #[test]
    fn code_channel_calls_through() {
        let result: Expected<i32, ErrorCode> = ErrorCode::run(|| Expected::from_value(3));
        assert_eq!(*result.value(), 3);
    }

    #[test]
    fn capsule_wraps_arbitrary_errors() {
        #[derive(Debug, thiserror::Error)]
        #[error("custom failure")]
        struct Custom;

        let capsule = ErrorCapsule::from_error(Custom);
        assert!(capsule.downcast_ref::<Custom>().is_some());
        assert!(capsule.code().is_none());
    }

    fn union_of<A, B>() -> u8
    where
        A: ErrorUnion<B>,
        B: ErrorChannel,
    {
        <A as ErrorUnion<B>>::Output::PRIORITY
    }

    #[test]
    fn union_picks_the_higher_channel() {
        assert_eq!(union_of::<ErrorCode, ErrorCode>(), 0);
        assert_eq!(union_of::<ErrorCode, ErrorCapsule>(), 1);
        assert_eq!(union_of::<ErrorCapsule, ErrorCode>(), 1);
        assert_eq!(union_of::<ErrorCapsule, ErrorCapsule>(), 1);
    }
}

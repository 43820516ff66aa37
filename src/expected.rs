//! Value-or-error sum type with cross-channel conversion.
//!
//! [`Expected`] is the result slot of the task engine: every payload
//! completes with exactly one `Expected<T, E>`, and continuations receive it
//! by reference. Wrong-variant access is a programmer error and fails fast.

use crate::error::{ErrorCapsule, ErrorChannel, ErrorCode, IntoError};

/// An error value waiting to be placed into an [`Expected`].
///
/// Wrapping the error makes construction unambiguous for value types that
/// are themselves errors, and gives the channel upgrade a place to happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unexpected<E>(E);

impl<E> Unexpected<E> {
    /// Wraps an error value.
    pub const fn new(error: E) -> Self {
        Self(error)
    }

    /// Returns the wrapped error.
    pub fn into_inner(self) -> E {
        self.0
    }
}

/// Wraps an error value for insertion into an [`Expected`].
pub fn make_unexpected<E>(error: E) -> Unexpected<E> {
    Unexpected::new(error)
}

/// A value of type `T` or an error of type `E`.
///
/// Unlike `Result`, accessors assume the caller already knows which variant
/// is present; `value()` and `error()` panic on wrong-variant access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected<T, E> {
    inner: Result<T, E>,
}

impl<T, E> Expected<T, E> {
    /// Creates an expected holding a value.
    pub const fn from_value(value: T) -> Self {
        Self { inner: Ok(value) }
    }

    /// Creates an expected holding an error.
    pub const fn from_error(error: E) -> Self {
        Self { inner: Err(error) }
    }

    /// Returns the value.
    ///
    /// # Panics
    ///
    /// Panics with a bad-access message in the error state.
    #[must_use]
    pub fn value(&self) -> &T {
        match &self.inner {
            Ok(value) => value,
            Err(_) => panic!("bad expected access: value() called in the error state"),
        }
    }

    /// Returns the error.
    ///
    /// # Panics
    ///
    /// Panics with a bad-access message in the value state.
    #[must_use]
    pub fn error(&self) -> &E {
        match &self.inner {
            Ok(_) => panic!("bad expected access: error() called in the value state"),
            Err(error) => error,
        }
    }

    /// Returns the value, or `default` in the error state.
    #[must_use]
    pub fn value_or(&self, default: T) -> T
    where
        T: Clone,
    {
        match &self.inner {
            Ok(value) => value.clone(),
            Err(_) => default,
        }
    }

    /// Returns true if a value is present.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.inner.is_ok()
    }

    /// Returns true if an error is present.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.inner.is_err()
    }

    /// Views this expected as a `Result` of references.
    pub fn as_result(&self) -> Result<&T, &E> {
        self.inner.as_ref()
    }

    /// Unwraps into a plain `Result`.
    pub fn into_result(self) -> Result<T, E> {
        self.inner
    }

    /// Converts the error channel upward (`code -> capsule` or identity).
    #[must_use]
    pub fn upgrade<E2>(self) -> Expected<T, E2>
    where
        E: IntoError<E2>,
        E2: ErrorChannel,
    {
        Expected {
            inner: self.inner.map_err(IntoError::into_error),
        }
    }
}

impl<E> Expected<(), E> {
    /// Creates a unit expected that holds no error.
    #[must_use]
    pub const fn valid() -> Self {
        Self { inner: Ok(()) }
    }
}

impl<T, E> From<Result<T, E>> for Expected<T, E> {
    fn from(inner: Result<T, E>) -> Self {
        Self { inner }
    }
}

impl<T, E, E0> From<Unexpected<E0>> for Expected<T, E>
where
    E: ErrorChannel,
    E0: IntoError<E>,
{
    fn from(unexpected: Unexpected<E0>) -> Self {
        Self::from_error(unexpected.into_inner().into_error())
    }
}

impl<T> From<Expected<T, ErrorCode>> for Expected<T, ErrorCapsule> {
    fn from(other: Expected<T, ErrorCode>) -> Self {
        other.upgrade()
    }
}

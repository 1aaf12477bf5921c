//! Errors and terminal outcomes.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::panic::PanicInfo;

/// An error carried by a failed effect.
///
/// Declared failures (`Raised`, `Message`) are recoverable by any enclosing
/// error handler, as are panics captured from user code (`Panicked`).
/// `Internal` marks a broken run loop invariant, such as a value whose type
/// does not match the continuation it was fed to.
#[derive(Debug, Clone, Error)]
pub enum EffectError {
    /// An application error.
    #[error("{0}")]
    Raised(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// An application error described only by a message.
    #[error("{0}")]
    Message(String),

    /// A panic unwound out of a thunk, continuation or handler.
    #[error("panicked: {0}")]
    Panicked(PanicInfo),

    /// The run loop detected a structural fault.
    #[error("internal run loop fault: {0}")]
    Internal(String),
}

impl EffectError {
    /// Wrap an application error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EffectError::Raised(Arc::new(error))
    }

    /// Create an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        EffectError::Message(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        EffectError::Internal(message.into())
    }

    /// Returns the wrapped application error if it has type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            EffectError::Raised(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns true if this error was produced by a captured panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, EffectError::Panicked(_))
    }

    /// Returns true if this error reports a run loop fault.
    pub fn is_internal(&self) -> bool {
        matches!(self, EffectError::Internal(_))
    }
}

impl From<PanicInfo> for EffectError {
    fn from(info: PanicInfo) -> Self {
        EffectError::Panicked(info)
    }
}

/// Terminal outcome of a run.
///
/// Cancellation is its own outcome and is never represented as an
/// [`EffectError`].
#[derive(Debug)]
pub enum Outcome<A> {
    /// The effect produced a value.
    Completed(A),
    /// The effect failed and no handler recovered it.
    Errored(EffectError),
    /// The run observed a canceled token.
    Canceled,
}

impl<A> Outcome<A> {
    /// Returns true for `Completed`.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// Returns true for `Errored`.
    pub fn is_errored(&self) -> bool {
        matches!(self, Outcome::Errored(_))
    }

    /// Returns true for `Canceled`.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    /// Maps the completed value.
    pub fn map<B, F>(self, f: F) -> Outcome<B>
    where
        F: FnOnce(A) -> B,
    {
        match self {
            Outcome::Completed(a) => Outcome::Completed(f(a)),
            Outcome::Errored(e) => Outcome::Errored(e),
            Outcome::Canceled => Outcome::Canceled,
        }
    }

    /// Converts to a `Result`, with `None` standing for cancellation.
    pub fn into_result(self) -> Option<Result<A, EffectError>> {
        match self {
            Outcome::Completed(a) => Some(Ok(a)),
            Outcome::Errored(e) => Some(Err(e)),
            Outcome::Canceled => None,
        }
    }

    /// Returns the completed value, if any.
    pub fn completed(self) -> Option<A> {
        match self {
            Outcome::Completed(a) => Some(a),
            _ => None,
        }
    }

    /// Returns the error, if any.
    pub fn errored(self) -> Option<EffectError> {
        match self {
            Outcome::Errored(e) => Some(e),
            _ => None,
        }
    }
}

impl<A: fmt::Display> fmt::Display for Outcome<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed(a) => write!(f, "completed: {}", a),
            Outcome::Errored(e) => write!(f, "errored: {}", e),
            Outcome::Canceled => write!(f, "canceled"),
        }
    }
}

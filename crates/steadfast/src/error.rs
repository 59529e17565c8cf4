#![forbid(unsafe_code)]

//! Error taxonomy for the resilient primitives.
//!
//! Failures travel two roads at once: back to the direct caller as a
//! `Result`, and out to observers through an `error` observable. Both
//! roads may need the same payload, so the shared payload type [`Fault`]
//! is reference-counted and cheap to clone.

use std::rc::Rc;

/// Cloneable, type-erased failure payload.
///
/// Wrap a structured error with `Rc::new(err)`, or build a text-only
/// fault with [`fault`].
pub type Fault = Rc<dyn std::error::Error>;

/// Build a [`Fault`] carrying only a message.
pub fn fault(msg: impl Into<String>) -> Fault {
    Rc::new(TextFault(msg.into()))
}

/// Message-only error used by [`fault`].
#[derive(Debug, Clone)]
struct TextFault(String);

impl std::fmt::Display for TextFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TextFault {}

/// Terminal failures of a [`SafePromise`](crate::SafePromise).
///
/// Cancellation is deliberately absent: canceling a promise is a
/// successful outcome (`Settled::Canceled`), never an error.
#[derive(Debug, Clone)]
pub enum PromiseError {
    /// The wrapped operation reported its own failure.
    Rejected(Fault),
    /// The watchdog fired before the operation settled. Fatal for the
    /// owning promise; carries its id for diagnostics.
    Died {
        /// Id of the promise that died.
        id: String,
    },
    /// `run()` was called a second time; the operation was already
    /// consumed by the first call.
    Spent {
        /// Id of the promise whose operation was already taken.
        id: String,
    },
}

impl PromiseError {
    /// Whether this failure is fatal for the owning promise.
    ///
    /// Death is never retried automatically.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Died { .. })
    }
}

impl std::fmt::Display for PromiseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(fault) => write!(f, "operation rejected: {fault}"),
            Self::Died { id } => write!(f, "{id} died."),
            Self::Spent { id } => write!(f, "run() already consumed the operation of '{id}'"),
        }
    }
}

impl std::error::Error for PromiseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected(fault) => Some(&**fault),
            Self::Died { .. } | Self::Spent { .. } => None,
        }
    }
}

//! Error taxonomy for worklet lifecycle and channel operations.
//!
//! Lifecycle-precondition violations are synchronous and never mutate state.
//! [`ChannelError::Closed`] is the distinct termination error so channel
//! consumers can tell cancellation apart from a native I/O failure.

use thiserror::Error;

/// An opaque failure reported by the native engine.
///
/// The engine's message is carried verbatim; the core attaches no further
/// structure to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct NativeError(String);

impl NativeError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Errors raised by worklet lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkletError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("worklet has already been started")]
    AlreadyStarted,
    #[error("worklet has not been started")]
    NotStarted,
    #[error("worklet has been terminated")]
    AlreadyTerminated,
    #[error("native engine error: {0}")]
    Native(#[from] NativeError),
}

/// Errors raised by channel operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The owning worklet was terminated while the operation was outstanding,
    /// or the channel was already torn down when the call was made.
    #[error("channel closed")]
    Closed,
    /// A read or write was issued before the open phase completed.
    #[error("channel not open")]
    NotOpen,
    #[error("native engine error: {0}")]
    Native(#[from] NativeError),
}

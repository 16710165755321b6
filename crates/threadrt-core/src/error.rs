//! Error taxonomy for the thread runtime's public API boundary.
//!
//! Conditions that imply runtime corruption (lock-stack overflow, out-of-order
//! release outside crash mode, suspension watchdog fired, self-pipe broken) do
//! not flow through this type — they go through [`crate::diagnostics::fatal`]
//! and abort the process. This enum only covers conditions the caller can
//! sensibly recover from.

use thiserror::Error;

/// Errors returned at the thread runtime's public API boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The id refers to no valid thread element.
    #[error("no such thread")]
    NotFound,
    /// Bad signal number, bad state, bad key, or a self-target where forbidden.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Cancel of a non-cancelable thread, or enable-cancel on a thread not cancelable.
    #[error("operation not permitted: {0}")]
    Permission(&'static str),
    /// A cycle among blocked threads, or a self-join.
    #[error("deadlock detected")]
    DeadlockDetected,
    /// The small-id space is full with no reusable slot after a bounded wait,
    /// or the host refused to allocate a thread stack.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// A non-blocking operation could not complete immediately.
    #[error("would block")]
    WouldBlock,
    /// A timed wait reached its deadline.
    #[error("timed out")]
    TimedOut,
    /// The self-pipe (or equivalent) returned an I/O error. Only recoverable
    /// at call sites that can tolerate losing a wakeup; most callers should
    /// treat this as fatal.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Convenience alias for the runtime's fallible operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(RuntimeError::NotFound.to_string(), "no such thread");
        assert_eq!(RuntimeError::WouldBlock.to_string(), "would block");
        assert_eq!(RuntimeError::TimedOut.to_string(), "timed out");
        assert_eq!(RuntimeError::DeadlockDetected.to_string(), "deadlock detected");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: RuntimeError = io_err.into();
        assert!(matches!(err, RuntimeError::Io(_)));
    }
}

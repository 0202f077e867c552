//! Error types for beatpool
//!
//! This module defines all error types used by the connection pool and the
//! heartbeat dispatcher. Uses `thiserror` for ergonomic error handling with
//! automatic `Display` and `Error` trait implementations.

use std::time::Duration;

use thiserror::Error;

/// The primary error type for beatpool operations.
#[derive(Error, Debug)]
pub enum BeatError {
    /// No idle or creatable connection became available before the caller's timeout.
    #[error("Pool exhausted: no connection available after {waited:?}")]
    PoolExhausted { waited: Duration },

    /// Opening a new connection failed on every attempt.
    #[error("Pool creation failed after {attempts} attempts: {reason}")]
    PoolCreationFailed { attempts: u32, reason: String },

    /// The pool has been shut down and hands out no more connections.
    #[error("Pool is shut down")]
    PoolClosed,

    /// The dispatcher could not obtain a connection for publish or listen.
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// A handler was already registered for this kind and has been replaced.
    #[error("Duplicate handler for kind '{kind}' (previous registration replaced)")]
    DuplicateHandler { kind: String },

    /// Operation invoked in the wrong lifecycle state.
    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// A registered handler failed while processing a message.
    #[error("Handler for kind '{kind}' failed: {message}")]
    Handler { kind: String, message: String },

    /// Transport-level failures (open, send, receive, close).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration-related errors (invalid values, unreadable files, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BeatError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Exhaustion, creation and transport failures depend on load or on the
    /// remote side recovering. State, config and duplicate-registration errors
    /// are programmer errors and will fail the same way again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BeatError::PoolExhausted { .. }
                | BeatError::PoolCreationFailed { .. }
                | BeatError::ConnectionUnavailable(_)
                | BeatError::Transport(_)
                | BeatError::Io(_)
        )
    }
}

/// A specialized `Result` type for beatpool operations.
pub type Result<T> = std::result::Result<T, BeatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BeatError::Config("max_cached_connections is not a number".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: max_cached_connections is not a number"
        );
    }

    #[test]
    fn test_pool_exhausted_display() {
        let err = BeatError::PoolExhausted {
            waited: Duration::from_millis(100),
        };
        assert_eq!(
            err.to_string(),
            "Pool exhausted: no connection available after 100ms"
        );
    }

    #[test]
    fn test_invalid_state_display() {
        let err = BeatError::InvalidState {
            operation: "start",
            state: "running".into(),
        };
        assert_eq!(err.to_string(), "Invalid state: cannot start while running");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let beat_err: BeatError = io_err.into();
        assert!(matches!(beat_err, BeatError::Io(_)));
        assert!(beat_err.is_recoverable());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(BeatError::PoolExhausted {
            waited: Duration::ZERO
        }
        .is_recoverable());
        assert!(BeatError::PoolCreationFailed {
            attempts: 3,
            reason: "refused".into()
        }
        .is_recoverable());
        assert!(BeatError::ConnectionUnavailable("down".into()).is_recoverable());
        assert!(!BeatError::PoolClosed.is_recoverable());
        assert!(!BeatError::DuplicateHandler {
            kind: "heartbeat".into()
        }
        .is_recoverable());
        assert!(!BeatError::InvalidState {
            operation: "listen",
            state: "stopped".into()
        }
        .is_recoverable());
    }
}

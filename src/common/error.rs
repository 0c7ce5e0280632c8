//! Error types for the dispatcher

use crate::outbound::ConnectError;
use std::io;
use thiserror::Error;

/// Dispatcher error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No notification for key {key} within {waited_ms}ms")]
    CorrelationTimeout { key: u16, waited_ms: u64 },

    #[error("Duplicate notification for key {0}")]
    DuplicateNotification(u16),

    #[error("No usable upstream: {0}")]
    SelectionRejected(String),

    #[error("Upstream connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Forwarding error: {0}")]
    Forward(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn forward<S: Into<String>>(msg: S) -> Self {
        Error::Forward(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether an error surfacing from a forwarding task only affects that
    /// one connection.
    ///
    /// Anything else (a malformed or truncated notification stream) means
    /// destination information can no longer be trusted and the whole
    /// dispatcher must stop.
    pub fn is_per_connection(&self) -> bool {
        matches!(
            self,
            Error::CorrelationTimeout { .. }
                | Error::SelectionRejected(_)
                | Error::Connect(_)
                | Error::Forward(_)
                | Error::Io(_)
                | Error::Internal(_)
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::protocol("invalid record");
        assert_eq!(e.to_string(), "Protocol error: invalid record");
    }

    #[test]
    fn test_per_connection_classification() {
        assert!(Error::CorrelationTimeout {
            key: 4242,
            waited_ms: 500
        }
        .is_per_connection());
        assert!(Error::SelectionRejected("no socks5".into()).is_per_connection());
        // Emitted when two live connections computed the same key
        assert!(Error::internal("key 80 already awaited").is_per_connection());
        assert!(!Error::protocol("short record").is_per_connection());
        assert!(!Error::DuplicateNotification(80).is_per_connection());
    }
}

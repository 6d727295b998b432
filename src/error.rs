//! Error types for broker connection operations.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Outcome codes delivered through [`AsyncResult`](crate::future::AsyncResult).
///
/// A single failure is usually broadcast to many waiters, so the type is
/// `Clone`; I/O errors are shared behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Dial-level failure: refused, unreachable or timed out.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Protocol or authentication negotiation was rejected.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Request made after or during pool shutdown.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The target was already closed.
    #[error("Already closed")]
    AlreadyClosed,

    /// An established connection lost its peer.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,

    /// Service URL could not be parsed.
    #[error("Invalid service URL: {0}")]
    InvalidServiceUrl(String),

    /// The authentication provider failed to produce credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A frame on the wire could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

/// Result type alias for broker connection operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl Error {
    /// Create a new malformed frame error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Check if a caller may retry after this error (transient).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectFailed(_) | Self::Disconnected(_) | Self::Timeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ConnectFailed("127.0.0.1:6650: refused".into());
        assert_eq!(format!("{err}"), "Connect failed: 127.0.0.1:6650: refused");

        assert_eq!(format!("{}", Error::PoolClosed), "Connection pool is closed");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ConnectFailed("x".into()).is_retryable());
        assert!(Error::Disconnected("x".into()).is_retryable());
        assert!(!Error::HandshakeFailed("x".into()).is_retryable());
        assert!(!Error::PoolClosed.is_retryable());
        assert!(!Error::AlreadyClosed.is_retryable());
    }
}

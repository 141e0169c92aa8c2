//! Error types for the monitor

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the monitor
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Upstream stream errors
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection timed out after {0}ms")]
    ConnectionTimeout(u64),

    #[error("Subscribe stream closed: {0}")]
    StreamClosed(String),

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    // Filter errors
    #[error("Filter {filter} failed: {reason}")]
    Filter { filter: String, reason: String },

    #[error("Filter not found: {0}")]
    FilterNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage worker unavailable")]
    StorageClosed,

    // Notification errors
    #[error("Notification delivery failed: {0}")]
    Notification(String),

    #[error("Notification timed out after {0}ms")]
    NotificationTimeout(u64),

    // HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable (transient)
    ///
    /// Subscribe calls and notification attempts are retried only for these
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::ConnectionTimeout(_)
                | Error::StreamClosed(_)
                | Error::Notification(_)
                | Error::NotificationTimeout(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.into_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Notification(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Connection("refused".into()).is_retryable());
        assert!(Error::ConnectionTimeout(5000).is_retryable());
        assert!(!Error::Storage("corrupt".into()).is_retryable());
        assert!(!Error::Filter {
            filter: "dex".into(),
            reason: "bad index".into()
        }
        .is_retryable());
        assert!(!Error::Serialization("bad body".into()).is_retryable());
        assert!(!Error::Internal("decoder state lost".into()).is_retryable());
    }
}

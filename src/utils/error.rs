use crate::net::connector::ConnectionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SockPoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid destination {uri:?}: {reason}")]
    InvalidDestination { uri: String, reason: String },

    #[error("Connector failure: {0}")]
    Connector(#[source] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    /// Checkin or clear of a connection the pool never issued or already released.
    /// This is a caller bug, not a runtime condition.
    #[error("Unknown connection handle: {0}")]
    UnknownHandle(ConnectionId),

    #[error("Pending operation: a receive is already outstanding")]
    PendingOperation,

    #[error("Socket error: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SockPoolError {
    pub(crate) fn invalid_destination(uri: &str, reason: impl Into<String>) -> Self {
        SockPoolError::InvalidDestination {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SockPoolError>;

//! Error types for the client engine.

use thiserror::Error;

/// Main error type for connection and subscription operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid subscription")]
    BadSubscription,

    #[error("maximum messages delivered")]
    MaxMessagesReached,

    #[error("slow consumer, messages dropped")]
    SlowConsumer,

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("outbound buffer limit exceeded while reconnecting")]
    ReconnectBufferExceeded,

    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal call on an async subscription")]
    AsyncSubscription,

    #[error("message handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to start thread: {0}")]
    Thread(String),
}

impl ClientError {
    /// True for the expected outcome of a bounded wait that simply ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout)
    }

    /// True when retrying the same call can never succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::BadSubscription
                | ClientError::MaxMessagesReached
                | ClientError::ConnectionClosed
                | ClientError::AsyncSubscription
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::InvalidArgument(e.to_string())
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

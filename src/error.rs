//! Error types for the notification client

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when using the notification client
#[derive(Error, Debug)]
pub enum NotifyError {
    /// No usable credential in the store, so no identity to connect as
    #[error("No credential available")]
    NoCredential,

    /// The bounded connect attempts are used up until `disconnect()` resets them
    #[error("Connect attempts exhausted (max {max})")]
    RetryExhausted {
        /// Configured maximum number of attempts
        max: u32,
    },

    /// The session layer did not acknowledge the connection in time
    #[error("Connect timed out after {0:?}")]
    TransportTimeout(Duration),

    /// The session layer answered with an error frame
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The physical connection closed outside of `disconnect()`
    #[error("Connection closed: {0}")]
    UnexpectedClose(String),

    /// The pending connect was abandoned by `disconnect()`
    #[error("Connect cancelled")]
    Cancelled,

    /// Not currently connected to the server
    #[error("Not connected")]
    NotConnected,

    /// WebSocket or socket level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failed to decode a JSON payload
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl NotifyError {
    /// Whether a later `connect()` may succeed without caller intervention
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NotifyError::TransportTimeout(_)
                | NotifyError::ProtocolError(_)
                | NotifyError::UnexpectedClose(_)
                | NotifyError::Transport(_)
        )
    }
}

/// Result type for notification client operations
pub type Result<T> = std::result::Result<T, NotifyError>;

use thiserror::Error;

/// Result type for AZM operations
pub type Result<T> = std::result::Result<T, AzmError>;

/// Errors that can occur when talking to an AZM processor
#[derive(Error, Debug)]
pub enum AzmError {
    /// Connect, read or write failure on a socket
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// A frame could not be decoded or classified
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No matching response arrived before the deadline
    #[error("Request timeout")]
    Timeout,

    /// The control connection dropped while the request was outstanding
    #[error("Connection lost")]
    ConnectionLost,

    /// The control connection is not ready for requests
    #[error("Not connected")]
    NotConnected,

    /// The device rejected the request
    #[error("Device error: {message}")]
    Device {
        /// Message reported by the device
        message: String,
    },

    /// Value does not match its format tag
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Rejected client configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The client was shut down
    #[error("Client stopped")]
    Stopped,
}

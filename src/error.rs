use thiserror::Error;

/// Result type for Harvia operations
pub type Result<T> = std::result::Result<T, HarviaError>;

/// Errors that can occur when interacting with the MyHarvia cloud
#[derive(Error, Debug)]
pub enum HarviaError {
    /// Login rejected by the cloud (wrong email/password)
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The cached session can no longer be renewed; the caller must
    /// authenticate again with email and password
    #[error("Re-authentication required")]
    ReauthRequired,

    /// HTTP transport error (request/response channel)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// WebSocket transport error (push channel)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Command value rejected before transmission
    #[error("Invalid value for {attribute}: {reason}")]
    Validation {
        /// Attribute the command targeted
        attribute: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Device is unknown, or the attribute is not supported by it
    #[error("Device {device_id} unavailable: {reason}")]
    DeviceUnavailable {
        /// Target device
        device_id: String,
        /// Why the command was rejected
        reason: String,
    },

    /// Device not known to the cloud account
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Request timed out waiting for a response
    #[error("Request timeout")]
    Timeout,

    /// Engine was shut down
    #[error("Engine shut down")]
    Shutdown,

    /// Invalid or unexpected response from the cloud
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

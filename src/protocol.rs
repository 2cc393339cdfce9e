use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message sent by the client over the push channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake, sent immediately after the socket opens
    ConnectionInit,

    /// Start the account-scoped device subscription
    Start {
        id: Uuid,
        payload: SubscribePayload,
    },

    /// Stop the subscription before closing the socket
    Stop { id: Uuid },
}

/// Subscription parameters for a `start` frame
#[derive(Debug, Clone, Serialize)]
pub struct SubscribePayload {
    /// Account whose device topics to receive
    pub receiver: String,
    /// Bearer token proving the subscription is authorized
    pub authorization: String,
}

/// Message received from the server over the push channel
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgement; may carry the server's keepalive window
    ConnectionAck {
        #[serde(default)]
        payload: Option<AckPayload>,
    },

    /// Periodic keepalive
    Ka,

    /// Device-state delta
    Data {
        #[serde(default)]
        id: Option<Uuid>,
        payload: DeltaPayload,
    },

    /// Server-reported subscription error
    Error {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },

    /// Acknowledges a `stop` frame
    Complete {
        #[serde(default)]
        id: Option<Uuid>,
    },
}

/// Payload of a `connection_ack` frame
#[derive(Debug, Clone, Deserialize)]
pub struct AckPayload {
    /// Server-side keepalive window in milliseconds; silence longer than
    /// this means the connection is dead
    #[serde(rename = "connectionTimeoutMs")]
    pub connection_timeout_ms: Option<u64>,
}

/// Payload of a `data` frame: a partial state update for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaPayload {
    #[serde(rename = "deviceId")]
    pub device_id: String,

    pub timestamp: DateTime<Utc>,

    /// Changed attributes only; unchanged attributes are absent
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl ServerMessage {
    /// Parse a raw text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ClientMessage {
    /// Encode for transmission
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

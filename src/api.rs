use crate::auth::{Session, TokenEndpoint};
use crate::error::{HarviaError, Result};
use crate::types::DeviceInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

/// Full-state read for one device: the reported state document plus the
/// latest telemetry record, each carrying its own timestamp
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub device_id: String,
    pub display_name: Option<String>,
    pub reported: serde_json::Map<String, serde_json::Value>,
    pub reported_at: DateTime<Utc>,
    pub telemetry: serde_json::Map<String, serde_json::Value>,
    pub telemetry_at: DateTime<Utc>,
}

/// Request/response boundary toward the cloud: device discovery,
/// full-state fetches, and attribute writes
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// List all devices registered to the account
    async fn list_devices(&self, token: &str) -> Result<Vec<DeviceInfo>>;

    /// Fetch a full-state snapshot for one device
    async fn fetch_state(&self, token: &str, device_id: &str) -> Result<StateSnapshot>;

    /// Request a state change; the authoritative echo arrives later via
    /// push or poll, not in this response
    async fn send_command(
        &self,
        token: &str,
        device_id: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;
}

/// Derive the push-channel URL from the REST base URL
pub fn websocket_url(base_url: &str, token: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    };
    format!("{}/push?authorization={}", ws_base.trim_end_matches('/'), token)
}

/// HTTP client for the MyHarvia cloud REST API
///
/// Implements both the auth boundary ([`TokenEndpoint`]) and the
/// request/response boundary ([`DeviceGateway`]).
pub struct CloudApiClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    account_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenewResponse {
    access_token: String,
    expires_at: DateTime<Utc>,
    account_id: String,
    /// The cloud may rotate the refresh token; absent means keep the old one
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceEntry {
    device_id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateDocument {
    #[serde(default)]
    display_name: Option<String>,
    reported: serde_json::Map<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TelemetryDocument {
    data: serde_json::Map<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
}

impl CloudApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Map an error status on an authenticated request to the taxonomy
    fn check_status(status: StatusCode, device_id: Option<&str>) -> Result<()> {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HarviaError::ReauthRequired),
            StatusCode::NOT_FOUND => Err(HarviaError::NotFound(
                device_id.unwrap_or("unknown").to_string(),
            )),
            s if s.is_success() => Ok(()),
            s => Err(HarviaError::InvalidResponse(format!(
                "unexpected status {}",
                s
            ))),
        }
    }
}

#[async_trait]
impl TokenEndpoint for CloudApiClient {
    async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let response = self
            .http
            .post(self.url("/auth/login"))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(HarviaError::InvalidCredentials)
            }
            s if !s.is_success() => {
                return Err(HarviaError::InvalidResponse(format!(
                    "login failed with status {}",
                    s
                )))
            }
            _ => {}
        }

        let body: SessionResponse = response.json().await?;
        Ok(Session {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: body.expires_at,
            account_id: body.account_id,
        })
    }

    async fn renew(&self, refresh_token: &str) -> Result<Session> {
        let response = self
            .http
            .post(self.url("/auth/refresh"))
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                // Refresh token expired or revoked
                return Err(HarviaError::ReauthRequired);
            }
            s if !s.is_success() => {
                return Err(HarviaError::InvalidResponse(format!(
                    "token renewal failed with status {}",
                    s
                )))
            }
            _ => {}
        }

        let body: RenewResponse = response.json().await?;
        Ok(Session {
            access_token: body.access_token,
            refresh_token: body
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at: body.expires_at,
            account_id: body.account_id,
        })
    }
}

#[async_trait]
impl DeviceGateway for CloudApiClient {
    async fn list_devices(&self, token: &str) -> Result<Vec<DeviceInfo>> {
        let response = self
            .http
            .get(self.url("/devices"))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check_status(response.status(), None)?;

        let entries: Vec<DeviceEntry> = response.json().await?;
        Ok(entries
            .into_iter()
            .map(|e| DeviceInfo {
                device_id: e.device_id,
                display_name: e.display_name.unwrap_or_else(|| "Harvia Sauna".to_string()),
            })
            .collect())
    }

    async fn fetch_state(&self, token: &str, device_id: &str) -> Result<StateSnapshot> {
        let response = self
            .http
            .get(self.url(&format!("/devices/{}/state", device_id)))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check_status(response.status(), Some(device_id))?;
        let state: StateDocument = response.json().await?;

        let response = self
            .http
            .get(self.url(&format!("/devices/{}/data/latest", device_id)))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check_status(response.status(), Some(device_id))?;
        let telemetry: TelemetryDocument = response.json().await?;

        Ok(StateSnapshot {
            device_id: device_id.to_string(),
            display_name: state.display_name,
            reported: state.reported,
            reported_at: state.timestamp,
            telemetry: telemetry.data,
            telemetry_at: telemetry.timestamp,
        })
    }

    async fn send_command(
        &self,
        token: &str,
        device_id: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        tracing::debug!(device = device_id, payload = %serde_json::Value::Object(attributes.clone()),
            "sending state change");

        let response = self
            .http
            .post(self.url(&format!("/devices/{}/state", device_id)))
            .bearer_auth(token)
            .json(&serde_json::json!({ "state": attributes }))
            .send()
            .await?;
        Self::check_status(response.status(), Some(device_id))
    }
}

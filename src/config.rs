use std::time::Duration;

/// Default MyHarvia cloud base URL
pub const DEFAULT_BASE_URL: &str = "https://prod.myharvia-cloud.net";

/// Default heater power rating in watts (10.8 kW), used for the derived
/// energy counter when no rating is configured
pub const DEFAULT_HEATER_POWER_W: u32 = 10_800;

/// Tunable timeouts and intervals for the synchronization engine
///
/// All values default to the cloud service's expected cadence; override
/// individual fields for faster test runs or unusual deployments.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the MyHarvia cloud REST API
    pub base_url: String,

    /// How long an unconfirmed command's optimistic value may stand
    pub command_timeout: Duration,

    /// Maximum silence on the push channel before forcing a reconnect
    pub heartbeat_timeout: Duration,

    /// Renew the access token when its expiry is closer than this
    pub token_refresh_margin: Duration,

    /// Fallback polling interval per known device
    pub poll_interval: Duration,

    /// Attribute age beyond which it is reported unavailable
    pub staleness_window: Duration,

    /// First reconnect delay after an unexpected disconnect
    pub reconnect_base: Duration,

    /// Upper bound for the exponential reconnect backoff
    pub reconnect_cap: Duration,

    /// Sustained connected time after which the backoff resets to base
    pub backoff_reset_after: Duration,

    /// Planned reconnect interval for a healthy connection, so the
    /// server-side subscription lease is re-established periodically
    pub rotate_connection_after: Duration,

    /// Heater power rating in watts, for the cumulative energy counter
    pub heater_power_watts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            command_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            token_refresh_margin: Duration::from_secs(60),
            poll_interval: Duration::from_secs(300),
            staleness_window: Duration::from_secs(360),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(60),
            backoff_reset_after: Duration::from_secs(300),
            rotate_connection_after: Duration::from_secs(1800),
            heater_power_watts: DEFAULT_HEATER_POWER_W,
        }
    }
}

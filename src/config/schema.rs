use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::whep::signaling::API_PREFIX;

/// Default origin of the home-automation host serving the MediaMTX proxy
pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8123";

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WhepConfig {
    /// Base URL that relative endpoints and session URLs resolve against
    pub origin: String,
    /// Stream resource name (path on the media server)
    pub resource: String,
    /// Endpoint base URLs, rotated round-robin when ICE discovery fails
    pub endpoints: Vec<String>,
    /// Optional display name of the stream
    pub name: Option<String>,
    /// Bearer token settings
    pub auth: AuthConfig,
    /// Delays used by the recovery state machine
    pub timing: TimingConfig,
}

impl Default for WhepConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            resource: String::new(),
            endpoints: vec![API_PREFIX.to_string()],
            name: None,
            auth: AuthConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl WhepConfig {
    /// Check the fields the client cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.resource.trim().is_empty() {
            return Err(AppError::Config("You need to define a resource".to_string()));
        }
        if self.endpoints.is_empty() {
            return Err(AppError::Config(
                "At least one endpoint is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode the widget hand-off `?config=<base64 JSON>`
    ///
    /// Keys missing from the card config keep their defaults.
    pub fn from_card_query(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim().trim_start_matches("?config=");
        let json = general_purpose::STANDARD.decode(encoded)?;
        let config: WhepConfig = serde_json::from_slice(&json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Bearer token configuration
///
/// With only `access_token` set the token is used as-is. With `refresh_token`
/// and `expires` it is renewed against the host's token endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(alias = "clientId")]
    pub client_id: Option<String>,
    /// Expiry in milliseconds since the Unix epoch
    pub expires: Option<i64>,
}

impl AuthConfig {
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.expires.is_some()
    }
}

/// Recovery timings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait before a full restart after an error
    pub restart_delay_ms: u64,
    /// Poll interval while the ICE state is not yet readable
    pub state_poll_ms: u64,
    /// Linger after the data channel closed, letting the close propagate
    pub close_linger_ms: u64,
    /// Upper bound on waiting for the data channel to close
    pub close_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 5000,
            state_poll_ms: 500,
            close_linger_ms: 3000,
            close_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn state_poll(&self) -> Duration {
        Duration::from_millis(self.state_poll_ms)
    }

    pub fn close_linger(&self) -> Duration {
        Duration::from_millis(self.close_linger_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/*
[INPUT]:  Venue endpoints, timing and protocol limits
[OUTPUT]: Validated StreamConfig consumed by every layer
[POS]:    Configuration layer - connector setup
[UPDATE]: When adding new configuration options
*/

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, StreamError};
use crate::types::{ChecksumConvention, SignatureEncoding};

const DEFAULT_PUBLIC_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const DEFAULT_PRIVATE_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";

/// Keepalive frame sent by the ping task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "payload", rename_all = "lowercase")]
pub enum PingMode {
    /// Websocket control ping frame
    Control,
    /// Text frame with a literal payload; the venue answers with "pong"
    Text(String),
}

impl Default for PingMode {
    fn default() -> Self {
        PingMode::Text("ping".to_string())
    }
}

/// Top-level configuration for one venue connector
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Authenticated socket; `None` disables authenticated features
    #[serde(default = "default_private_url")]
    pub private_url: Option<String>,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default)]
    pub ping: PingMode,
    /// Default wait for request/response pairs
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Venue cap on a single outbound frame
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Venue-advertised subscription cap per connection
    #[serde(default)]
    pub max_subscriptions: Option<usize>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
    #[serde(default)]
    pub checksum: ChecksumConvention,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Login handshake parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_login_method")]
    pub login_method: String,
    #[serde(default)]
    pub signature_encoding: SignatureEncoding,
    /// Reply codes the venue uses for credential failures
    #[serde(default = "default_auth_error_codes")]
    pub error_codes: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_auth_timeout_secs(),
            login_path: default_login_path(),
            login_method: default_login_method(),
            signature_encoding: SignatureEncoding::default(),
            error_codes: default_auth_error_codes(),
        }
    }
}

impl AuthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Reconnect backoff parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_backoff_base_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_backoff_base_secs(),
            max_delay_secs: default_backoff_max_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    /// Doubling backoff starting at `base_delay_secs`, clamped at `max_delay_secs`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(63);
        let secs = self.base_delay_secs.saturating_mul(1u64 << exp);
        Duration::from_secs(secs.min(self.max_delay_secs))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            public_url: default_public_url(),
            private_url: default_private_url(),
            ping_interval_secs: default_ping_interval_secs(),
            ping: PingMode::default(),
            request_timeout_secs: default_request_timeout_secs(),
            max_message_bytes: default_max_message_bytes(),
            max_subscriptions: None,
            sweep_interval_secs: default_sweep_interval_secs(),
            inbound_queue_capacity: default_inbound_queue_capacity(),
            sink_capacity: default_sink_capacity(),
            checksum: ChecksumConvention::default(),
            auth: AuthConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Config for a venue reachable on the given public URL only
    pub fn public_only(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            private_url: None,
            ..Self::default()
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Reject values the connector cannot run with
    pub fn validate(&self) -> Result<()> {
        check_websocket_url(&self.public_url)?;
        if let Some(private_url) = &self.private_url {
            check_websocket_url(private_url)?;
        }
        if self.ping_interval_secs == 0 {
            return Err(StreamError::Config("ping_interval_secs must be > 0".to_string()));
        }
        if self.request_timeout_secs == 0 || self.auth.timeout_secs == 0 {
            return Err(StreamError::Config("timeouts must be > 0".to_string()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(StreamError::Config("sweep_interval_secs must be > 0".to_string()));
        }
        if self.max_message_bytes == 0 {
            return Err(StreamError::Config("max_message_bytes must be > 0".to_string()));
        }
        if self.inbound_queue_capacity == 0 || self.sink_capacity == 0 {
            return Err(StreamError::Config("queue capacities must be > 0".to_string()));
        }
        if self.max_subscriptions == Some(0) {
            return Err(StreamError::Config("max_subscriptions must be > 0 when set".to_string()));
        }
        Ok(())
    }
}

fn check_websocket_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(StreamError::Config(format!(
            "websocket URL {raw} has unsupported scheme {other}"
        ))),
    }
}

fn default_public_url() -> String {
    DEFAULT_PUBLIC_URL.to_string()
}

fn default_private_url() -> Option<String> {
    Some(DEFAULT_PRIVATE_URL.to_string())
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_message_bytes() -> usize {
    4096
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_inbound_queue_capacity() -> usize {
    5000
}

fn default_sink_capacity() -> usize {
    1000
}

fn default_auth_timeout_secs() -> u64 {
    15
}

fn default_login_path() -> String {
    "/users/self/verify".to_string()
}

fn default_login_method() -> String {
    "GET".to_string()
}

fn default_auth_error_codes() -> Vec<String> {
    ["60006", "60007", "60009", "60022", "60026"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_max_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.max_message_bytes, 4096);
        assert_eq!(config.auth.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_validate_rejects_http_scheme() {
        let config = StreamConfig::public_only("https://example.com/ws");
        let err = assert_err!(config.validate());
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let config = StreamConfig {
            max_message_bytes: 0,
            ..StreamConfig::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: StreamConfig = serde_json::from_value(serde_json::json!({
            "public_url": "ws://127.0.0.1:9000",
            "private_url": null,
            "ping": {"mode": "control"},
            "checksum": "unsigned"
        }))
        .unwrap();
        assert_eq!(config.public_url, "ws://127.0.0.1:9000");
        assert!(config.private_url.is_none());
        assert_eq!(config.ping, PingMode::Control);
        assert_eq!(config.checksum, ChecksumConvention::Unsigned);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_clamps_at_max() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.backoff(1), Duration::from_secs(1));
        assert_eq!(reconnect.backoff(2), Duration::from_secs(2));
        assert_eq!(reconnect.backoff(3), Duration::from_secs(4));
        assert_eq!(reconnect.backoff(6), Duration::from_secs(30));
        assert_eq!(reconnect.backoff(60), Duration::from_secs(30));
    }
}

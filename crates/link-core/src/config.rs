//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

/// Default delay before an automatic reconnect attempt
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
/// Default keepalive period while connected
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 30_000;
/// Default deadline for correlated requests
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default delay between acknowledging `RESTART` and restarting
pub const DEFAULT_RESTART_DELAY_MS: u64 = 3_000;
/// Connection mode announced in the handshake
pub const DEFAULT_CONNECTION_MODE: &str = "WEBSOCKET";
/// Connection mode of the HTTP polling link
pub const REST_CONNECTION_MODE: &str = "REST_API";
/// Default period between command polls in `REST_API` mode
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Configuration for the link engine
///
/// Identity fields are optional on purpose: a handset that has not been paired
/// yet has no server address or device id, and the engine must report that as
/// a configuration error rather than refuse to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Server address: bare host, `http(s)://` or `ws(s)://` URL
    pub server_url: Option<String>,
    /// Device identity issued during pairing
    pub device_id: Option<String>,
    /// Pre-issued bearer token sent in the handshake
    pub auth_token: Option<String>,
    /// `WEBSOCKET` or `REST_API`; picks the default connector and is sent in
    /// the handshake
    pub connection_mode: String,
    /// Reconnect automatically after a close or transport error
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub restart_delay_ms: u64,
    /// Command poll period in `REST_API` mode
    pub poll_interval_ms: u64,
    /// Capacity of the engine's inbound event queue
    pub event_queue_capacity: usize,
}

impl LinkConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            server_url: None,
            device_id: None,
            auth_token: None,
            connection_mode: DEFAULT_CONNECTION_MODE.to_string(),
            auto_reconnect: true,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            event_queue_capacity: 256,
        }
    }

    /// Set the server address
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Set the device identity
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Set the bearer token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the connection mode label
    pub fn with_connection_mode(mut self, mode: impl Into<String>) -> Self {
        self.connection_mode = mode.into();
        self
    }

    /// Set the command poll period used in `REST_API` mode
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enable or disable automatic reconnection
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the reconnect interval
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the keepalive interval
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The link polls over HTTP instead of holding a WebSocket
    pub fn is_rest_mode(&self) -> bool {
        self.connection_mode.eq_ignore_ascii_case(REST_CONNECTION_MODE)
    }

    /// Device id, or a configuration error if the handset is not paired
    pub fn require_device_id(&self) -> LinkResult<&str> {
        match self.device_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(LinkError::MissingConfiguration {
                field: "device_id".to_string(),
            }),
        }
    }

    /// Check the timing and capacity settings
    ///
    /// Identity fields are not checked here; they are resolved on every
    /// connect attempt so that a reconfigured handset can recover.
    pub fn validate(&self) -> LinkResult<()> {
        if self.reconnect_interval_ms == 0 {
            return Err(LinkError::invalid_config("reconnect_interval_ms", "must be greater than zero"));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(LinkError::invalid_config("keepalive_interval_ms", "must be greater than zero"));
        }
        if self.request_timeout_ms == 0 {
            return Err(LinkError::invalid_config("request_timeout_ms", "must be greater than zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(LinkError::invalid_config("poll_interval_ms", "must be greater than zero"));
        }
        if self.event_queue_capacity == 0 {
            return Err(LinkError::invalid_config("event_queue_capacity", "must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_timings() {
        let config = LinkConfig::default();
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.restart_delay(), Duration::from_secs(3));
        assert!(config.auto_reconnect);
        assert_eq!(config.connection_mode, "WEBSOCKET");
        assert!(!config.is_rest_mode());
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_blank_device_id_is_missing() {
        let config = LinkConfig::new().with_device_id("   ");
        assert_eq!(
            config.require_device_id(),
            Err(LinkError::MissingConfiguration { field: "device_id".into() })
        );
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: LinkConfig = serde_json::from_str(
            r#"{"server_url": "phone.example.com", "device_id": "DEV1", "auto_reconnect": false}"#,
        )
        .unwrap();
        assert_eq!(config.server_url.as_deref(), Some("phone.example.com"));
        assert!(!config.auto_reconnect);
        assert_eq!(config.keepalive_interval_ms, DEFAULT_KEEPALIVE_INTERVAL_MS);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = LinkConfig::default();
        config.keepalive_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidConfiguration { ref field, .. }) if field == "keepalive_interval_ms"
        ));

        let config = LinkConfig::default().with_poll_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidConfiguration { ref field, .. }) if field == "poll_interval_ms"
        ));
    }

    #[test]
    fn test_rest_mode_is_case_insensitive() {
        assert!(LinkConfig::new().with_connection_mode("rest_api").is_rest_mode());
        assert!(!LinkConfig::new().with_connection_mode("WEBSOCKET").is_rest_mode());
    }
}

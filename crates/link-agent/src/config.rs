//! Agent configuration file
//!
//! ```toml
//! [link]
//! server_url = "https://phone.example.com"
//! device_id = "DEV1"
//! auth_token = "..."
//! # connection_mode = "REST_API" polls the device API instead of a WebSocket
//!
//! [telemetry]
//! network_type = "WiFi"
//! signal_strength = 3
//!
//! [actuator]
//! hook = "/usr/local/libexec/modem-hook"
//! timeout_ms = 15000
//!
//! [log]
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use handset_link_core::LinkConfig;
use serde::{Deserialize, Serialize};

const APP_DIR: &str = "handset-link";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub link: LinkConfig,
    pub telemetry: TelemetryConfig,
    pub actuator: ActuatorConfig,
    pub log: LogConfig,
}

/// External program that performs telephony actions
///
/// Invoked as `hook <action> [args...]`, e.g. `hook dial +15551234`.
/// Without a hook, actions are only logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub hook: Option<PathBuf>,
    /// A hook still running after this long is killed
    pub timeout_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            hook: None,
            timeout_ms: 15_000,
        }
    }
}

impl ActuatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

/// Values the host cannot read from sysfs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Directory holding `*/capacity` and `*/status` battery entries
    pub power_supply_dir: PathBuf,
    pub network_type: String,
    pub signal_strength: u8,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            power_supply_dir: PathBuf::from("/sys/class/power_supply"),
            network_type: "Unknown".to_string(),
            signal_strength: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    /// Include source file and line
    pub file_info: bool,
    /// Log span enter and exit
    pub spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            spans: false,
        }
    }
}

/// `$XDG_CONFIG_HOME/handset-link/config.toml` or the platform equivalent
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

impl AgentConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid agent configuration")
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text).with_context(|| format!("in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("cannot render configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_are_optional() {
        let config = AgentConfig::from_toml(
            r#"
            [link]
            server_url = "phone.example.com"
            device_id = "DEV1"
            "#,
        )
        .unwrap();

        assert_eq!(config.link.server_url.as_deref(), Some("phone.example.com"));
        assert_eq!(config.link.device_id.as_deref(), Some("DEV1"));
        assert!(config.link.auto_reconnect);
        assert_eq!(config.telemetry, TelemetryConfig::default());
        assert_eq!(config.actuator.hook, None);
        assert_eq!(config.actuator.timeout(), Duration::from_secs(15));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_unknown_types_rejected() {
        let err = AgentConfig::from_toml("[link]\nauto_reconnect = \"yes\"").unwrap_err();
        assert!(err.to_string().contains("invalid agent configuration"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(AgentConfig::load(&path).unwrap(), AgentConfig::default());
    }

    #[test]
    fn test_rendered_config_reloads() {
        let mut config = AgentConfig::default();
        config.link = config.link.with_device_id("DEV9");
        config.telemetry.network_type = "4G".to_string();

        let reloaded = AgentConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(reloaded, config);
    }
}

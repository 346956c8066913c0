//! Battery telemetry from the Linux power-supply class

use std::fs;
use std::path::{Path, PathBuf};

use handset_link_core::{DeviceDescriptor, TelemetrySnapshot, TelemetrySource};
use tracing::trace;

use crate::config::TelemetryConfig;

/// Reads battery charge and charging state from sysfs on every snapshot
///
/// Network type and signal strength come from configuration. Any value that
/// cannot be read falls back to the [`TelemetrySnapshot`] default.
#[derive(Debug, Clone)]
pub struct SysfsTelemetry {
    power_supply_dir: PathBuf,
    network_type: String,
    signal_strength: u8,
    descriptor: DeviceDescriptor,
}

impl SysfsTelemetry {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            power_supply_dir: config.power_supply_dir.clone(),
            network_type: config.network_type.clone(),
            signal_strength: config.signal_strength.min(4),
            descriptor: DeviceDescriptor {
                manufacturer: read_trimmed(Path::new("/sys/class/dmi/id/sys_vendor")).unwrap_or_default(),
                model: read_trimmed(Path::new("/sys/class/dmi/id/product_name")).unwrap_or_default(),
                os_version: std::env::consts::OS.to_string(),
                app_version: handset_link_core::VERSION.to_string(),
            },
        }
    }

    /// First supply that reports a capacity, i.e. a battery
    fn battery_dir(&self) -> Option<PathBuf> {
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.power_supply_dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.join("capacity").is_file())
            .collect();
        entries.sort();
        entries.into_iter().next()
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

impl TelemetrySource for SysfsTelemetry {
    fn snapshot(&self) -> TelemetrySnapshot {
        let defaults = TelemetrySnapshot::default();
        let battery = self.battery_dir();

        let battery_level = battery
            .as_deref()
            .and_then(|dir| read_trimmed(&dir.join("capacity")))
            .and_then(|s| s.parse::<u8>().ok())
            .map(|level| level.min(100))
            .unwrap_or(defaults.battery_level);

        let is_charging = battery
            .as_deref()
            .and_then(|dir| read_trimmed(&dir.join("status")))
            .map(|status| matches!(status.as_str(), "Charging" | "Full"))
            .unwrap_or(defaults.is_charging);

        trace!(battery_level, is_charging, "Telemetry sampled");
        TelemetrySnapshot {
            battery_level,
            is_charging,
            network_type: self.network_type.clone(),
            signal_strength: self.signal_strength,
        }
    }

    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }
}

//! Interfaces to the handset platform
//!
//! The engine never touches the radio, the battery or the audio stack
//! directly. It consumes telemetry snapshots, asks an actuator to perform
//! telephony actions, and receives telephony signals from an observer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LinkResult;

/// Point-in-time device telemetry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    /// Battery charge, 0-100
    pub battery_level: u8,
    pub is_charging: bool,
    /// Network type label, e.g. "WiFi", "4G"
    pub network_type: String,
    /// Signal strength bars, 0-4
    pub signal_strength: u8,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            battery_level: 50,
            is_charging: false,
            network_type: "Unknown".to_string(),
            signal_strength: 2,
        }
    }
}

/// Static description of the handset, sent once per handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub manufacturer: String,
    pub model: String,
    pub os_version: String,
    pub app_version: String,
}

/// Source of device telemetry
pub trait TelemetrySource: Send + Sync {
    /// Take a snapshot; must not block
    fn snapshot(&self) -> TelemetrySnapshot;

    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            app_version: crate::VERSION.to_string(),
            ..Default::default()
        }
    }
}

/// Telemetry source that always reports the same values
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetry {
    pub snapshot: TelemetrySnapshot,
    pub descriptor: DeviceDescriptor,
}

impl StaticTelemetry {
    pub fn new(snapshot: TelemetrySnapshot) -> Self {
        Self {
            snapshot,
            descriptor: DeviceDescriptor {
                app_version: crate::VERSION.to_string(),
                ..Default::default()
            },
        }
    }
}

impl TelemetrySource for StaticTelemetry {
    fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.clone()
    }

    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }
}

/// Reference to an audio file the actuator should play into the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioRef {
    pub file_id: String,
    /// Download location derived from the server address, when known
    pub url: Option<String>,
}

/// Performs real telephony actions on the handset
///
/// Calls are fire-and-forget from the engine's point of view: they run on a
/// dedicated worker, and an `Err` is the direct failure callback. Success is
/// usually observed later through telephony signals.
#[async_trait]
pub trait CallActuator: Send + Sync {
    async fn place_call(&self, number: &str) -> LinkResult<()>;

    async fn answer(&self) -> LinkResult<()>;

    async fn hang_up(&self) -> LinkResult<()>;

    async fn send_tone(&self, digit: char) -> LinkResult<()>;

    async fn play_audio(&self, audio: &AudioRef) -> LinkResult<()>;
}

/// Signal from the handset's own telephony stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum TelephonySignal {
    /// An incoming call is ringing
    Ringing { number: String },
    /// The user dialed a number on the handset itself
    Outgoing { number: String },
    /// The line went off-hook (answered or connected)
    OffHook,
    /// The line returned to idle
    Idle,
}

impl TelephonySignal {
    pub fn label(&self) -> &'static str {
        match self {
            TelephonySignal::Ringing { .. } => "ringing",
            TelephonySignal::Outgoing { .. } => "outgoing",
            TelephonySignal::OffHook => "offhook",
            TelephonySignal::Idle => "idle",
        }
    }
}

//! Engine counters and snapshots

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::call::Call;
use crate::connection::ConnectionSnapshot;

/// Counters shared between the engine actor and its handles
#[derive(Debug, Default)]
pub struct EngineStats {
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    unknown_commands: AtomicU64,
    responses_correlated: AtomicU64,
    status_notifications: AtomicU64,
    outbound_dropped: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl EngineStats {
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame was undecodable or carried an unusable command payload
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_command(&self) {
        self.unknown_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_correlated(&self) {
        self.responses_correlated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status_notification(&self) {
        self.status_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbound_dropped(&self) {
        self.outbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            unknown_commands: self.unknown_commands.load(Ordering::Relaxed),
            responses_correlated: self.responses_correlated.load(Ordering::Relaxed),
            status_notifications: self.status_notifications.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub unknown_commands: u64,
    pub responses_correlated: u64,
    pub status_notifications: u64,
    pub outbound_dropped: u64,
    pub reconnect_attempts: u64,
}

/// Everything the engine can report about itself at one instant
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub connection: ConnectionSnapshot,
    pub call: Option<Call>,
    pub stats: StatsSnapshot,
    /// Correlated requests still waiting for a response
    pub pending_requests: usize,
}

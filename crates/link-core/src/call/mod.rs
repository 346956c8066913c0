//! Call tracking
//!
//! At most one call is current at any time. This module holds the call types
//! and the [`CallStateCoordinator`] that reconciles remote commands with the
//! handset's own telephony signals.

pub mod coordinator;

pub use coordinator::{Actuation, ActuationKind, CallEffects, CallStateCoordinator};

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::envelope::{kinds, Envelope};

/// Identifier of a call, assigned by the server or generated locally
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an id for a call the server did not originate
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Direction of a call from the handset's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Incoming => "incoming",
            CallDirection::Outgoing => "outgoing",
        }
    }
}

/// Lifecycle state of the current call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    /// Outgoing call placed, not yet connected
    Dialing,
    /// Incoming call ringing, not yet answered
    Ringing,
    Active,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::Ringing => "ringing",
            CallState::Active => "active",
            CallState::Ended => "ended",
        }
    }

    /// Dialing or ringing, i.e. set up but not connected
    pub fn is_pending(&self) -> bool {
        matches!(self, CallState::Dialing | CallState::Ringing)
    }
}

/// Status label reported to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Dialing,
    Active,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Dialing => "dialing",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Failed => "failed",
        }
    }
}

/// The current call
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub call_id: CallId,
    pub phone_number: String,
    pub direction: CallDirection,
    pub state: CallState,
    pub created_at: Instant,
    /// Set only on the transition into `Active`
    pub active_since: Option<Instant>,
}

impl Call {
    pub fn new(call_id: CallId, phone_number: impl Into<String>, direction: CallDirection, now: Instant) -> Self {
        let state = match direction {
            CallDirection::Outgoing => CallState::Dialing,
            CallDirection::Incoming => CallState::Ringing,
        };
        Self {
            call_id,
            phone_number: phone_number.into(),
            direction,
            state,
            created_at: now,
            active_since: None,
        }
    }

    /// Whole seconds since the call became active, 0 if it never did
    pub fn duration_secs(&self, now: Instant) -> u64 {
        self.active_since
            .map(|since| now.saturating_duration_since(since).as_secs())
            .unwrap_or(0)
    }

    pub(crate) fn status_update(&self, status: CallStatus, now: Instant) -> CallStatusUpdate {
        CallStatusUpdate {
            call_id: self.call_id.clone(),
            status,
            phone_number: self.phone_number.clone(),
            direction: self.direction,
            duration_secs: self.duration_secs(now),
        }
    }
}

/// Status notification emitted on every call transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatusUpdate {
    pub call_id: CallId,
    pub status: CallStatus,
    pub phone_number: String,
    pub direction: CallDirection,
    pub duration_secs: u64,
}

impl CallStatusUpdate {
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(kinds::CALL_STATUS)
            .with_field("callId", self.call_id.as_str())
            .with_field("status", self.status.as_str())
            .with_field("phoneNumber", self.phone_number.as_str())
            .with_field("direction", self.direction.as_str())
            .with_field("duration", self.duration_secs)
    }
}

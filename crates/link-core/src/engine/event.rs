//! Messages processed by the engine actor
//!
//! Everything that can change call or connection state arrives here, through
//! one queue, in the order it was posted.

use tokio::sync::oneshot;

use super::EngineSnapshot;
use crate::call::{ActuationKind, CallId};
use crate::device::TelephonySignal;
use crate::envelope::Envelope;
use crate::error::{LinkError, LinkResult};
use crate::transport::{TransportEvent, TransportLink};

/// Input to the engine actor
#[derive(Debug)]
pub enum EngineEvent {
    /// A background open finished
    Opened {
        attempt: u64,
        result: LinkResult<TransportLink>,
    },
    /// Something happened on the link opened by `attempt`
    Transport { attempt: u64, event: TransportEvent },
    /// Reconnect timer armed under `epoch` fired
    ReconnectDue { epoch: u64 },
    /// Keepalive tick for the link opened by `attempt`
    KeepaliveDue { attempt: u64 },
    /// Local telephony signal from the handset
    Telephony(TelephonySignal),
    /// The actuator reported a failure
    ActuationFailed {
        kind: ActuationKind,
        call_id: CallId,
        error: LinkError,
    },
    /// Acknowledged `RESTART` delay elapsed
    RestartDue,
    /// Request from an [`EngineHandle`](super::EngineHandle)
    Control(ControlRequest),
}

/// Requests made through the handle
#[derive(Debug)]
pub enum ControlRequest {
    Connect,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    SetAutoReconnect(bool),
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Shutdown,
}

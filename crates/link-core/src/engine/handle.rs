//! Cloneable handle to a running engine

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use super::{ControlRequest, EngineEvent, EngineSnapshot, EngineStats, StatsSnapshot};
use crate::connection::ConnectionState;
use crate::device::TelephonySignal;
use crate::envelope::Envelope;
use crate::error::{LinkError, LinkResult};
use crate::pending::PendingRequestTracker;

/// Talks to a [`LinkEngine`](super::LinkEngine) through its event queue
///
/// Every method fails with [`LinkError::EngineStopped`] once the engine has
/// returned from `run`.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<EngineEvent>,
    pending: Arc<PendingRequestTracker>,
    stats: Arc<EngineStats>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl EngineHandle {
    pub(crate) fn new(
        events: mpsc::Sender<EngineEvent>,
        pending: Arc<PendingRequestTracker>,
        stats: Arc<EngineStats>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            events,
            pending,
            stats,
            state_rx,
        }
    }

    async fn post(&self, event: EngineEvent) -> LinkResult<()> {
        self.events.send(event).await.map_err(|_| LinkError::EngineStopped)
    }

    async fn control(&self, request: ControlRequest) -> LinkResult<()> {
        self.post(EngineEvent::Control(request)).await
    }

    /// Start a connect attempt; progress is visible through the state watch
    pub async fn connect(&self) -> LinkResult<()> {
        self.control(ControlRequest::Connect).await
    }

    /// Close the link and cancel any pending reconnect
    pub async fn disconnect(&self) -> LinkResult<()> {
        let (done, rx) = oneshot::channel();
        self.control(ControlRequest::Disconnect { done }).await?;
        rx.await.map_err(|_| LinkError::EngineStopped)
    }

    pub async fn set_auto_reconnect(&self, enabled: bool) -> LinkResult<()> {
        self.control(ControlRequest::SetAutoReconnect(enabled)).await
    }

    /// Send an envelope without waiting for a response
    pub async fn send(&self, envelope: Envelope) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.control(ControlRequest::Send { envelope, reply }).await?;
        rx.await.map_err(|_| LinkError::EngineStopped)?
    }

    /// Send an envelope and wait for the correlated response
    ///
    /// The envelope gets a fresh message id. The call fails with
    /// [`LinkError::RequestTimeout`] when no response arrives within the
    /// configured request timeout, or with the send error when the envelope
    /// could not be transmitted.
    pub async fn request(&self, envelope: Envelope) -> LinkResult<Envelope> {
        let (envelope, pending) = self.pending.register(envelope);
        let message_id = pending.message_id().to_string();

        if let Err(e) = self.send(envelope).await {
            self.pending.cancel(&message_id);
            debug!(message_id = %message_id, error = %e, "Request not transmitted");
            return Err(e);
        }
        self.pending.wait(pending).await
    }

    /// Feed a local telephony signal into the engine
    pub async fn telephony_signal(&self, signal: TelephonySignal) -> LinkResult<()> {
        self.post(EngineEvent::Telephony(signal)).await
    }

    pub async fn snapshot(&self) -> LinkResult<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.control(ControlRequest::Snapshot { reply }).await?;
        rx.await.map_err(|_| LinkError::EngineStopped)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for_state(&self, state: ConnectionState) -> LinkResult<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::EngineStopped)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Ask the engine to stop; `run` returns [`EngineExit::Shutdown`](super::EngineExit)
    pub async fn shutdown(&self) -> LinkResult<()> {
        self.control(ControlRequest::Shutdown).await
    }
}

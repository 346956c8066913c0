//! The link engine actor
//!
//! [`LinkEngine`] owns the connection, the call coordinator and the pending
//! request tracker. It processes one [`EngineEvent`] at a time from a single
//! queue: decoded server frames, local telephony signals, timer ticks,
//! actuation failures and requests from [`EngineHandle`]s. That queue is the
//! only place call and connection state change, so remote commands and local
//! signals can arrive in any order without racing each other.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use handset_link_core::{LinkConfig, LinkEngineBuilder, EngineExit};
//! # use handset_link_core::{AudioRef, CallActuator, LinkResult};
//! # struct Phone;
//! # #[async_trait::async_trait]
//! # impl CallActuator for Phone {
//! #     async fn place_call(&self, _: &str) -> LinkResult<()> { Ok(()) }
//! #     async fn answer(&self) -> LinkResult<()> { Ok(()) }
//! #     async fn hang_up(&self) -> LinkResult<()> { Ok(()) }
//! #     async fn send_tone(&self, _: char) -> LinkResult<()> { Ok(()) }
//! #     async fn play_audio(&self, _: &AudioRef) -> LinkResult<()> { Ok(()) }
//! # }
//!
//! # async fn example() -> LinkResult<()> {
//! let config = LinkConfig::new()
//!     .with_server_url("phone.example.com")
//!     .with_device_id("DEV1");
//!
//! let (engine, handle) = LinkEngineBuilder::new(config)
//!     .actuator(Arc::new(Phone))
//!     .build()?;
//!
//! handle.connect().await?;
//! match engine.run().await {
//!     EngineExit::Restart => { /* re-exec the process */ }
//!     EngineExit::Shutdown => {}
//! }
//! # Ok(())
//! # }
//! ```

mod actuation;
mod builder;
mod event;
mod handle;
mod stats;

pub use builder::LinkEngineBuilder;
pub use event::{ControlRequest, EngineEvent};
pub use handle::EngineHandle;
pub use stats::{EngineSnapshot, EngineStats, StatsSnapshot};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::call::{CallEffects, CallStateCoordinator};
use crate::config::LinkConfig;
use crate::connection::ConnectionManager;
use crate::device::TelemetrySource;
use crate::dispatch::{dispatch, CommandKind, DispatchContext};
use crate::pending::PendingRequestTracker;
use actuation::ActuationWorker;

/// Why [`LinkEngine::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// A handle asked the engine to stop
    Shutdown,
    /// The server sent `RESTART`; the host should restart the process
    Restart,
}

/// Single owner of link and call state
pub struct LinkEngine {
    config: LinkConfig,
    connection: ConnectionManager,
    coordinator: CallStateCoordinator,
    telemetry: Arc<dyn TelemetrySource>,
    pending: Arc<PendingRequestTracker>,
    stats: Arc<EngineStats>,
    actuations: ActuationWorker,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,
    restart_timer: Option<JoinHandle<()>>,
}

impl LinkEngine {
    /// Process events until shutdown or restart
    pub async fn run(mut self) -> EngineExit {
        self.actuations.start(self.events_tx.clone());
        info!(version = crate::VERSION, "Link engine started");

        let exit = loop {
            // the engine holds a sender itself, so the queue never closes
            let Some(event) = self.events_rx.recv().await else {
                break EngineExit::Shutdown;
            };
            if let Some(exit) = self.handle_event(event).await {
                break exit;
            }
        };

        self.connection.shutdown().await;
        let abandoned = self.pending.cancel_all();
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
        self.actuations.stop();
        info!(exit = ?exit, abandoned_requests = abandoned, "Link engine stopped");
        exit
    }

    async fn handle_event(&mut self, event: EngineEvent) -> Option<EngineExit> {
        match event {
            EngineEvent::Opened { attempt, result } => self.connection.on_opened(attempt, result).await,
            EngineEvent::Transport { attempt, event } => {
                if let Some(frame) = self.connection.on_transport_event(attempt, event).await {
                    self.on_frame(&frame).await;
                }
            }
            EngineEvent::ReconnectDue { epoch } => self.connection.on_reconnect_due(epoch).await,
            EngineEvent::KeepaliveDue { attempt } => self.connection.on_keepalive_due(attempt).await,
            EngineEvent::Telephony(signal) => {
                debug!(signal = signal.label(), "Telephony signal");
                let effects = self.coordinator.on_signal(signal, Instant::now());
                self.apply(effects).await;
            }
            EngineEvent::ActuationFailed { kind, call_id, error } => {
                error!(action = kind.as_str(), call_id = %call_id, error = %error, "Platform refused actuation");
                let effects = self.coordinator.on_actuation_failed(kind, &call_id, Instant::now());
                self.apply(effects).await;
            }
            EngineEvent::RestartDue => {
                info!("Restart delay elapsed");
                return Some(EngineExit::Restart);
            }
            EngineEvent::Control(request) => return self.on_control(request).await,
        }
        None
    }

    async fn on_frame(&mut self, frame: &str) {
        self.stats.record_frame_received();

        let envelope = match self.connection.codec().decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.record_frame_dropped();
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };
        debug!(kind = envelope.kind(), message_id = envelope.message_id(), "Frame received");

        if self.pending.resolve(&envelope) {
            self.stats.record_response_correlated();
            debug!(kind = envelope.kind(), "Response delivered to waiting request");
            return;
        }

        let Some(kind) = CommandKind::from_type(envelope.kind()) else {
            self.stats.record_unknown_command();
            warn!(kind = envelope.kind(), "Ignoring unknown command");
            return;
        };

        let context = DispatchContext {
            coordinator: &mut self.coordinator,
            telemetry: self.telemetry.as_ref(),
            connection_state: self.connection.state(),
            endpoint: self.connection.endpoint(),
            restart_delay: self.config.restart_delay(),
            now: Instant::now(),
        };
        let outcome = match dispatch(kind, &envelope, context) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.record_frame_dropped();
                warn!(command = kind.as_str(), error = %e, "Dropping command with unusable payload");
                return;
            }
        };

        self.apply(outcome.effects).await;
        if let Some(response) = outcome.response {
            if let Err(e) = self.connection.send(response).await {
                debug!(command = kind.as_str(), error = %e, "Response not sent");
            }
        }
        if outcome.restart_requested {
            self.schedule_restart();
        }
    }

    /// Transmit status updates, then queue actuations, in order
    async fn apply(&mut self, effects: CallEffects) {
        for update in effects.updates {
            self.stats.record_status_notification();
            debug!(call_id = %update.call_id, status = update.status.as_str(), "Call status");
            if let Err(e) = self.connection.send(update.to_envelope()).await {
                debug!(call_id = %update.call_id, error = %e, "Call status not sent");
            }
        }
        for actuation in effects.actuations {
            self.actuations.submit(actuation);
        }
    }

    fn schedule_restart(&mut self) {
        if self.restart_timer.is_some() {
            debug!("Restart already scheduled");
            return;
        }
        let delay = self.config.restart_delay();
        let events = self.events_tx.clone();
        self.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(EngineEvent::RestartDue).await;
        }));
    }

    async fn on_control(&mut self, request: ControlRequest) -> Option<EngineExit> {
        match request {
            ControlRequest::Connect => self.connection.connect().await,
            ControlRequest::Disconnect { done } => {
                self.connection.disconnect().await;
                let _ = done.send(());
            }
            ControlRequest::SetAutoReconnect(enabled) => self.connection.set_auto_reconnect(enabled),
            ControlRequest::Send { envelope, reply } => {
                let result = self.connection.send(envelope).await;
                let _ = reply.send(result);
            }
            ControlRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ControlRequest::Shutdown => {
                info!("Shutdown requested");
                return Some(EngineExit::Shutdown);
            }
        }
        None
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            connection: self.connection.snapshot(),
            call: self.coordinator.current().cloned(),
            stats: self.stats.snapshot(),
            pending_requests: self.pending.in_flight(),
        }
    }
}

impl std::fmt::Debug for LinkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkEngine")
            .field("connection", &self.connection)
            .field("call_state", &self.coordinator.state())
            .finish()
    }
}

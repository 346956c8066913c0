//! Connection state machine
//!
//! [`ConnectionManager`] owns the transport for one logical link. It is driven
//! by the engine actor: every timer and transport callback it arms posts an
//! [`EngineEvent`] back into the engine queue, tagged with the attempt
//! generation or reconnect epoch that was current when it was armed. Events
//! carrying an older tag are stale and dropped on arrival.
//!
//! ```text
//!                connect()            open ok
//!  Disconnected ───────────► Connecting ───────► Connected
//!       ▲                        │                   │
//!       │ close          open failed           transport error
//!       └────────────────────────┴───► Error ◄──────┘
//! ```
//!
//! `Disconnected` (after a peer close) and `Error` arm one reconnect timer
//! unless auto-reconnect is off. Configuration faults park the link in
//! `Error` without arming anything.

pub mod endpoint;

pub use endpoint::{audio_download_url, http_base, resolve_endpoint};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::LinkConfig;
use crate::device::TelemetrySource;
use crate::engine::{EngineEvent, EngineStats};
use crate::envelope::{kinds, Envelope, MessageCodec};
use crate::error::{LinkError, LinkResult};
use crate::transport::{Connector, Transport, TransportEvent, TransportLink};

/// State of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }

    /// An open is in flight or the link is up
    pub fn is_busy(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Reconnect timers armed and not yet fired
    pub armed_reconnect_timers: usize,
}

struct ActiveLink {
    transport: Arc<dyn Transport>,
    forwarder: JoinHandle<()>,
}

/// Owns the transport and drives reconnection and keepalive
pub struct ConnectionManager {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    telemetry: Arc<dyn TelemetrySource>,
    events: mpsc::Sender<EngineEvent>,
    stats: Arc<EngineStats>,
    state_tx: watch::Sender<ConnectionState>,

    retry_count: u32,
    last_error: Option<String>,
    auto_reconnect: bool,

    /// Bumped on every connect, disconnect and shutdown
    attempt: u64,
    /// Bumped whenever a reconnect timer is armed or cancelled
    reconnect_epoch: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    opening: Option<JoinHandle<()>>,
    link: Option<ActiveLink>,

    endpoint: Option<Url>,
    codec: MessageCodec,
}

impl ConnectionManager {
    pub fn new(
        config: LinkConfig,
        connector: Arc<dyn Connector>,
        telemetry: Arc<dyn TelemetrySource>,
        events: mpsc::Sender<EngineEvent>,
        stats: Arc<EngineStats>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let auto_reconnect = config.auto_reconnect;
        let codec = MessageCodec::new(config.device_id.clone().unwrap_or_default());
        Self {
            config,
            connector,
            telemetry,
            events,
            stats,
            state_tx,
            retry_count: 0,
            last_error: None,
            auto_reconnect,
            attempt: 0,
            reconnect_epoch: 0,
            reconnect_timer: None,
            keepalive: None,
            opening: None,
            link: None,
            endpoint: None,
            codec,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Endpoint of the most recent attempt
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Reconnect timers currently armed; never more than one
    pub fn armed_reconnect_timers(&self) -> usize {
        self.reconnect_timer.iter().filter(|timer| !timer.is_finished()).count()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state(),
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            armed_reconnect_timers: self.armed_reconnect_timers(),
        }
    }

    /// Start a new connect attempt, closing any current link first
    ///
    /// Configuration problems end the attempt in `Error` without arming a
    /// reconnect. Otherwise the open runs in the background and its result
    /// arrives as [`EngineEvent::Opened`].
    pub async fn connect(&mut self) {
        self.attempt += 1;
        self.cancel_reconnect();
        self.teardown().await;

        let (device_id, endpoint) = match self.resolve_target() {
            Ok(target) => target,
            Err(e) => {
                error!(error = %e, "Cannot connect, handset is not configured");
                self.last_error = Some(e.to_string());
                self.set_state(ConnectionState::Error);
                return;
            }
        };

        self.codec = MessageCodec::new(device_id);
        self.endpoint = Some(endpoint.clone());
        self.set_state(ConnectionState::Connecting);

        let attempt = self.attempt;
        let connector = self.connector.clone();
        let events = self.events.clone();
        info!(attempt, endpoint = %endpoint, "Connecting");
        self.opening = Some(tokio::spawn(async move {
            let result = connector.connect(&endpoint).await;
            let _ = events.send(EngineEvent::Opened { attempt, result }).await;
        }));
    }

    fn resolve_target(&self) -> LinkResult<(String, Url)> {
        let device_id = self.config.require_device_id()?.to_string();
        let endpoint = resolve_endpoint(self.config.server_url.as_deref())?;
        Ok((device_id, endpoint))
    }

    /// Result of a background open
    pub async fn on_opened(&mut self, attempt: u64, result: LinkResult<TransportLink>) {
        if attempt != self.attempt || self.state() != ConnectionState::Connecting {
            debug!(attempt, current = self.attempt, "Discarding result of a superseded open");
            if let Ok(link) = result {
                let _ = link.transport.close().await;
            }
            return;
        }
        self.opening = None;

        match result {
            Ok(link) => {
                let TransportLink { transport, events } = link;
                let forwarder = self.spawn_forwarder(attempt, events);
                self.link = Some(ActiveLink { transport, forwarder });
                self.retry_count = 0;
                self.last_error = None;
                self.set_state(ConnectionState::Connected);

                let handshake = self.handshake();
                if let Err(e) = self.send(handshake).await {
                    warn!(error = %e, "Failed to send handshake");
                }
                self.start_keepalive(attempt);
            }
            Err(e) => {
                self.retry_count = self.retry_count.saturating_add(1);
                self.last_error = Some(e.to_string());
                warn!(error = %e, retry_count = self.retry_count, "Open failed");
                self.set_state(ConnectionState::Error);
                self.schedule_reconnect();
            }
        }
    }

    /// An event from the live link; returns the frame text to process, if any
    pub async fn on_transport_event(&mut self, attempt: u64, event: TransportEvent) -> Option<String> {
        if attempt != self.attempt || self.link.is_none() {
            trace!(attempt, current = self.attempt, "Discarding stale transport event");
            return None;
        }

        match event {
            TransportEvent::Frame(text) => Some(text),
            TransportEvent::Closed { reason } => {
                info!(reason = %reason, "Link closed by peer");
                self.teardown().await;
                self.last_error = Some(format!("closed: {}", reason));
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
                None
            }
            TransportEvent::Error { reason } => {
                warn!(reason = %reason, "Link failed");
                self.teardown().await;
                self.retry_count = self.retry_count.saturating_add(1);
                self.last_error = Some(reason);
                self.set_state(ConnectionState::Error);
                self.schedule_reconnect();
                None
            }
        }
    }

    /// Arm the reconnect timer if allowed and not already armed
    pub fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect {
            debug!("Auto-reconnect disabled, staying down");
            return;
        }
        if self.state().is_busy() {
            debug!(state = %self.state(), "Not arming reconnect, an attempt is in progress");
            return;
        }
        if self.armed_reconnect_timers() > 0 {
            debug!(epoch = self.reconnect_epoch, "Reconnect already armed");
            return;
        }

        self.reconnect_epoch += 1;
        let epoch = self.reconnect_epoch;
        let delay = self.config.reconnect_interval();
        let events = self.events.clone();
        info!(delay_ms = delay.as_millis() as u64, retry_count = self.retry_count, "Reconnect scheduled");
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(EngineEvent::ReconnectDue { epoch }).await;
        }));
    }

    /// The reconnect timer fired
    pub async fn on_reconnect_due(&mut self, epoch: u64) {
        if epoch != self.reconnect_epoch {
            debug!(epoch, current = self.reconnect_epoch, "Ignoring cancelled reconnect timer");
            return;
        }
        self.reconnect_timer = None;

        if !self.auto_reconnect || self.state().is_busy() {
            debug!(state = %self.state(), "Reconnect no longer needed");
            return;
        }

        self.stats.record_reconnect_attempt();
        info!(retry_count = self.retry_count, "Reconnecting");
        self.connect().await;
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
            debug!(epoch = self.reconnect_epoch, "Reconnect timer cancelled");
        }
        self.reconnect_epoch += 1;
    }

    /// Close the link on request; no reconnect follows
    pub async fn disconnect(&mut self) {
        self.attempt += 1;
        self.cancel_reconnect();
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected on request");
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
        if !enabled {
            self.cancel_reconnect();
        }
        info!(enabled, "Auto-reconnect updated");
    }

    /// Encode and transmit an envelope on the live link
    pub async fn send(&mut self, envelope: Envelope) -> LinkResult<()> {
        let transport = match (&self.link, self.state()) {
            (Some(link), ConnectionState::Connected) => link.transport.clone(),
            _ => {
                self.stats.record_outbound_dropped();
                warn!(kind = envelope.kind(), state = %self.state(), "Dropping outbound envelope, not connected");
                return Err(LinkError::NotConnected);
            }
        };

        let kind = envelope.kind().to_string();
        let frame = self.codec.encode(envelope)?;
        debug!(kind = %kind, bytes = frame.len(), "Sending frame");
        if let Err(e) = transport.send(frame).await {
            self.stats.record_outbound_dropped();
            warn!(kind = %kind, error = %e, "Transport rejected frame");
            return Err(e);
        }
        Ok(())
    }

    /// Keepalive tick for `attempt`
    pub async fn on_keepalive_due(&mut self, attempt: u64) {
        if attempt != self.attempt || self.state() != ConnectionState::Connected {
            trace!(attempt, "Keepalive for a link that is gone");
            return;
        }
        if let Err(e) = self.send(Envelope::new(kinds::PING)).await {
            debug!(error = %e, "Keepalive not sent");
        }
    }

    /// Stop everything; used when the engine exits
    pub async fn shutdown(&mut self) {
        self.attempt += 1;
        self.cancel_reconnect();
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
    }

    fn handshake(&self) -> Envelope {
        let telemetry = self.telemetry.snapshot();
        let descriptor = self.telemetry.descriptor();
        Envelope::new(kinds::CONNECT)
            .with_field("authToken", self.config.auth_token.clone().unwrap_or_default())
            .with_field("connectionMode", self.config.connection_mode.as_str())
            .with_field("batteryLevel", telemetry.battery_level)
            .with_field("isCharging", telemetry.is_charging)
            .with_field("networkType", telemetry.network_type)
            .with_field("signalStrength", telemetry.signal_strength)
            .with_field("manufacturer", descriptor.manufacturer)
            .with_field("model", descriptor.model)
            .with_field("osVersion", descriptor.os_version)
            .with_field("appVersion", descriptor.app_version)
    }

    fn spawn_forwarder(&self, attempt: u64, mut link_events: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let event = link_events.recv().await.unwrap_or_else(|| TransportEvent::Closed {
                    reason: "event stream ended".to_string(),
                });
                let terminal = !matches!(event, TransportEvent::Frame(_));
                if events.send(EngineEvent::Transport { attempt, event }).await.is_err() || terminal {
                    break;
                }
            }
        })
    }

    fn start_keepalive(&mut self, attempt: u64) {
        let period = self.config.keepalive_interval();
        let events = self.events.clone();
        self.keepalive = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if events.send(EngineEvent::KeepaliveDue { attempt }).await.is_err() {
                    break;
                }
            }
        }));
    }

    /// Stop keepalive, abandon any open in flight and close the link
    async fn teardown(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
        if let Some(link) = self.link.take() {
            link.forwarder.abort();
            if let Err(e) = link.transport.close().await {
                debug!(error = %e, "Error closing transport");
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Connection state changed");
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("attempt", &self.attempt)
            .field("retry_count", &self.retry_count)
            .field("reconnect_epoch", &self.reconnect_epoch)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TelemetrySnapshot;
    use crate::transport::{MemoryConnector, MemoryServer};
    use std::time::Duration;

    struct FixedTelemetry;

    impl TelemetrySource for FixedTelemetry {
        fn snapshot(&self) -> TelemetrySnapshot {
            TelemetrySnapshot {
                battery_level: 81,
                is_charging: true,
                network_type: "WiFi".into(),
                signal_strength: 4,
            }
        }
    }

    struct Harness {
        manager: ConnectionManager,
        events: mpsc::Receiver<EngineEvent>,
        connector: MemoryConnector,
        server: MemoryServer,
    }

    fn harness(config: LinkConfig) -> Harness {
        let (connector, server) = MemoryConnector::pair();
        let (events_tx, events) = mpsc::channel(64);
        let manager = ConnectionManager::new(
            config,
            Arc::new(connector.clone()),
            Arc::new(FixedTelemetry),
            events_tx,
            Arc::new(EngineStats::default()),
        );
        Harness {
            manager,
            events,
            connector,
            server,
        }
    }

    fn configured() -> LinkConfig {
        LinkConfig::new()
            .with_server_url("phone.example.com")
            .with_device_id("DEV1")
            .with_auth_token("secret")
    }

    impl Harness {
        /// Feed the next engine event back into the manager
        async fn pump(&mut self) {
            match self.events.recv().await.unwrap() {
                EngineEvent::Opened { attempt, result } => self.manager.on_opened(attempt, result).await,
                EngineEvent::ReconnectDue { epoch } => self.manager.on_reconnect_due(epoch).await,
                EngineEvent::KeepaliveDue { attempt } => self.manager.on_keepalive_due(attempt).await,
                EngineEvent::Transport { attempt, event } => {
                    self.manager.on_transport_event(attempt, event).await;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_sends_handshake_with_identity_and_telemetry() {
        let mut h = harness(configured());
        h.manager.connect().await;
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        h.pump().await;
        assert_eq!(h.manager.state(), ConnectionState::Connected);

        let mut peer = h.server.accept().await.unwrap();
        assert_eq!(peer.url().as_str(), "ws://phone.example.com/ws");
        let handshake = peer.recv_kind(kinds::CONNECT).await.unwrap();
        assert_eq!(handshake.device_id(), "DEV1");
        assert_eq!(handshake.str_field("authToken"), Some("secret"));
        assert_eq!(handshake.str_field("connectionMode"), Some("WEBSOCKET"));
        assert_eq!(handshake.field("batteryLevel").and_then(|v| v.as_u64()), Some(81));
        assert_eq!(handshake.str_field("networkType"), Some("WiFi"));
        assert_eq!(handshake.str_field("appVersion"), Some(crate::VERSION));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_configuration_is_terminal() {
        let mut h = harness(LinkConfig::new().with_device_id("DEV1"));
        h.manager.connect().await;

        assert_eq!(h.manager.state(), ConnectionState::Error);
        assert_eq!(h.manager.armed_reconnect_timers(), 0);
        assert!(h.manager.snapshot().last_error.unwrap().contains("server_url"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_counts_retry_and_reconnects() {
        let mut h = harness(configured());
        h.connector.refuse_next(2);
        h.manager.connect().await;

        h.pump().await;
        assert_eq!(h.manager.state(), ConnectionState::Error);
        assert_eq!(h.manager.snapshot().retry_count, 1);
        assert_eq!(h.manager.armed_reconnect_timers(), 1);

        // timer fires after the interval, second open is refused too
        h.pump().await;
        h.pump().await;
        assert_eq!(h.manager.snapshot().retry_count, 2);

        h.pump().await;
        h.pump().await;
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.manager.snapshot().retry_count, 0);
        assert_eq!(h.connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_faults_arm_a_single_timer() {
        let mut h = harness(configured());
        h.manager.connect().await;
        h.pump().await;

        h.manager.set_state(ConnectionState::Error);
        h.manager.schedule_reconnect();
        h.manager.schedule_reconnect();
        h.manager.schedule_reconnect();
        assert_eq!(h.manager.armed_reconnect_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let mut h = harness(configured());
        h.connector.refuse_next(1);
        h.manager.connect().await;
        h.pump().await;
        assert_eq!(h.manager.armed_reconnect_timers(), 1);

        h.manager.disconnect().await;
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.manager.armed_reconnect_timers(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reconnect_event_is_ignored() {
        let mut h = harness(configured());
        h.manager.set_state(ConnectionState::Error);
        h.manager.schedule_reconnect();
        let stale_epoch = h.manager.reconnect_epoch;

        h.manager.set_auto_reconnect(false);
        h.manager.on_reconnect_due(stale_epoch).await;
        assert_eq!(h.connector.attempts(), 0);
        assert_eq!(h.manager.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_then_keepalive_stops() {
        let mut h = harness(LinkConfig {
            keepalive_interval_ms: 1_000,
            ..configured()
        });
        h.manager.connect().await;
        h.pump().await;
        let mut peer = h.server.accept().await.unwrap();
        peer.recv_kind(kinds::CONNECT).await.unwrap();

        // one keepalive while connected
        h.pump().await;
        assert!(peer.recv_kind(kinds::PING).await.is_some());

        peer.close("going away").await;
        h.pump().await;
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.manager.armed_reconnect_timers(), 1);

        // the next thing to fire is the reconnect, not another keepalive
        assert!(matches!(h.events.recv().await, Some(EngineEvent::ReconnectDue { .. })));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_counted() {
        let h = harness(configured());
        let mut manager = h.manager;
        let stats = manager.stats.clone();
        assert_eq!(manager.send(Envelope::new(kinds::PING)).await, Err(LinkError::NotConnected));
        assert_eq!(stats.snapshot().outbound_dropped, 1);
    }
}

//! Shared harness for engine integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use handset_link_core::{
    kinds, AudioRef, CallActuator, EngineExit, EngineHandle, Envelope, LinkConfig, LinkEngineBuilder, LinkError,
    LinkResult, MemoryConnector, MemoryPeer, MemoryServer, TelemetrySnapshot, TelemetrySource,
};

/// Install a test-friendly subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("handset_link_core=debug")
        .with_test_writer()
        .try_init();
}

pub fn config() -> LinkConfig {
    LinkConfig::new()
        .with_server_url("phone.test")
        .with_device_id("DEV1")
        .with_auth_token("token-1")
}

/// Records every actuation it is asked to perform
#[derive(Debug, Default)]
pub struct RecordingActuator {
    actions: Mutex<Vec<String>>,
    refuse_calls: AtomicBool,
}

impl RecordingActuator {
    /// Make `place_call` fail from now on
    pub fn refuse_calls(&self) {
        self.refuse_calls.store(true, Ordering::SeqCst);
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    /// Wait until at least `count` actions were recorded
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let actions = self.actions();
                if actions.len() >= count {
                    return actions;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("actuations did not arrive")
    }

    fn record(&self, action: String) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl CallActuator for RecordingActuator {
    async fn place_call(&self, number: &str) -> LinkResult<()> {
        self.record(format!("place_call {number}"));
        if self.refuse_calls.load(Ordering::SeqCst) {
            return Err(LinkError::actuation("place_call", "no service"));
        }
        Ok(())
    }

    async fn answer(&self) -> LinkResult<()> {
        self.record("answer".to_string());
        Ok(())
    }

    async fn hang_up(&self) -> LinkResult<()> {
        self.record("hang_up".to_string());
        Ok(())
    }

    async fn send_tone(&self, digit: char) -> LinkResult<()> {
        self.record(format!("send_tone {digit}"));
        Ok(())
    }

    async fn play_audio(&self, audio: &AudioRef) -> LinkResult<()> {
        self.record(format!("play_audio {} {}", audio.file_id, audio.url.as_deref().unwrap_or("-")));
        Ok(())
    }
}

/// Telemetry whose values the test can change
#[derive(Debug)]
pub struct MockTelemetry {
    current: Mutex<TelemetrySnapshot>,
}

impl MockTelemetry {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(TelemetrySnapshot::default()),
        }
    }

    pub fn report(&self, snapshot: TelemetrySnapshot) {
        *self.current.lock().unwrap() = snapshot;
    }
}

impl TelemetrySource for MockTelemetry {
    fn snapshot(&self) -> TelemetrySnapshot {
        self.current.lock().unwrap().clone()
    }
}

/// A running engine wired to an in-memory server
pub struct TestLink {
    pub handle: EngineHandle,
    pub engine: JoinHandle<EngineExit>,
    pub connector: MemoryConnector,
    pub server: MemoryServer,
    pub actuator: Arc<RecordingActuator>,
    pub telemetry: Arc<MockTelemetry>,
}

impl TestLink {
    /// Build and spawn an engine without connecting it
    pub fn spawn(config: LinkConfig) -> Self {
        init_tracing();
        let (connector, server) = MemoryConnector::pair();
        let actuator = Arc::new(RecordingActuator::default());
        let telemetry = Arc::new(MockTelemetry::new());

        let (engine, handle) = LinkEngineBuilder::new(config)
            .connector(Arc::new(connector.clone()))
            .telemetry(telemetry.clone())
            .actuator(actuator.clone())
            .build()
            .expect("engine builds");

        Self {
            handle,
            engine: tokio::spawn(engine.run()),
            connector,
            server,
            actuator,
            telemetry,
        }
    }

    /// Spawn, connect, and return the server side with the handshake consumed
    pub async fn connected(config: LinkConfig) -> (Self, MemoryPeer) {
        let mut link = Self::spawn(config);
        link.handle.connect().await.unwrap();
        let mut peer = link.server.accept().await.expect("engine opened a link");
        peer.recv_kind(kinds::CONNECT).await.expect("handshake");
        (link, peer)
    }

    pub async fn stop(self) -> EngineExit {
        let _ = self.handle.shutdown().await;
        self.engine.await.expect("engine task")
    }
}

/// Command envelope as the server would send it
pub fn command(kind: &str, message_id: &str) -> Envelope {
    Envelope::new(kind).with_message_id(message_id).with_device_id("server")
}

/// Everything the engine sends up to and including the first `kind`,
/// keepalives left out
pub async fn collect_until(peer: &mut MemoryPeer, kind: &str) -> Vec<Envelope> {
    let mut seen = Vec::new();
    loop {
        let envelope = peer
            .recv()
            .await
            .expect("link still open")
            .expect("engine sends valid envelopes");
        if envelope.kind() == kinds::PING {
            continue;
        }
        let done = envelope.kind() == kind;
        seen.push(envelope);
        if done {
            return seen;
        }
    }
}

/// `(type, status)` pairs for compact assertions
pub fn summary(envelopes: &[Envelope]) -> Vec<(String, String)> {
    envelopes
        .iter()
        .map(|e| (e.kind().to_string(), e.str_field("status").unwrap_or("").to_string()))
        .collect()
}

pub fn pair(kind: &str, status: &str) -> (String, String) {
    (kind.to_string(), status.to_string())
}

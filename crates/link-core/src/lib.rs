//! # Handset Link - Remote Command & Call-State Synchronization
//!
//! This crate keeps a handset connected to a control server over a persistent
//! link and lets the server drive the handset's telephony: place, answer and
//! end calls, send tones, play audio, query status and restart. The handset's
//! own radio stack reports calls independently, and the engine reconciles both
//! sources into a single notion of the current call.
//!
//! ## Components
//!
//! - **envelope**: the JSON wire envelope and [`MessageCodec`]
//! - **pending**: request/response correlation with deadlines
//! - **connection**: connection state machine, reconnect and keepalive
//! - **dispatch**: command registry for inbound envelopes
//! - **call**: call types and the [`CallStateCoordinator`]
//! - **engine**: the actor that owns all of the above, and its handle
//! - **transport**: WebSocket, REST polling and in-memory connectors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use handset_link_core::{LinkConfig, LinkEngineBuilder, TelephonySignal};
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
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LinkConfig::new()
//!         .with_server_url("https://phone.example.com")
//!         .with_device_id("DEV1")
//!         .with_auth_token("token");
//!
//!     let (engine, handle) = LinkEngineBuilder::new(config)
//!         .actuator(Arc::new(Phone))
//!         .build()?;
//!     let engine = tokio::spawn(engine.run());
//!
//!     handle.connect().await?;
//!     handle
//!         .telephony_signal(TelephonySignal::Ringing { number: "+15551234".into() })
//!         .await?;
//!
//!     handle.shutdown().await?;
//!     engine.await?;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod config;
pub mod connection;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod pending;
pub mod transport;

// Re-export main types
pub use call::{
    Actuation, ActuationKind, Call, CallDirection, CallEffects, CallId, CallState, CallStateCoordinator, CallStatus,
    CallStatusUpdate,
};
pub use config::{LinkConfig, REST_CONNECTION_MODE};
pub use connection::{ConnectionSnapshot, ConnectionState};
pub use device::{
    AudioRef, CallActuator, DeviceDescriptor, StaticTelemetry, TelemetrySnapshot, TelemetrySource, TelephonySignal,
};
pub use dispatch::CommandKind;
pub use engine::{EngineExit, EngineHandle, EngineSnapshot, LinkEngine, LinkEngineBuilder, StatsSnapshot};
pub use envelope::{kinds, Envelope, MessageCodec};
pub use error::{LinkError, LinkResult};
pub use pending::{PendingRequestTracker, PendingStats};
pub use transport::{Connector, MemoryConnector, MemoryPeer, MemoryServer, Transport, TransportEvent, TransportLink};

#[cfg(feature = "rest")]
pub use transport::RestConnector;
#[cfg(feature = "ws")]
pub use transport::WebSocketConnector;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

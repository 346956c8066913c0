//! Framed text transports
//!
//! The engine talks to the server through a [`Connector`], which opens a
//! [`Transport`] to a URL and hands back the receiving side as a stream of
//! [`TransportEvent`]s. The production connector speaks WebSocket, the REST
//! connector polls the device API over HTTP for `REST_API` mode, and the
//! memory connector keeps both ends in-process.

pub mod memory;
#[cfg(feature = "rest")]
pub mod rest;
#[cfg(feature = "ws")]
pub mod ws;

pub use memory::{MemoryConnector, MemoryPeer, MemoryServer};
#[cfg(feature = "rest")]
pub use rest::RestConnector;
#[cfg(feature = "ws")]
pub use ws::WebSocketConnector;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::LinkResult;

/// Default capacity of per-link event and outbound queues
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Events reported by an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived
    Frame(String),
    /// The peer closed the link
    Closed { reason: String },
    /// The link failed
    Error { reason: String },
}

/// Sending half of an open link
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queue a text frame for transmission, preserving order
    async fn send(&self, frame: String) -> LinkResult<()>;

    /// Close the link; further sends fail
    async fn close(&self) -> LinkResult<()>;

    fn is_closed(&self) -> bool;
}

/// An open link: the send half plus its inbound events
#[derive(Debug)]
pub struct TransportLink {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens links to a server
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link; an `Err` is a failed low-level open
    async fn connect(&self, url: &Url) -> LinkResult<TransportLink>;
}

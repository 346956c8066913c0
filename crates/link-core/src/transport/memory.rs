//! In-process loopback connector
//!
//! [`MemoryConnector`] opens links whose far end is a [`MemoryPeer`] handed
//! out by the paired [`MemoryServer`]. The peer plays the remote server: it
//! reads what the engine sent, pushes frames back, and can close or break the
//! link at will. The connector can also be told to refuse opens.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use super::{Connector, Transport, TransportEvent, TransportLink, DEFAULT_CHANNEL_CAPACITY};
use crate::envelope::{Envelope, MessageCodec};
use crate::error::{LinkError, LinkResult};

/// Client side of the loopback pair
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    inner: Arc<ConnectorInner>,
}

#[derive(Debug)]
struct ConnectorInner {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    refuse_next: AtomicUsize,
    attempts: AtomicUsize,
}

/// Server side of the loopback pair; yields one peer per successful open
#[derive(Debug)]
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            inner: Arc::new(ConnectorInner {
                accepted: accepted_tx,
                refuse_next: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
            }),
        };
        (connector, MemoryServer { accepted: accepted_rx })
    }

    /// Make the next `count` opens fail as if the host were unreachable
    pub fn refuse_next(&self, count: usize) {
        self.inner.refuse_next.store(count, Ordering::SeqCst);
    }

    /// Number of open attempts seen so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> LinkResult<TransportLink> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .inner
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!(url = %url, "Memory connector refusing open");
            return Err(LinkError::transport(format!("connection to {} refused", url)));
        }

        let (events_tx, events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let peer = MemoryPeer {
            url: url.clone(),
            events: events_tx,
            inbound: outbound_rx,
            client_closed: closed.clone(),
            codec: MessageCodec::new("server"),
        };
        self.inner
            .accepted
            .send(peer)
            .map_err(|_| LinkError::transport("memory server dropped"))?;

        Ok(TransportLink {
            transport: Arc::new(MemoryTransport {
                outbound: outbound_tx,
                closed,
            }),
            events: events_rx,
        })
    }
}

impl MemoryServer {
    /// Wait for the next successful open
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }

    /// Take an already accepted peer without waiting
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.try_recv().ok()
    }
}

/// Remote end of one loopback link
#[derive(Debug)]
pub struct MemoryPeer {
    url: Url,
    events: mpsc::Sender<TransportEvent>,
    inbound: mpsc::UnboundedReceiver<String>,
    client_closed: Arc<AtomicBool>,
    codec: MessageCodec,
}

impl MemoryPeer {
    /// URL the client opened
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Next frame the client sent, `None` once the client side is gone
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Next frame the client sent, decoded
    pub async fn recv(&mut self) -> Option<LinkResult<Envelope>> {
        let frame = self.recv_frame().await?;
        Some(self.codec.decode(&frame))
    }

    /// Next envelope of the given type, skipping others (e.g. keepalives)
    pub async fn recv_kind(&mut self, kind: &str) -> Option<Envelope> {
        while let Some(result) = self.recv().await {
            if let Ok(envelope) = result {
                if envelope.kind() == kind {
                    return Some(envelope);
                }
            }
        }
        None
    }

    /// Frames already sent by the client, without waiting
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.inbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Deliver a raw text frame to the client
    pub async fn send_frame(&self, frame: impl Into<String>) -> LinkResult<()> {
        self.events
            .send(TransportEvent::Frame(frame.into()))
            .await
            .map_err(|_| LinkError::ConnectionClosed {
                reason: "client stopped reading".to_string(),
            })
    }

    /// Encode and deliver an envelope to the client
    pub async fn send(&self, envelope: Envelope) -> LinkResult<()> {
        let frame = self.codec.encode(envelope)?;
        self.send_frame(frame).await
    }

    /// Close the link from the server side
    pub async fn close(self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Break the link with a transport error
    pub async fn fail(self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Error {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Whether the client closed its side
    pub fn is_client_closed(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct MemoryTransport {
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: String) -> LinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionClosed {
                reason: "memory link closed".to_string(),
            });
        }
        self.outbound.send(frame).map_err(|_| LinkError::ConnectionClosed {
            reason: "memory peer dropped".to_string(),
        })
    }

    async fn close(&self) -> LinkResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::kinds;

    fn url() -> Url {
        Url::parse("ws://loopback/ws").unwrap()
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut server) = MemoryConnector::pair();
        let mut link = connector.connect(&url()).await.unwrap();
        let mut peer = server.accept().await.unwrap();

        link.transport.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.recv_frame().await.as_deref(), Some("hello"));

        peer.send(Envelope::new(kinds::PONG)).await.unwrap();
        match link.events.recv().await {
            Some(TransportEvent::Frame(text)) => assert!(text.contains("\"PONG\"")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refused_opens_are_counted() {
        let (connector, mut server) = MemoryConnector::pair();
        connector.refuse_next(2);

        assert!(connector.connect(&url()).await.is_err());
        assert!(connector.connect(&url()).await.is_err());
        assert!(connector.connect(&url()).await.is_ok());
        assert_eq!(connector.attempts(), 3);
        assert!(server.try_accept().is_some());
        assert!(server.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_sends() {
        let (connector, mut server) = MemoryConnector::pair();
        let link = connector.connect(&url()).await.unwrap();
        let peer = server.accept().await.unwrap();

        link.transport.close().await.unwrap();
        assert!(link.transport.is_closed());
        assert!(peer.is_client_closed());
        assert!(matches!(
            link.transport.send("late".to_string()).await,
            Err(LinkError::ConnectionClosed { .. })
        ));
    }
}

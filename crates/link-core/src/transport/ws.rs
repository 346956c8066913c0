//! WebSocket connector

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{Connector, Transport, TransportEvent, TransportLink, DEFAULT_CHANNEL_CAPACITY};
use crate::error::{LinkError, LinkResult};

/// Opens WebSocket links with `tokio-tungstenite`
///
/// Each link runs two tasks: a writer draining the outbound queue into the
/// socket, so frames leave in the order they were queued, and a reader
/// forwarding text frames until the socket closes or fails. Pings from the
/// server are answered by tungstenite itself.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    channel_capacity: usize,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> LinkResult<TransportLink> {
        debug!(url = %url, "Opening WebSocket");
        let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| LinkError::transport(format!("websocket open to {} failed: {}", url, e)))?;
        info!(url = %url, status = %response.status(), "WebSocket open");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(self.channel_capacity);
        let (events_tx, events_rx) = mpsc::channel(self.channel_capacity);
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = closed.clone();
        let writer_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    if !writer_closed.swap(true, Ordering::SeqCst) {
                        let _ = writer_events
                            .send(TransportEvent::Error {
                                reason: format!("websocket write failed: {}", e),
                            })
                            .await;
                    }
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
            trace!("WebSocket writer stopped");
        });

        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let terminal = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events_tx.send(TransportEvent::Frame(text)).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if events_tx.send(TransportEvent::Frame(text)).await.is_err() {
                                break None;
                            }
                        }
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "closed by peer".to_string());
                        break Some(TransportEvent::Closed { reason });
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        break Some(TransportEvent::Error {
                            reason: format!("websocket read failed: {}", e),
                        })
                    }
                    None => {
                        break Some(TransportEvent::Closed {
                            reason: "stream ended".to_string(),
                        })
                    }
                }
            };

            if !reader_closed.swap(true, Ordering::SeqCst) {
                if let Some(event) = terminal {
                    let _ = events_tx.send(event).await;
                }
            }
            trace!("WebSocket reader stopped");
        });

        Ok(TransportLink {
            transport: Arc::new(WebSocketTransport {
                outbound: outbound_tx,
                closed,
            }),
            events: events_rx,
        })
    }
}

#[derive(Debug)]
struct WebSocketTransport {
    outbound: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: String) -> LinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionClosed {
                reason: "websocket already closed".to_string(),
            });
        }
        self.outbound
            .send(Message::Text(frame))
            .await
            .map_err(|_| LinkError::ConnectionClosed {
                reason: "websocket writer stopped".to_string(),
            })
    }

    async fn close(&self) -> LinkResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // the writer may already be gone; closing twice is harmless
        let _ = self.outbound.send(Message::Close(None)).await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

//! Request/response correlation
//!
//! An outbound request registers a `oneshot` sender under its message id. The
//! entry leaves the map exactly once: either the matching response removes it
//! and completes the channel, or the deadline wins the race and the waiter
//! removes it itself. `DashMap::remove` is atomic, so whichever side removes
//! the entry is the only one allowed to act on it. A [`PendingRequest`] that
//! is dropped before either happens removes its own entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{LinkError, LinkResult};

/// Tracks requests that are waiting for a correlated response
#[derive(Debug)]
pub struct PendingRequestTracker {
    pending: Arc<DashMap<String, oneshot::Sender<Envelope>>>,
    timeout: Duration,
    resolved: AtomicU64,
    timed_out: AtomicU64,
}

/// A registered request that has not been awaited yet
///
/// Dropping it, including dropping a [`PendingRequestTracker::wait`] future
/// that owns it, unregisters the request.
#[derive(Debug)]
pub struct PendingRequest {
    message_id: String,
    rx: oneshot::Receiver<Envelope>,
    registry: Arc<DashMap<String, oneshot::Sender<Envelope>>>,
}

impl PendingRequest {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.registry.remove(&self.message_id).is_some() {
            debug!(message_id = %self.message_id, "Waiter gone, request unregistered");
        }
    }
}

/// Counters describing how pending requests ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    pub in_flight: usize,
    pub resolved: u64,
    pub timed_out: u64,
}

impl PendingRequestTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            timeout,
            resolved: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Assign a fresh message id to `envelope` and register it
    pub fn register(&self, envelope: Envelope) -> (Envelope, PendingRequest) {
        let message_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id.clone(), tx);
        debug!(message_id = %message_id, kind = envelope.kind(), "Registered pending request");

        let envelope = envelope.with_message_id(message_id.clone());
        let pending = PendingRequest {
            message_id,
            rx,
            registry: Arc::clone(&self.pending),
        };
        (envelope, pending)
    }

    /// Complete the pending request matching `envelope`, if any
    ///
    /// The correlation key is the `requestId` echo when the peer sends one,
    /// otherwise the envelope's own message id. Returns `true` when the
    /// envelope was consumed as a response.
    pub fn resolve(&self, envelope: &Envelope) -> bool {
        let message_id = envelope
            .str_field("requestId")
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| envelope.message_id());
        if message_id.is_empty() {
            return false;
        }

        match self.pending.remove(message_id) {
            Some((_, tx)) => {
                self.resolved.fetch_add(1, Ordering::Relaxed);
                if tx.send(envelope.clone()).is_err() {
                    debug!(message_id = %message_id, "Response arrived after the waiter went away");
                }
                true
            }
            None => false,
        }
    }

    /// Drop a registration without completing it
    ///
    /// Used when the request could not be transmitted at all.
    pub fn cancel(&self, message_id: &str) -> bool {
        self.pending.remove(message_id).is_some()
    }

    /// Wait for the response to a registered request
    ///
    /// The timeout is a race between the response channel and a timer. If the
    /// timer fires but the entry is already gone, a response claimed it first
    /// and the value is taken from the channel instead of reporting a timeout.
    pub async fn wait(&self, mut request: PendingRequest) -> LinkResult<Envelope> {
        let message_id = request.message_id.clone();
        let rx = &mut request.rx;

        match tokio::time::timeout(self.timeout, &mut *rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(LinkError::RequestCancelled { message_id }),
            Err(_) => {
                if self.pending.remove(&message_id).is_some() {
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(message_id = %message_id, "Request timed out");
                    Err(LinkError::RequestTimeout {
                        message_id,
                        timeout_ms: self.timeout.as_millis() as u64,
                    })
                } else {
                    rx.await.map_err(|_| LinkError::RequestCancelled { message_id })
                }
            }
        }
    }

    /// Fail every in-flight request, e.g. when the engine stops
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter(|id| self.pending.remove(*id).is_some()).count()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> PendingStats {
        PendingStats {
            in_flight: self.pending.len(),
            resolved: self.resolved.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

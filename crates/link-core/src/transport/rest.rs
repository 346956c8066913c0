//! HTTP polling connector for `REST_API` mode
//!
//! Some deployments cannot hold a WebSocket open. In that mode the handset
//! talks to the server's public device API with plain POST requests:
//!
//! | frame sent by the engine | request |
//! |---|---|
//! | `CONNECT` | `device-connect`, announcing the device online |
//! | `CALL_STATUS` | `device-call-action` with `action: UPDATE_CALL_STATUS` |
//! | `STATUS_RESPONSE` | `device-status` with the telemetry fields |
//! | other responses | `device-call-action` with `action` set to the type |
//! | `PING` | nothing, polling keeps the link alive |
//!
//! Once announced, the link polls `device-status` and hands every command in
//! the reply to the engine as a frame. Closing the link reports the device
//! offline. A failed announce or poll ends the link with an error, which the
//! engine treats like any other transport fault.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{Connector, Transport, TransportEvent, TransportLink, DEFAULT_CHANNEL_CAPACITY};
use crate::config::{DEFAULT_POLL_INTERVAL_MS, REST_CONNECTION_MODE};
use crate::connection::http_base;
use crate::envelope::kinds;
use crate::error::{LinkError, LinkResult};

pub const DEVICE_CONNECT_PATH: &str = "/api/public/device-connect";
pub const DEVICE_STATUS_PATH: &str = "/api/public/device-status";
pub const DEVICE_CALL_ACTION_PATH: &str = "/api/public/device-call-action";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens polling links with `reqwest`
#[derive(Debug, Clone)]
pub struct RestConnector {
    client: reqwest::Client,
    poll_interval: Duration,
    channel_capacity: usize,
}

impl RestConnector {
    pub fn new() -> LinkResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LinkError::internal(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }
}

#[async_trait]
impl Connector for RestConnector {
    /// HTTP needs no open; the link starts working once the handshake frame
    /// has been announced
    async fn connect(&self, url: &Url) -> LinkResult<TransportLink> {
        let base = http_base(url);
        debug!(base = %base, "Opening REST link");

        let (outbound_tx, outbound_rx) = mpsc::channel(self.channel_capacity);
        let (events_tx, events_rx) = mpsc::channel(self.channel_capacity);
        let closed = Arc::new(AtomicBool::new(false));

        let worker = RestWorker {
            client: self.client.clone(),
            base,
            poll_interval: self.poll_interval,
            device_id: None,
            events: events_tx,
            closed: closed.clone(),
        };
        tokio::spawn(worker.run(outbound_rx));

        Ok(TransportLink {
            transport: Arc::new(RestTransport {
                outbound: outbound_tx,
                closed,
            }),
            events: events_rx,
        })
    }
}

#[derive(Debug)]
enum Outbound {
    Frame(String),
    Close,
}

#[derive(Debug)]
struct RestTransport {
    outbound: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for RestTransport {
    async fn send(&self, frame: String) -> LinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionClosed {
                reason: "rest link already closed".to_string(),
            });
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| LinkError::ConnectionClosed {
                reason: "rest worker stopped".to_string(),
            })
    }

    async fn close(&self) -> LinkResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.outbound.send(Outbound::Close).await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Owns the HTTP side of one link; requests go out one at a time, in order
struct RestWorker {
    client: reqwest::Client,
    base: String,
    poll_interval: Duration,
    /// Set once the device has been announced
    device_id: Option<String>,
    events: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl RestWorker {
    async fn run(mut self, mut outbound: mpsc::Receiver<Outbound>) {
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                message = outbound.recv() => match message {
                    Some(Outbound::Frame(frame)) => self.on_frame(&frame).await,
                    Some(Outbound::Close) => {
                        self.go_offline().await;
                        break;
                    }
                    None => break,
                },
                _ = ticker.tick(), if self.device_id.is_some() => self.poll().await,
            };

            if let Err(reason) = step {
                if !self.closed.swap(true, Ordering::SeqCst) {
                    let _ = self.events.send(TransportEvent::Error { reason }).await;
                }
                break;
            }
        }
        trace!("REST worker stopped");
    }

    /// Map one outbound frame to its request; `Err` ends the link
    async fn on_frame(&mut self, frame: &str) -> Result<(), String> {
        let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(frame) else {
            warn!("Dropping outbound frame that is not a JSON object");
            return Ok(());
        };
        let kind = fields.get("type").and_then(Value::as_str).unwrap_or_default().to_string();

        match kind.as_str() {
            kinds::CONNECT => self.announce(fields).await,
            kinds::PING => {
                trace!("Keepalive not needed on a polling link");
                Ok(())
            }
            kinds::CALL_STATUS => {
                let body = call_status_body(&fields);
                self.post_logged(DEVICE_CALL_ACTION_PATH, &body).await;
                Ok(())
            }
            kinds::STATUS_RESPONSE => {
                let mut body = fields;
                body.insert("status".to_string(), json!("online"));
                self.post_logged(DEVICE_STATUS_PATH, &Value::Object(body)).await;
                Ok(())
            }
            _ => {
                let mut body = fields;
                body.insert("action".to_string(), json!(kind));
                self.post_logged(DEVICE_CALL_ACTION_PATH, &Value::Object(body)).await;
                Ok(())
            }
        }
    }

    async fn announce(&mut self, handshake: Map<String, Value>) -> Result<(), String> {
        let device_id = handshake
            .get("deviceId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let reply = self
            .post(DEVICE_CONNECT_PATH, &announce_body(handshake))
            .await
            .map_err(|e| format!("device announce failed: {}", e))?;
        info!(device_id = %device_id, base = %self.base, "Device announced over REST");
        self.device_id = Some(device_id);
        self.deliver(reply.get("pendingCommands")).await
    }

    async fn poll(&mut self) -> Result<(), String> {
        let Some(device_id) = self.device_id.clone() else {
            return Ok(());
        };
        let reply = self
            .post(DEVICE_STATUS_PATH, &json!({ "deviceId": device_id }))
            .await
            .map_err(|e| format!("command poll failed: {}", e))?;
        self.deliver(reply.get("commands")).await
    }

    /// Report the device offline; best effort, the link is going away
    async fn go_offline(&mut self) {
        let Some(device_id) = self.device_id.take() else {
            return;
        };
        let body = json!({ "deviceId": device_id, "status": "offline" });
        self.post_logged(DEVICE_STATUS_PATH, &body).await;
        debug!(device_id = %device_id, "Device reported offline");
    }

    /// Forward commands from a reply to the engine as frames
    async fn deliver(&self, commands: Option<&Value>) -> Result<(), String> {
        for command in command_list(commands) {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            if self.events.send(TransportEvent::Frame(command.to_string())).await.is_err() {
                return Err("engine stopped listening".to_string());
            }
        }
        Ok(())
    }

    async fn post(&self, path: &str, body: &Value) -> LinkResult<Value> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| LinkError::transport(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LinkError::transport(format!("POST {} returned HTTP {}", url, status.as_u16())));
        }
        let text = response
            .text()
            .await
            .map_err(|e| LinkError::transport(format!("POST {} body unreadable: {}", url, e)))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!(url = %url, error = %e, "Ignoring reply that is not JSON");
            Value::Null
        }))
    }

    async fn post_logged(&self, path: &str, body: &Value) {
        if let Err(e) = self.post(path, body).await {
            warn!(path, error = %e, "Device API request failed");
        }
    }
}

/// Handshake fields plus the online marker and a `deviceInfo` summary
fn announce_body(mut handshake: Map<String, Value>) -> Value {
    let pick = |key: &str| handshake.get(key).cloned().unwrap_or(Value::Null);
    let device_info = json!({
        "deviceModel": pick("model"),
        "osVersion": pick("osVersion"),
        "batteryLevel": pick("batteryLevel"),
        "networkType": pick("networkType"),
    });
    handshake.insert("status".to_string(), json!("online"));
    handshake.insert("connectionMode".to_string(), json!(REST_CONNECTION_MODE));
    handshake.insert("deviceInfo".to_string(), device_info);
    Value::Object(handshake)
}

fn call_status_body(fields: &Map<String, Value>) -> Value {
    let pick = |key: &str| fields.get(key).cloned().unwrap_or(Value::Null);
    json!({
        "deviceId": pick("deviceId"),
        "action": "UPDATE_CALL_STATUS",
        "callId": pick("callId"),
        "phoneNumber": pick("phoneNumber"),
        "callStatus": pick("status"),
        "direction": pick("direction"),
        "duration": pick("duration"),
        "timestamp": pick("timestamp"),
    })
}

/// Commands arrive as an array of envelopes or a single envelope
fn command_list(commands: Option<&Value>) -> Vec<&Value> {
    match commands {
        Some(Value::Array(items)) => items.iter().filter(|item| item.is_object()).collect(),
        Some(command) if command.get("type").is_some() => vec![command],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_overrides_connection_mode() {
        let handshake = json!({
            "type": "CONNECT",
            "deviceId": "DEV1",
            "connectionMode": "WEBSOCKET",
            "model": "Pixel",
            "batteryLevel": 77,
        });
        let Value::Object(fields) = handshake else { unreachable!() };

        let body = announce_body(fields);
        assert_eq!(body["connectionMode"], "REST_API");
        assert_eq!(body["status"], "online");
        assert_eq!(body["deviceId"], "DEV1");
        assert_eq!(body["deviceInfo"]["deviceModel"], "Pixel");
        assert_eq!(body["deviceInfo"]["batteryLevel"], 77);
    }

    #[test]
    fn test_call_status_maps_to_call_action() {
        let frame = json!({
            "type": "CALL_STATUS",
            "deviceId": "DEV1",
            "callId": "c1",
            "status": "active",
            "phoneNumber": "+15551234",
            "direction": "incoming",
            "duration": 0,
        });
        let Value::Object(fields) = frame else { unreachable!() };

        let body = call_status_body(&fields);
        assert_eq!(body["action"], "UPDATE_CALL_STATUS");
        assert_eq!(body["callStatus"], "active");
        assert_eq!(body["callId"], "c1");
    }

    #[test]
    fn test_command_list_shapes() {
        let list = json!([{"type": "GET_STATUS"}, 7, {"type": "PONG"}]);
        assert_eq!(command_list(Some(&list)).len(), 2);

        let single = json!({"type": "END_CALL", "callId": "c1"});
        assert_eq!(command_list(Some(&single)).len(), 1);

        assert!(command_list(Some(&json!({}))).is_empty());
        assert!(command_list(None).is_empty());
    }
}

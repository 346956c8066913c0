//! Wire envelope and the codec that moves it on and off the transport
//!
//! Every frame on the link is a JSON object with four header fields and any
//! number of payload fields flattened next to them:
//!
//! ```text
//! {"messageId":"…","deviceId":"DEV1","timestamp":1700000000000,"type":"CALL","callId":"c1","phoneNumber":"+1555…"}
//! ```

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{LinkError, LinkResult};

/// Message type tags used on the wire
pub mod kinds {
    pub const CONNECT: &str = "CONNECT";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const CALL_STATUS: &str = "CALL_STATUS";

    pub const CALL: &str = "CALL";
    pub const END_CALL: &str = "END_CALL";
    pub const ANSWER_CALL: &str = "ANSWER_CALL";
    pub const SEND_DTMF: &str = "SEND_DTMF";
    pub const PLAY_AUDIO: &str = "PLAY_AUDIO";
    pub const GET_STATUS: &str = "GET_STATUS";
    pub const RESTART: &str = "RESTART";

    pub const CALL_RESPONSE: &str = "CALL_RESPONSE";
    pub const END_CALL_RESPONSE: &str = "END_CALL_RESPONSE";
    pub const ANSWER_CALL_RESPONSE: &str = "ANSWER_CALL_RESPONSE";
    pub const DTMF_RESPONSE: &str = "DTMF_RESPONSE";
    pub const PLAY_AUDIO_RESPONSE: &str = "PLAY_AUDIO_RESPONSE";
    pub const STATUS_RESPONSE: &str = "STATUS_RESPONSE";
    pub const RESTART_RESPONSE: &str = "RESTART_RESPONSE";
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Identifier header from a string or number value
fn header_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A single message exchanged over the link
///
/// Envelopes are values: the `with_*` methods consume and return a new
/// envelope, nothing mutates one in place after it has been built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "messageId", default, skip_serializing_if = "String::is_empty")]
    message_id: String,
    #[serde(rename = "deviceId", default, skip_serializing_if = "String::is_empty")]
    device_id: String,
    /// Epoch milliseconds, 0 when not yet stamped
    #[serde(default, skip_serializing_if = "is_zero")]
    timestamp: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope of the given type with an empty payload
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            message_id: String::new(),
            device_id: String::new(),
            timestamp: 0,
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Create a response envelope that echoes the request's message id
    pub fn response_to(request: &Envelope, kind: impl Into<String>) -> Self {
        let response = Self::new(kind);
        if request.message_id.is_empty() {
            response
        } else {
            response.with_field("requestId", request.message_id.clone())
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = timestamp_ms;
        self
    }

    /// Add or replace a payload field
    ///
    /// Header keys (`messageId`, `deviceId`, `timestamp`, `type`) set the
    /// header instead, so the encoded frame never repeats a key. A header
    /// value of the wrong JSON type is ignored.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        match key.as_str() {
            "messageId" => {
                if let Some(id) = header_text(&value) {
                    self.message_id = id;
                }
            }
            "deviceId" => {
                if let Some(id) = header_text(&value) {
                    self.device_id = id;
                }
            }
            "timestamp" => {
                if let Some(ms) = value.as_i64() {
                    self.timestamp = ms;
                }
            }
            "type" => {
                if let Value::String(kind) = value {
                    self.kind = kind;
                }
            }
            _ => {
                self.payload.insert(key, value);
            }
        }
        self
    }

    /// Add a payload field only when a value is present
    pub fn with_optional_field<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with_field(key, value),
            None => self,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Deserialize the payload fields into a typed command body
    pub fn payload_as<T: DeserializeOwned>(&self) -> LinkResult<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| LinkError::invalid_payload(self.kind.clone(), e.to_string()))
    }

    fn is_stamped(&self) -> bool {
        !self.message_id.is_empty() && !self.device_id.is_empty() && self.timestamp != 0
    }
}

/// Encodes envelopes to JSON text frames and decodes them back
///
/// The codec is tied to the device identity so that outbound envelopes can be
/// stamped with it when the caller left it out.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    device_id: String,
}

impl MessageCodec {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Fill in `messageId`, `deviceId` and `timestamp` where they are missing
    pub fn stamp(&self, envelope: Envelope) -> Envelope {
        if envelope.is_stamped() {
            return envelope;
        }
        let mut envelope = envelope;
        if envelope.message_id.is_empty() {
            envelope.message_id = Uuid::new_v4().to_string();
        }
        if envelope.device_id.is_empty() {
            envelope.device_id = self.device_id.clone();
        }
        if envelope.timestamp == 0 {
            envelope.timestamp = Utc::now().timestamp_millis();
        }
        envelope
    }

    /// Stamp and serialize an envelope into a text frame
    pub fn encode(&self, envelope: Envelope) -> LinkResult<String> {
        let envelope = self.stamp(envelope);
        serde_json::to_string(&envelope)
            .map_err(|e| LinkError::internal(format!("failed to encode {}: {}", envelope.kind, e)))
    }

    /// Parse a text frame into an envelope
    ///
    /// Anything that is not a JSON object with a string `type` is rejected as
    /// malformed; the caller decides to drop it.
    pub fn decode(&self, text: &str) -> LinkResult<Envelope> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.kind.trim().is_empty() {
            return Err(LinkError::malformed("empty message type"));
        }
        Ok(envelope)
    }
}

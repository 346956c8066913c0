//! Error types for the link engine
//!
//! Errors are grouped by category so callers can pick a recovery strategy:
//!
//! - **Configuration errors** - missing or malformed local settings. The engine
//!   parks the connection in `Error` and never retries on its own.
//! - **Network errors** - transport failures, usually cured by the automatic
//!   reconnect loop.
//! - **Protocol errors** - frames that could not be decoded or whose command
//!   payload is incomplete. The frame is dropped, the connection stays up.
//! - **Request errors** - correlated requests that timed out or were abandoned.
//! - **Actuation errors** - the platform refused to perform a telephony action.
//!
//! # Example
//!
//! ```rust
//! use handset_link_core::LinkError;
//!
//! let err = LinkError::MissingConfiguration { field: "server_url".to_string() };
//! assert!(!err.is_recoverable());
//! assert_eq!(err.category(), "configuration");
//!
//! let err = LinkError::transport("connection reset by peer");
//! assert!(err.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias for link operations
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors produced by the link engine and its collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Configuration errors
    #[error("Missing required configuration: {field}")]
    MissingConfiguration { field: String },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// Transport and connection errors
    #[error("Transport failed: {reason}")]
    Transport { reason: String },

    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Not connected")]
    NotConnected,

    /// Protocol errors
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    #[error("Invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    /// Request correlation errors
    #[error("Request {message_id} timed out after {timeout_ms}ms")]
    RequestTimeout { message_id: String, timeout_ms: u64 },

    #[error("Request {message_id} was abandoned before a response arrived")]
    RequestCancelled { message_id: String },

    /// Actuation errors
    #[error("Actuation {action} failed: {reason}")]
    Actuation { action: String, reason: String },

    /// Engine lifecycle errors
    #[error("Engine is not running")]
    EngineStopped,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LinkError {
    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    /// Create a malformed envelope error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope { reason: reason.into() }
    }

    /// Create an invalid payload error for a command kind
    pub fn invalid_payload(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create an actuation error
    pub fn actuation(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Actuation {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if this error is recoverable by retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            LinkError::Transport { .. }
            | LinkError::ConnectionClosed { .. }
            | LinkError::NotConnected
            | LinkError::RequestTimeout { .. } => true,

            LinkError::MissingConfiguration { .. }
            | LinkError::InvalidConfiguration { .. }
            | LinkError::MalformedEnvelope { .. }
            | LinkError::InvalidPayload { .. } => false,

            _ => false,
        }
    }

    /// Check if this error comes from local misconfiguration
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            LinkError::MissingConfiguration { .. } | LinkError::InvalidConfiguration { .. }
        )
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            LinkError::MissingConfiguration { .. } | LinkError::InvalidConfiguration { .. } => {
                "configuration"
            }

            LinkError::Transport { .. }
            | LinkError::ConnectionClosed { .. }
            | LinkError::NotConnected => "network",

            LinkError::MalformedEnvelope { .. } | LinkError::InvalidPayload { .. } => "protocol",

            LinkError::RequestTimeout { .. } | LinkError::RequestCancelled { .. } => "request",

            LinkError::Actuation { .. } => "actuation",

            LinkError::EngineStopped | LinkError::Internal { .. } => "system",
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::malformed(err.to_string())
    }
}

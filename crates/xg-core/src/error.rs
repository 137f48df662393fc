//! Typed error definitions for the exchange gateway.
//!
//! Every fallible operation in the REST and stream crates returns
//! [`XgError`]. Transport-fatal classes (`Connection`, `Protocol`,
//! `WebSocket`) are resolved by tearing the stream down; everything else is
//! returned to the calling operation and never affects the connection.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the gateway crates.
pub type Result<T> = std::result::Result<T, XgError>;

/// Domain-specific errors for the exchange gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum XgError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Dialing the stream endpoint failed (DNS, TCP, TLS, handshake or timeout).
    #[error("connection error: {0}")]
    Connection(String),

    /// A frame or response body could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket read or write failure on an established stream.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The exchange answered a method call with a structured error.
    #[error("method error: code {code}, {msg}")]
    Method { code: i64, msg: String },

    /// The channel already has an active handler on this stream.
    #[error("stream already subscribed: {0}")]
    AlreadySubscribed(String),

    /// The exchange asked us to back off (HTTP 429 or 418).
    #[error("status {status}, back off for {duration:?}")]
    BackOff { status: u16, duration: Duration },

    /// Terminal, non-retryable HTTP status.
    #[error("request failed: status {status} {reason}")]
    Request { status: u16, reason: String },

    /// Network failure while talking to a REST host.
    #[error("http error: {0}")]
    Http(String),

    /// No reply arrived for a method call in time.
    #[error("method call timed out after {0:?}")]
    Timeout(Duration),

    /// The stream is closing or closed.
    #[error("stream closed")]
    Closed,

    /// The caller's cancellation token fired.
    #[error("operation canceled")]
    Canceled,
}

impl XgError {
    /// Whether this error tears down the whole stream rather than a single call.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            XgError::Connection(_) | XgError::Protocol(_) | XgError::WebSocket(_)
        )
    }

    /// The cooldown the caller should respect before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            XgError::BackOff { duration, .. } => Some(*duration),
            _ => None,
        }
    }
}

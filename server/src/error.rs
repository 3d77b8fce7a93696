//! Error types, one enum per failure family.
//!
//! Failures are isolated: a handshake or connection error only ever affects
//! its own device session, a [`DispatchError`] only its own delivery job.

use std::time::Duration;

use thiserror::Error;

/// Why a device handshake was rejected. The message is what the device sees
/// in `AUTH_FAIL`.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("authentication timeout")]
    Timeout,
    #[error("expected AUTH message")]
    ExpectedAuth,
    #[error("invalid AUTH payload: {0}")]
    InvalidPayload(String),
    #[error("invalid api key")]
    Unauthorized,
    #[error("device belongs to another user")]
    Forbidden,
    #[error("connection closed during handshake")]
    Disconnected,
    #[error("server shutting down")]
    ShuttingDown,
    #[error("device lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Result of pushing a message onto a session's outbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// No session is registered for the device, or its buffer was closed.
    #[error("device not connected")]
    NotConnected,
    /// The session's outbound buffer is full.
    #[error("device outbound buffer is full")]
    Backpressure,
}

/// A device frame that could not be turned into a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One failed webhook attempt.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("webhook returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("request failed: timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Delivery queue failures surfaced to `enqueue` callers.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("journal I/O failed: {0}")]
    Journal(#[from] std::io::Error),
    #[error("journal record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("delivery queue is shut down")]
    Closed,
}

/// Errors reported by the external stores and log sink.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Rejections from the send-SMS command path.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error("device not found")]
    DeviceNotFound,
    #[error("device is offline")]
    DeviceOffline,
    #[error("no online device available")]
    NoOnlineDevice,
    #[error("failed to send SMS to device: {0}")]
    Send(#[from] SendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

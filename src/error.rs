//! Error types shared by the publisher, listener and reply router.

use std::error::Error;

/// Result type for bus operations.
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Errors returned by lifecycle calls and by the query round trip.
///
/// Transport anomalies (undecodable bodies, replies without a correlation id,
/// replies nobody waits for) are absorbed inside the consumer tasks and never
/// show up here.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The broker could not be reached.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker rejected a declaration, binding or publish.
    #[error("broker error: {0}")]
    Broker(String),

    /// No reply arrived before the router's deadline.
    #[error("timeout while waiting for reply to {query}")]
    ReplyTimeout { query: String },

    /// The caller gave up before a reply or the deadline.
    #[error("request {query} was cancelled")]
    Cancelled { query: String },

    /// The remote query handler failed and answered with an error reply.
    #[error("handler for {query} failed: {message}")]
    Remote { query: String, message: String },

    /// A query was registered under a correlation id that is still pending.
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelation(String),

    /// A message could not be interpreted.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Payload encoding or decoding failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// True for [`BusError::ReplyTimeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::ReplyTimeout { .. })
    }

    /// True for [`BusError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BusError::Cancelled { .. })
    }
}

/// Error returned by a registered command, event or query handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Payload decode / deserialization failed.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// The handler's result could not be encoded as a reply.
    #[error("encode failed: {0}")]
    EncodeFailed(String),
    /// Business logic rejected the message.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Other error.
    #[error("handler error: {0}")]
    Other(Box<dyn Error + Send + Sync>),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

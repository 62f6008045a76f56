//! Errors raised while decoding release-change events.

use thiserror::Error;

/// A release-change event that cannot be turned into a job.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// Envelope carries an event type this agent does not consume.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unsupported event version: {event_type} v{version}")]
    UnsupportedVersion { event_type: String, version: i32 },

    /// Release descriptor failed validation.
    #[error("invalid release payload: {0}")]
    InvalidPayload(String),

    /// A content item can never be materialized as described.
    #[error("invalid content item {id}: {reason}")]
    InvalidContentItem { id: u32, reason: String },

    /// Envelope or payload is not valid JSON for its schema.
    #[error("malformed event JSON: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}

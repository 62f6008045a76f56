//! Event envelope - the wrapper upstream puts around every release change.

use chrono::{DateTime, Utc};
use cfgsync_id::Cursor;
use serde::{Deserialize, Serialize};

use crate::types::{event_types, ReleaseDescriptor, RELEASE_CHANGED_VERSION};
use crate::EventError;

/// A release-change notification as delivered by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseChangeEvent {
    /// Correlation identifier assigned upstream; used for tracing only.
    pub event_id: String,

    /// Upstream position of this event.
    #[serde(default)]
    pub cursor: Cursor,

    /// When the release was published.
    pub occurred_at: DateTime<Utc>,

    /// The event type (always `release.changed` for now).
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// The release to apply.
    pub payload: ReleaseDescriptor,
}

impl ReleaseChangeEvent {
    /// Wraps a descriptor in a current-version envelope.
    pub fn new(event_id: impl Into<String>, cursor: Cursor, payload: ReleaseDescriptor) -> Self {
        Self {
            event_id: event_id.into(),
            cursor,
            occurred_at: Utc::now(),
            event_type: event_types::RELEASE_CHANGED.to_string(),
            event_version: RELEASE_CHANGED_VERSION,
            payload,
        }
    }

    /// Decodes and validates an envelope from raw JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let event: Self = serde_json::from_slice(bytes)?;

        if event.event_type != event_types::RELEASE_CHANGED {
            return Err(EventError::UnknownEventType(event.event_type));
        }
        if event.event_version != RELEASE_CHANGED_VERSION {
            return Err(EventError::UnsupportedVersion {
                event_type: event.event_type,
                version: event.event_version,
            });
        }
        event.payload.validate()?;

        Ok(event)
    }

    /// Encodes the envelope as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RepositoryLocation;
    use cfgsync_id::{AppId, ReleaseId};

    fn descriptor() -> ReleaseDescriptor {
        ReleaseDescriptor {
            app_id: AppId::new(42).unwrap(),
            release_id: ReleaseId::new(7).unwrap(),
            storage_mode: Default::default(),
            repository: RepositoryLocation {
                root: "http://repo".to_string(),
                tls: None,
            },
            content_items: vec![],
        }
    }

    #[test]
    fn test_decode_roundtrip() {
        let event = ReleaseChangeEvent::new("evt-1", Cursor::new(11), descriptor());
        let decoded = ReleaseChangeEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.event_id, "evt-1");
        assert_eq!(decoded.cursor, Cursor::new(11));
        assert_eq!(decoded.payload, descriptor());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut event = ReleaseChangeEvent::new("evt-1", Cursor::new(1), descriptor());
        event.event_type = "release.deleted".to_string();
        let err = ReleaseChangeEvent::decode(&event.encode().unwrap()).unwrap_err();
        assert!(matches!(err, EventError::UnknownEventType(t) if t == "release.deleted"));
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let mut event = ReleaseChangeEvent::new("evt-1", Cursor::new(1), descriptor());
        event.event_version = 2;
        let err = ReleaseChangeEvent::decode(&event.encode().unwrap()).unwrap_err();
        assert!(matches!(err, EventError::UnsupportedVersion { version: 2, .. }));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = ReleaseChangeEvent::decode(b"{not json").unwrap_err();
        assert!(matches!(err, EventError::Serialization(_)));
    }

    #[test]
    fn test_decode_from_handwritten_json() {
        let json = serde_json::json!({
            "event_id": "evt-9",
            "cursor": 3,
            "occurred_at": "2024-05-01T00:00:00Z",
            "event_type": "release.changed",
            "event_version": 1,
            "payload": {
                "app_id": 42,
                "release_id": 7,
                "repository": { "root": "http://repo" },
                "content_items": [{
                    "id": 1,
                    "content": {
                        "byte_size": 1021,
                        "signature": "4e1243bd22c66e76c2ba9eddc1f91394e57f9f83ee2f4f4a1b2c3d4e5f60718a"
                    },
                    "placement": { "path": "/etc", "name": "server.yaml" },
                    "repository_path": "blobs/1"
                }]
            }
        });
        let event = ReleaseChangeEvent::decode(json.to_string().as_bytes()).unwrap();
        assert_eq!(event.payload.content_items.len(), 1);
        assert_eq!(event.payload.storage_mode, crate::StorageMode::Repository);
    }
}

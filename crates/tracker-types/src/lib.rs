//! Shared wire types, domain model, and error kinds for the tracker federation.
//!
//! This crate has no behavior of its own — it's the vocabulary that
//! `tracker-store`, `tracker-domain`, `tracker-broadcast`, `tracker-http` and
//! `tracker-bootstrap` all share, so that none of them need to depend on each
//! other just to pass a `Peer` or a `TrackerError` around.

pub mod error;
pub mod model;
pub mod requests;

pub use error::{Result, TrackerError};
pub use model::{Chunk, DatabaseDump, File, Peer, Tracker};
pub use requests::{
    AddFileRequest, AddFileSyncData, ChunkInput, DeregisterFileByHashRequest,
    DeregisterFileRequest, EventKind, KeepAliveRequest, NewTrackerRequest, SyncEvent,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_file_rejects_empty_chunks() {
        let req = AddFileRequest {
            name: "x".into(),
            full_hash: "H".into(),
            chunks: vec![],
            guid: None,
            seq_number: 0,
        };
        assert!(matches!(req.validate(), Err(TrackerError::SchemaViolation(_))));
    }

    #[test]
    fn add_file_rejects_duplicate_chunks() {
        let chunk = ChunkInput {
            id: 0,
            name: "c0".into(),
            hash: "h0".into(),
        };
        let req = AddFileRequest {
            name: "x".into(),
            full_hash: "H".into(),
            chunks: vec![chunk.clone(), chunk],
            guid: None,
            seq_number: 0,
        };
        assert!(matches!(req.validate(), Err(TrackerError::SchemaViolation(_))));
    }

    #[test]
    fn add_file_unknown_field_is_rejected_at_deserialize() {
        let raw = serde_json::json!({
            "name": "x",
            "full_hash": "H",
            "chunks": [{"id": 0, "name": "c0", "hash": "h0"}],
            "guid": null,
            "seq_number": 0,
            "unexpected": true,
        });
        let parsed: Result<AddFileRequest, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn sequence_mismatch_message_matches_spec_scenario() {
        let err = TrackerError::SequenceMismatch { expected: 1, got: 0 };
        assert_eq!(
            err.to_string(),
            "Tracker is expecting sequence number 1 (sequence number 0 was sent)"
        );
    }

    #[test]
    fn sync_event_rejects_non_ipv4() {
        let event = SyncEvent {
            event: EventKind::NewTracker,
            event_ip: "not-an-ip".into(),
            data: serde_json::json!({}),
        };
        assert!(event.validate_shape().is_err());
    }
}

//! Wire request shapes and their schema checks.
//!
//! No JSON Schema library is in this workspace's dependency stack, so
//! "unknown properties rejected" is expressed with `#[serde(deny_unknown_fields)]`
//! and the remaining constraints (`minItems`, `uniqueItems`, the nullable-vs-
//! mandatory `guid`) are checked explicitly in `validate()`.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TrackerError;

/// One entry of an `add_file` chunk list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct ChunkInput {
    pub id: i64,
    pub name: String,
    pub hash: String,
}

fn validate_chunks(chunks: &[ChunkInput]) -> Result<(), TrackerError> {
    if chunks.is_empty() {
        return Err(TrackerError::SchemaViolation(
            "chunks: must contain at least 1 item".to_string(),
        ));
    }
    let mut seen = HashSet::with_capacity(chunks.len());
    for chunk in chunks {
        if !seen.insert(chunk) {
            return Err(TrackerError::SchemaViolation(
                "chunks: items must be unique".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_ipv4(ip: &str) -> Result<(), TrackerError> {
    Ipv4Addr::from_str(ip)
        .map(|_| ())
        .map_err(|_| TrackerError::SchemaViolation(format!("event_ip: '{ip}' is not a valid ipv4 address")))
}

/// `POST /add_file` — `guid` is `null` on first contact with a tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddFileRequest {
    pub name: String,
    pub full_hash: String,
    pub chunks: Vec<ChunkInput>,
    pub guid: Option<String>,
    pub seq_number: i64,
}

impl AddFileRequest {
    pub fn validate(&self) -> Result<(), TrackerError> {
        validate_chunks(&self.chunks)
    }
}

/// The `data` shape for a `tracker_sync` event of type `add_file`: same
/// fields, but `guid` is mandatory (a peer must already exist by the time a
/// sibling tells us about it) — `ADD_FILE_MANDATORY_GUID_SCHEMA` in the
/// original.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddFileSyncData {
    pub name: String,
    pub full_hash: String,
    pub chunks: Vec<ChunkInput>,
    pub guid: String,
    pub seq_number: i64,
}

impl AddFileSyncData {
    pub fn validate(&self) -> Result<(), TrackerError> {
        validate_chunks(&self.chunks)
    }

    pub fn into_request(self) -> AddFileRequest {
        AddFileRequest {
            name: self.name,
            full_hash: self.full_hash,
            chunks: self.chunks,
            guid: Some(self.guid),
            seq_number: self.seq_number,
        }
    }
}

/// `PUT /keep_alive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeepAliveRequest {
    pub guid: String,
    pub ka_seq_number: i64,
}

/// `DELETE /deregister_file` — not replicated (file ids are local).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeregisterFileRequest {
    pub file_id: u64,
    pub guid: String,
    pub seq_number: i64,
}

/// `DELETE /deregister_file_by_hash` — replicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeregisterFileByHashRequest {
    pub file_hash: String,
    pub guid: String,
    pub seq_number: i64,
}

/// `POST /new_tracker` — intentionally empty; any property is a violation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTrackerRequest {}

/// The event types a tracker can broadcast or receive via `/tracker_sync`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AddFile,
    KeepAlive,
    DeregisterFileByHash,
    NewTracker,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AddFile => "add_file",
            EventKind::KeepAlive => "keep_alive",
            EventKind::DeregisterFileByHash => "deregister_file_by_hash",
            EventKind::NewTracker => "new_tracker",
        }
    }
}

/// The body of `PATCH /tracker_sync`, and the payload the broadcaster queues
/// internally. `data`'s shape is discriminated by `event` (validated at the
/// sync handler once `event` is known, not here).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncEvent {
    pub event: EventKind,
    pub event_ip: String,
    pub data: serde_json::Value,
}

impl SyncEvent {
    pub fn validate_shape(&self) -> Result<(), TrackerError> {
        validate_ipv4(&self.event_ip)?;
        if !self.data.is_object() {
            return Err(TrackerError::SchemaViolation(
                "data: must be an object".to_string(),
            ));
        }
        Ok(())
    }
}

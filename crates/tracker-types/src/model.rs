//! Persisted domain entities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A sibling replication node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tracker {
    pub ip: String,
}

/// A participant that hosts file chunks.
///
/// `expected_seq_number` and `ka_expected_seq_number` are independent
/// per-peer Lamport-style clocks; both start at 0 and only ever increase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub uuid: Uuid,
    pub ip: String,
    /// Unix seconds of the last accepted keep-alive.
    pub keep_alive_timestamp: i64,
    pub expected_seq_number: i64,
    pub ka_expected_seq_number: i64,
}

impl Peer {
    pub fn is_online(&self, now_unix: i64, timeout_secs: i64) -> bool {
        self.keep_alive_timestamp >= now_unix - timeout_secs
    }
}

/// A content-addressed file, identified by `full_hash` (invariant 1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct File {
    pub id: u64,
    pub name: String,
    pub full_hash: String,
}

/// An ordered, immutable fragment of a `File` (invariant 2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk {
    pub id: i64,
    pub name: String,
    pub hash: String,
}

/// A complete, portable dump of a tracker's store, used for snapshot/restore
/// and bootstrap. This is the payload that gets bincode-encoded and then
/// base64-transported inside `/new_tracker`'s `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseDump {
    pub trackers: Vec<Tracker>,
    pub peers: Vec<Peer>,
    /// Each file paired with its ordered chunk list.
    pub files: Vec<(File, Vec<Chunk>)>,
    /// (file_id, peer_uuid) host edges.
    pub hosts: Vec<(u64, Uuid)>,
    /// Next autogenerated file id to hand out after restore.
    pub next_file_id: u64,
}

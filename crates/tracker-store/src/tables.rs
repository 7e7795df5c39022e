//! redb table definitions and the composite-key packing helpers that stand
//! in for a relational store's foreign-key/uniqueness structure — those
//! constraints are this crate's job to enforce in code, not redb's.
//!
//! Rows are bincode-encoded `tracker_types` structs stored as `&[u8]`
//! values; composite keys (chunk ordering within a file, host edges) are
//! packed into sortable byte vectors so a prefix range-scan finds exactly
//! one file's rows.

use redb::TableDefinition;
use uuid::Uuid;

/// ip -> bincode(Tracker)
pub const TRACKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("trackers");

/// uuid (u128) -> bincode(Peer)
pub const PEERS: TableDefinition<u128, &[u8]> = TableDefinition::new("peers");

/// full_hash -> bincode(File)
pub const FILES_BY_HASH: TableDefinition<&str, &[u8]> = TableDefinition::new("files_by_hash");

/// file id -> full_hash, so deregister-by-id can find the owning file.
pub const FILE_ID_TO_HASH: TableDefinition<u64, &str> = TableDefinition::new("file_id_to_hash");

/// pack(file_id, chunk_id) -> bincode(Chunk); ordered by chunk_id within a file.
pub const CHUNKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chunks");

/// pack(file_id, peer_uuid) -> 1; a (File, Peer) host edge (invariant 3).
pub const HOSTS: TableDefinition<&[u8], u8> = TableDefinition::new("hosts");

/// pack(peer_uuid, file_id) -> 1; reverse index for peer-status / file-list.
pub const HOSTS_BY_PEER: TableDefinition<&[u8], u8> = TableDefinition::new("hosts_by_peer");

/// Single-row counters table (currently just `next_file_id`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const NEXT_FILE_ID_KEY: &str = "next_file_id";

/// Big-endian packing keeps lexicographic byte order equal to numeric order,
/// so a prefix scan over `pack_file_chunk(file_id, 0)..` style ranges visits
/// a file's chunks in `chunk_id` order.
pub fn pack_file_chunk(file_id: u64, chunk_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&file_id.to_be_bytes());
    key.extend_from_slice(&chunk_id.to_be_bytes());
    key
}

pub fn pack_file_prefix(file_id: u64) -> Vec<u8> {
    file_id.to_be_bytes().to_vec()
}

pub fn pack_file_peer(file_id: u64, peer: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&file_id.to_be_bytes());
    key.extend_from_slice(&peer.as_u128().to_be_bytes());
    key
}

pub fn pack_peer_file(peer: Uuid, file_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&peer.as_u128().to_be_bytes());
    key.extend_from_slice(&file_id.to_be_bytes());
    key
}

pub fn pack_peer_prefix(peer: Uuid) -> Vec<u8> {
    peer.as_u128().to_be_bytes().to_vec()
}

pub fn unpack_peer_suffix(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[16..24]);
    u64::from_be_bytes(buf)
}

/// Inverse of [`pack_file_peer`]: pulls the peer uuid out of a `HOSTS` key.
pub fn unpack_file_peer_suffix(key: &[u8]) -> Uuid {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&key[8..24]);
    Uuid::from_u128(u128::from_be_bytes(buf))
}

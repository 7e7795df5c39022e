//! Typed error kinds shared by the domain, HTTP and sync layers.
//!
//! Every variant here maps to exactly one `error` string in the response
//! envelope. Internally we keep them typed so the HTTP layer can decide
//! envelope shape (e.g. `dead_tracker`) without string matching.

use thiserror::Error;

/// Everything that can go wrong applying a peer or sync operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// Request body could not be parsed as JSON.
    #[error("Request is not JSON")]
    InvalidJson,

    /// Request parsed as JSON but failed schema validation.
    #[error("{0}")]
    SchemaViolation(String),

    /// Peer GUID referenced an unknown peer.
    #[error("Unknown peer")]
    UnknownPeer,

    /// Sender's sequence number didn't match the tracker's expectation.
    #[error("Tracker is expecting sequence number {expected} (sequence number {got} was sent)")]
    SequenceMismatch {
        /// Sequence number the tracker expected next.
        expected: i64,
        /// Sequence number actually sent.
        got: i64,
    },

    /// Re-registration of an existing `full_hash` with a different chunk list.
    #[error("Chunk list does not match previously registered chunks for this file")]
    ChunkMismatch,

    /// (Peer, File) host relation already exists.
    #[error("Peer is already hosting this file")]
    AlreadyHosting,

    /// Deregister referenced a host relation that doesn't exist.
    #[error("Peer is not hosting this file")]
    NotHosting,

    /// Sync sender is not a tracker we know about; the sender should self-evict.
    #[error("Tracker not in tracker list")]
    UnknownTracker,

    /// Catch-all for anything unexpected; never leaks internal detail to the wire.
    #[error("Unexpected error")]
    Unexpected,
}

impl TrackerError {
    /// True only for the sync-endpoint case that tells the sender to shut itself down.
    pub fn is_dead_tracker(&self) -> bool {
        matches!(self, TrackerError::UnknownTracker)
    }
}

/// Convenience alias used throughout the domain and store crates.
pub type Result<T> = std::result::Result<T, TrackerError>;

//! Domain mutations: sequence-number gating and invariant enforcement,
//! layered on [`tracker_store::Store`].
//!
//! Every function here takes the observed source IP plus a request payload,
//! applies exactly one local mutation, and returns either a success value or
//! a [`TrackerError`]. Nothing in this crate talks HTTP or touches the
//! broadcaster — `tracker-http` decides, from the `Result`, whether to
//! enqueue an outbound event.
//!
//! Each mutating operation comes in two flavors: an *origin* entry point
//! (the peer's own counter must match exactly, `==`) and a *sync* entry
//! point (the event's counter need only be new enough, `>=`, so that
//! out-of-order inter-tracker delivery still converges). Both funnel into a
//! shared `apply_*` helper once the caller has decided the event should be
//! applied and has already advanced the peer's counter to the right place.

use std::str::FromStr;

use tracker_store::{AddFileOutcome as StoreAddFileOutcome, DeregisterOutcome, Store};
use tracker_types::{
    AddFileRequest, Chunk, DeregisterFileByHashRequest, DeregisterFileRequest, File,
    KeepAliveRequest, Peer, Result, Tracker, TrackerError,
};
use uuid::Uuid;

pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn translate(err: tracker_store::StoreError) -> TrackerError {
    tracing::error!(error = %err, "store operation failed");
    TrackerError::Unexpected
}

fn parse_guid(guid: &str) -> Result<Uuid> {
    Uuid::from_str(guid).map_err(|_| TrackerError::UnknownPeer)
}

fn load_peer(store: &Store, guid: &str) -> Result<Peer> {
    let uuid = parse_guid(guid)?;
    store
        .get_peer(uuid)
        .map_err(translate)?
        .ok_or(TrackerError::UnknownPeer)
}

/// Result of a successful `add_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddFileOutcome {
    pub file_id: u64,
    pub guid: Uuid,
}

/// Idempotently creates a Peer with the given UUID and IP if one doesn't
/// already exist. Used from the sync path, where a tracker may first hear
/// about a peer a sibling already knows.
pub fn ensure_peer_exists(store: &Store, ip: &str, guid: Uuid) -> Result<Peer> {
    if let Some(peer) = store.get_peer(guid).map_err(translate)? {
        return Ok(peer);
    }
    let peer = Peer {
        uuid: guid,
        ip: ip.to_string(),
        keep_alive_timestamp: now_unix(),
        expected_seq_number: 0,
        ka_expected_seq_number: 0,
    };
    store.create_peer(&peer).map_err(translate)?;
    Ok(peer)
}

fn sorted_chunks(chunks: &[tracker_types::ChunkInput]) -> Vec<Chunk> {
    let mut out: Vec<Chunk> = chunks
        .iter()
        .map(|c| Chunk {
            id: c.id,
            name: c.name.clone(),
            hash: c.hash.clone(),
        })
        .collect();
    out.sort_by_key(|c| c.id);
    out
}

/// Applies the file-creation/host-attach half of `add_file` once the
/// caller has already resolved the peer and positioned its counter. Does
/// not touch `expected_seq_number` beyond persisting whatever the caller
/// set it to. File lookup-or-create, the chunk-mismatch check, the host
/// insert, and the peer row write all happen inside one `Store` write
/// transaction (spec §4.2: each mutating op "runs under a single
/// transaction") so a crash partway through can't leave a file with no
/// host edge, or a host edge whose peer counter never made it to disk.
fn apply_add_file(store: &Store, req: &AddFileRequest, ip: &str, mut peer: Peer, is_new: bool) -> Result<AddFileOutcome> {
    if !is_new && peer.ip != ip {
        peer.ip = ip.to_string();
    }

    let chunks = sorted_chunks(&req.chunks);
    match store
        .apply_add_file(&req.name, &req.full_hash, &chunks, &peer)
        .map_err(translate)?
    {
        StoreAddFileOutcome::Applied { file_id } => Ok(AddFileOutcome {
            file_id,
            guid: peer.uuid,
        }),
        StoreAddFileOutcome::ChunkMismatch => Err(TrackerError::ChunkMismatch),
        StoreAddFileOutcome::AlreadyHosting => Err(TrackerError::AlreadyHosting),
    }
}

/// Origin `add_file`: the submitting peer's own counter must match the
/// request's `seq_number` exactly.
pub fn add_file(store: &Store, req: &AddFileRequest, ip: &str) -> Result<AddFileOutcome> {
    req.validate()?;

    let (mut peer, is_new) = match &req.guid {
        None => (
            Peer {
                uuid: Uuid::new_v4(),
                ip: ip.to_string(),
                keep_alive_timestamp: now_unix(),
                expected_seq_number: req.seq_number,
                ka_expected_seq_number: 0,
            },
            true,
        ),
        Some(guid) => (load_peer(store, guid)?, false),
    };

    if peer.expected_seq_number != req.seq_number {
        return Err(TrackerError::SequenceMismatch {
            expected: peer.expected_seq_number,
            got: req.seq_number,
        });
    }
    peer.expected_seq_number += 1;

    apply_add_file(store, req, ip, peer, is_new)
}

/// Sync `add_file`: the caller (the `/tracker_sync` dispatcher) has already
/// confirmed `req.seq_number >= peer.expected_seq_number`; this catches the
/// peer's counter up to `req.seq_number + 1` rather than requiring an exact
/// match, tolerating the gaps a relayed event can introduce.
pub fn sync_add_file(store: &Store, req: &AddFileRequest, ip: &str) -> Result<AddFileOutcome> {
    req.validate()?;
    let guid = req.guid.as_deref().ok_or(TrackerError::UnknownPeer)?;
    let mut peer = load_peer(store, guid)?;
    if req.seq_number < peer.expected_seq_number {
        return Err(TrackerError::SequenceMismatch {
            expected: peer.expected_seq_number,
            got: req.seq_number,
        });
    }
    peer.expected_seq_number = req.seq_number + 1;
    apply_add_file(store, req, ip, peer, false)
}

fn apply_keep_alive(store: &Store, mut peer: Peer, ip: &str) -> Result<()> {
    if peer.ip != ip {
        peer.ip = ip.to_string();
    }
    peer.keep_alive_timestamp = now_unix();
    store.update_peer(&peer).map_err(translate)
}

pub fn keep_alive(store: &Store, req: &KeepAliveRequest, ip: &str) -> Result<()> {
    let mut peer = load_peer(store, &req.guid)?;
    if peer.ka_expected_seq_number != req.ka_seq_number {
        return Err(TrackerError::SequenceMismatch {
            expected: peer.ka_expected_seq_number,
            got: req.ka_seq_number,
        });
    }
    peer.ka_expected_seq_number += 1;
    apply_keep_alive(store, peer, ip)
}

pub fn sync_keep_alive(store: &Store, req: &KeepAliveRequest, ip: &str) -> Result<()> {
    let mut peer = load_peer(store, &req.guid)?;
    if req.ka_seq_number < peer.ka_expected_seq_number {
        return Err(TrackerError::SequenceMismatch {
            expected: peer.ka_expected_seq_number,
            got: req.ka_seq_number,
        });
    }
    peer.ka_expected_seq_number = req.ka_seq_number + 1;
    apply_keep_alive(store, peer, ip)
}

/// Host-edge removal, peer row write, and (if the file is now unhosted)
/// its cascade delete all happen inside one `Store` write transaction, for
/// the same reason `apply_add_file` above does.
fn apply_deregister(store: &Store, peer: &Peer, file: &File) -> Result<()> {
    match store
        .apply_deregister(file.id, &file.full_hash, peer)
        .map_err(translate)?
    {
        DeregisterOutcome::Applied => Ok(()),
        DeregisterOutcome::NotHosting => Err(TrackerError::NotHosting),
    }
}

/// `DELETE /deregister_file`. Not replicated — file ids are local to each
/// tracker, so only the hash-keyed variant below is broadcast.
pub fn deregister_file(store: &Store, req: &DeregisterFileRequest) -> Result<()> {
    let mut peer = load_peer(store, &req.guid)?;
    if peer.expected_seq_number != req.seq_number {
        return Err(TrackerError::SequenceMismatch {
            expected: peer.expected_seq_number,
            got: req.seq_number,
        });
    }
    peer.expected_seq_number += 1;

    let file = store
        .get_file_by_id(req.file_id)
        .map_err(translate)?
        .ok_or(TrackerError::NotHosting)?;
    apply_deregister(store, &peer, &file)
}

pub fn deregister_file_by_hash(store: &Store, req: &DeregisterFileByHashRequest) -> Result<()> {
    let mut peer = load_peer(store, &req.guid)?;
    if peer.expected_seq_number != req.seq_number {
        return Err(TrackerError::SequenceMismatch {
            expected: peer.expected_seq_number,
            got: req.seq_number,
        });
    }
    peer.expected_seq_number += 1;

    let file = store
        .get_file_by_hash(&req.file_hash)
        .map_err(translate)?
        .ok_or(TrackerError::NotHosting)?;
    apply_deregister(store, &peer, &file)
}

pub fn sync_deregister_file_by_hash(store: &Store, req: &DeregisterFileByHashRequest) -> Result<()> {
    let mut peer = load_peer(store, &req.guid)?;
    if req.seq_number < peer.expected_seq_number {
        return Err(TrackerError::SequenceMismatch {
            expected: peer.expected_seq_number,
            got: req.seq_number,
        });
    }
    peer.expected_seq_number = req.seq_number + 1;

    let file = store
        .get_file_by_hash(&req.file_hash)
        .map_err(translate)?
        .ok_or(TrackerError::NotHosting)?;
    apply_deregister(store, &peer, &file)
}

/// Registers a sibling tracker if it isn't already known. Returns `true`
/// when the tracker was newly added.
pub fn register_tracker(store: &Store, tracker: &Tracker) -> Result<bool> {
    if store.tracker_exists(&tracker.ip).map_err(translate)? {
        return Ok(false);
    }
    store.create_tracker(tracker).map_err(translate)?;
    Ok(true)
}

pub fn remove_tracker(store: &Store, ip: &str) -> Result<bool> {
    store.remove_tracker_by_ip(ip).map_err(translate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracker_types::ChunkInput;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.redb")).unwrap();
        (dir, store)
    }

    fn chunk(id: i64) -> ChunkInput {
        ChunkInput {
            id,
            name: format!("c{id}"),
            hash: format!("h{id}"),
        }
    }

    #[test]
    fn add_file_with_null_guid_creates_a_peer_at_the_submitted_sequence() {
        let (_dir, store) = open_store();
        let req = AddFileRequest {
            name: "movie.mkv".into(),
            full_hash: "abc123".into(),
            chunks: vec![chunk(0), chunk(1)],
            guid: None,
            seq_number: 5,
        };
        let outcome = add_file(&store, &req, "10.0.0.1").unwrap();
        let peer = store.get_peer(outcome.guid).unwrap().unwrap();
        assert_eq!(peer.expected_seq_number, 6, "origin convention: starting counter accepted then bumped");
    }

    #[test]
    fn add_file_rejects_sequence_mismatch() {
        let (_dir, store) = open_store();
        let req = AddFileRequest {
            name: "a".into(),
            full_hash: "h".into(),
            chunks: vec![chunk(0)],
            guid: None,
            seq_number: 0,
        };
        let outcome = add_file(&store, &req, "10.0.0.1").unwrap();

        let guid = outcome.guid.to_string();
        let bad = AddFileRequest {
            name: "b".into(),
            full_hash: "h2".into(),
            chunks: vec![chunk(0)],
            guid: Some(guid),
            seq_number: 99,
        };
        let err = add_file(&store, &bad, "10.0.0.1").unwrap_err();
        assert_eq!(
            err,
            TrackerError::SequenceMismatch {
                expected: 1,
                got: 99
            }
        );
    }

    #[test]
    fn add_file_rejects_chunk_mismatch_for_existing_hash() {
        let (_dir, store) = open_store();
        let first = AddFileRequest {
            name: "a".into(),
            full_hash: "h".into(),
            chunks: vec![chunk(0), chunk(1)],
            guid: None,
            seq_number: 0,
        };
        let outcome = add_file(&store, &first, "10.0.0.1").unwrap();

        let second_peer_req = AddFileRequest {
            name: "a2".into(),
            full_hash: "other".into(),
            chunks: vec![chunk(0)],
            guid: None,
            seq_number: 0,
        };
        let second_peer = add_file(&store, &second_peer_req, "10.0.0.2").unwrap();

        let conflicting = AddFileRequest {
            name: "a".into(),
            full_hash: "h".into(),
            chunks: vec![chunk(0)],
            guid: Some(second_peer.guid.to_string()),
            seq_number: 1,
        };
        let err = add_file(&store, &conflicting, "10.0.0.2").unwrap_err();
        assert_eq!(err, TrackerError::ChunkMismatch);
        let _ = outcome;
    }

    #[test]
    fn add_file_rejects_already_hosting() {
        let (_dir, store) = open_store();
        let req = AddFileRequest {
            name: "a".into(),
            full_hash: "h".into(),
            chunks: vec![chunk(0)],
            guid: None,
            seq_number: 0,
        };
        let outcome = add_file(&store, &req, "10.0.0.1").unwrap();

        let again = AddFileRequest {
            name: "a".into(),
            full_hash: "h".into(),
            chunks: vec![chunk(0)],
            guid: Some(outcome.guid.to_string()),
            seq_number: 1,
        };
        let err = add_file(&store, &again, "10.0.0.1").unwrap_err();
        assert_eq!(err, TrackerError::AlreadyHosting);
    }

    #[test]
    fn sync_add_file_tolerates_a_forward_gap() {
        let (_dir, store) = open_store();
        let peer = Peer {
            uuid: Uuid::new_v4(),
            ip: "10.0.0.1".into(),
            keep_alive_timestamp: 0,
            expected_seq_number: 0,
            ka_expected_seq_number: 0,
        };
        store.create_peer(&peer).unwrap();

        let req = AddFileRequest {
            name: "a".into(),
            full_hash: "h".into(),
            chunks: vec![chunk(0)],
            guid: Some(peer.uuid.to_string()),
            seq_number: 5,
        };
        sync_add_file(&store, &req, "10.0.0.1").unwrap();
        let updated = store.get_peer(peer.uuid).unwrap().unwrap();
        assert_eq!(updated.expected_seq_number, 6, "counter catches up to the event, not +1 from local state");
    }

    #[test]
    fn sync_add_file_rejects_stale_duplicate() {
        let (_dir, store) = open_store();
        let peer = Peer {
            uuid: Uuid::new_v4(),
            ip: "10.0.0.1".into(),
            keep_alive_timestamp: 0,
            expected_seq_number: 3,
            ka_expected_seq_number: 0,
        };
        store.create_peer(&peer).unwrap();

        let req = AddFileRequest {
            name: "a".into(),
            full_hash: "h".into(),
            chunks: vec![chunk(0)],
            guid: Some(peer.uuid.to_string()),
            seq_number: 1,
        };
        let err = sync_add_file(&store, &req, "10.0.0.1").unwrap_err();
        assert_eq!(
            err,
            TrackerError::SequenceMismatch {
                expected: 3,
                got: 1
            }
        );
    }

    #[test]
    fn keep_alive_requires_matching_sequence_and_bumps_it() {
        let (_dir, store) = open_store();
        let peer = Peer {
            uuid: Uuid::new_v4(),
            ip: "10.0.0.1".into(),
            keep_alive_timestamp: 0,
            expected_seq_number: 0,
            ka_expected_seq_number: 0,
        };
        store.create_peer(&peer).unwrap();

        let req = KeepAliveRequest {
            guid: peer.uuid.to_string(),
            ka_seq_number: 0,
        };
        keep_alive(&store, &req, "10.0.0.1").unwrap();
        let updated = store.get_peer(peer.uuid).unwrap().unwrap();
        assert_eq!(updated.ka_expected_seq_number, 1);

        let stale = keep_alive(&store, &req, "10.0.0.1").unwrap_err();
        assert_eq!(
            stale,
            TrackerError::SequenceMismatch {
                expected: 1,
                got: 0
            }
        );
    }

    #[test]
    fn deregister_by_hash_deletes_file_once_unhosted() {
        let (_dir, store) = open_store();
        let req = AddFileRequest {
            name: "a".into(),
            full_hash: "h".into(),
            chunks: vec![chunk(0)],
            guid: None,
            seq_number: 0,
        };
        let outcome = add_file(&store, &req, "10.0.0.1").unwrap();

        let dereg = DeregisterFileByHashRequest {
            file_hash: "h".into(),
            guid: outcome.guid.to_string(),
            seq_number: 1,
        };
        deregister_file_by_hash(&store, &dereg).unwrap();
        assert!(store.get_file_by_hash("h").unwrap().is_none());
    }

    #[test]
    fn deregister_unknown_host_fails() {
        let (_dir, store) = open_store();
        let peer = Peer {
            uuid: Uuid::new_v4(),
            ip: "10.0.0.1".into(),
            keep_alive_timestamp: 0,
            expected_seq_number: 0,
            ka_expected_seq_number: 0,
        };
        store.create_peer(&peer).unwrap();
        let dereg = DeregisterFileByHashRequest {
            file_hash: "nonexistent".into(),
            guid: peer.uuid.to_string(),
            seq_number: 0,
        };
        let err = deregister_file_by_hash(&store, &dereg).unwrap_err();
        assert_eq!(err, TrackerError::NotHosting);
    }

    #[test]
    fn ensure_peer_exists_is_idempotent() {
        let (_dir, store) = open_store();
        let uuid = Uuid::new_v4();
        let first = ensure_peer_exists(&store, "10.0.0.1", uuid).unwrap();
        let second = ensure_peer_exists(&store, "10.0.0.9", uuid).unwrap();
        assert_eq!(first.ip, second.ip, "second call is a no-op, ip unchanged");
    }
}

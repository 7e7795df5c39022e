//! Route handlers.
//!
//! Each mutating handler parses the body, calls the matching Domain Op, and
//! — only on success — enqueues the corresponding event on the Broadcaster.
//! A Store connection is implicit here (the `redb::Database` handle is
//! shared and its own transactions are scoped per call, so each request
//! opens and releases its own transaction rather than holding one open
//! across the handler).

use std::net::SocketAddr;
use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracker_types::{
    AddFileRequest, AddFileSyncData, DeregisterFileByHashRequest, DeregisterFileRequest,
    EventKind, KeepAliveRequest, NewTrackerRequest, SyncEvent, Tracker, TrackerError,
};
use uuid::Uuid;

use crate::error::{error_envelope, sync_error_envelope};
use crate::state::AppState;

fn parse_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TrackerError> {
    serde_json::from_slice::<T>(bytes).map_err(|e| {
        if e.is_data() {
            TrackerError::SchemaViolation(e.to_string())
        } else {
            TrackerError::InvalidJson
        }
    })
}

fn unexpected(context: &str, error: impl std::fmt::Display) -> Json<Value> {
    tracing::error!(context, %error, "unexpected failure");
    error_envelope(&TrackerError::Unexpected)
}

pub async fn add_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Json<Value> {
    let ip = addr.ip().to_string();
    let req: AddFileRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(err) => return error_envelope(&err),
    };

    match tracker_domain::add_file(&state.store, &req, &ip) {
        Ok(outcome) => {
            let sync_data = AddFileSyncData {
                name: req.name.clone(),
                full_hash: req.full_hash.clone(),
                chunks: req.chunks.clone(),
                guid: outcome.guid.to_string(),
                seq_number: req.seq_number,
            };
            let event = SyncEvent {
                event: EventKind::AddFile,
                event_ip: ip,
                data: serde_json::to_value(&sync_data).unwrap_or_else(|_| json!({})),
            };
            state.broadcaster.new_event(event).await;
            Json(json!({
                "success": true,
                "file_id": outcome.file_id,
                "guid": outcome.guid,
            }))
        }
        Err(err) => error_envelope(&err),
    }
}

pub async fn keep_alive(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Json<Value> {
    let ip = addr.ip().to_string();
    let req: KeepAliveRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(err) => return error_envelope(&err),
    };

    match tracker_domain::keep_alive(&state.store, &req, &ip) {
        Ok(()) => {
            let event = SyncEvent {
                event: EventKind::KeepAlive,
                event_ip: ip,
                data: serde_json::to_value(&req).unwrap_or_else(|_| json!({})),
            };
            state.broadcaster.new_event(event).await;
            Json(json!({"success": true}))
        }
        Err(err) => error_envelope(&err),
    }
}

pub async fn deregister_file(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let req: DeregisterFileRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(err) => return error_envelope(&err),
    };

    // Not replicated — file ids are local to each tracker.
    match tracker_domain::deregister_file(&state.store, &req) {
        Ok(()) => Json(json!({"success": true})),
        Err(err) => error_envelope(&err),
    }
}

pub async fn deregister_file_by_hash(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Json<Value> {
    let ip = addr.ip().to_string();
    let req: DeregisterFileByHashRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(err) => return error_envelope(&err),
    };

    match tracker_domain::deregister_file_by_hash(&state.store, &req) {
        Ok(()) => {
            let event = SyncEvent {
                event: EventKind::DeregisterFileByHash,
                event_ip: ip,
                data: serde_json::to_value(&req).unwrap_or_else(|_| json!({})),
            };
            state.broadcaster.new_event(event).await;
            Json(json!({"success": true}))
        }
        Err(err) => error_envelope(&err),
    }
}

/// `POST /new_tracker` — the bootstrap-receiving side. Always responds with
/// a full, base64-encoded snapshot of the local store.
pub async fn new_tracker(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Json<Value> {
    let ip = addr.ip().to_string();
    let _req: NewTrackerRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(err) => return error_envelope(&err),
    };

    let already_known = match state.store.tracker_exists(&ip) {
        Ok(known) => known,
        Err(err) => return unexpected("new_tracker:tracker_exists", err),
    };

    let dump = if already_known {
        // Remove before dumping so the snapshot doesn't describe the
        // requester back to itself, then silently re-add — no broadcast,
        // the sender is already a known sibling.
        if let Err(err) = state.store.remove_tracker_by_ip(&ip) {
            return unexpected("new_tracker:remove", err);
        }
        let dump = match state.store.snapshot() {
            Ok(dump) => dump,
            Err(err) => return unexpected("new_tracker:snapshot", err),
        };
        if let Err(err) = state.store.create_tracker(&Tracker { ip: ip.clone() }) {
            return unexpected("new_tracker:re-add", err);
        }
        dump
    } else {
        let dump = match state.store.snapshot() {
            Ok(dump) => dump,
            Err(err) => return unexpected("new_tracker:snapshot", err),
        };
        // Broadcast before recording the tracker locally and before
        // registering its queue, so the new tracker never receives its own
        // join event back.
        let event = SyncEvent {
            event: EventKind::NewTracker,
            event_ip: ip.clone(),
            data: json!({}),
        };
        state.broadcaster.new_event(event).await;
        if let Err(err) = state.store.create_tracker(&Tracker { ip: ip.clone() }) {
            return unexpected("new_tracker:add", err);
        }
        state.broadcaster.new_tracker(ip.clone()).await;
        dump
    };

    let encoded = match bincode::serialize(&dump) {
        Ok(bytes) => bytes,
        Err(err) => return unexpected("new_tracker:encode", err),
    };
    Json(json!({
        "success": true,
        "data": BASE64.encode(encoded),
    }))
}

/// `PATCH /tracker_sync` — the inbound replication endpoint.
pub async fn tracker_sync(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Json<Value> {
    let ip = addr.ip().to_string();
    let event: SyncEvent = match parse_body(&body) {
        Ok(event) => event,
        Err(err) => return error_envelope(&err),
    };

    match state.store.tracker_exists(&ip) {
        Ok(true) => {}
        Ok(false) => return sync_error_envelope(&TrackerError::UnknownTracker),
        Err(err) => return unexpected("tracker_sync:tracker_exists", err),
    }

    if let Err(err) = event.validate_shape() {
        return error_envelope(&err);
    }

    match dispatch_sync_event(&state, &event).await {
        Ok(rebroadcast) => {
            if rebroadcast {
                state.broadcaster.new_event(event).await;
            }
            Json(json!({"success": true}))
        }
        Err(err) => error_envelope(&err),
    }
}

/// Applies one inbound sync event, returning whether the HTTP handler
/// should rebroadcast it verbatim to every sibling (including the sender,
/// which will drop it as a stale duplicate once applied).
async fn dispatch_sync_event(state: &AppState, event: &SyncEvent) -> Result<bool, TrackerError> {
    match event.event {
        EventKind::NewTracker => {
            let newly_known = tracker_domain::register_tracker(
                &state.store,
                &Tracker {
                    ip: event.event_ip.clone(),
                },
            )?;
            if newly_known {
                // Broadcast before registering the queue — see new_tracker's
                // own ordering rationale above.
                state.broadcaster.new_event(event.clone()).await;
                state.broadcaster.new_tracker(event.event_ip.clone()).await;
            }
            // We already broadcast (if needed) above; tell the caller not to.
            Ok(false)
        }
        EventKind::AddFile => {
            let data: AddFileSyncData = serde_json::from_value(event.data.clone())
                .map_err(|e| TrackerError::SchemaViolation(e.to_string()))?;
            let guid = Uuid::from_str(&data.guid)
                .map_err(|_| TrackerError::SchemaViolation("data.guid: not a uuid".into()))?;
            let peer = tracker_domain::ensure_peer_exists(&state.store, &event.event_ip, guid)?;
            if data.seq_number < peer.expected_seq_number {
                return Ok(false);
            }
            tracker_domain::sync_add_file(&state.store, &data.into_request(), &event.event_ip)?;
            Ok(true)
        }
        EventKind::KeepAlive => {
            let data: KeepAliveRequest = serde_json::from_value(event.data.clone())
                .map_err(|e| TrackerError::SchemaViolation(e.to_string()))?;
            let guid = Uuid::from_str(&data.guid)
                .map_err(|_| TrackerError::SchemaViolation("guid: not a uuid".into()))?;
            let peer = tracker_domain::ensure_peer_exists(&state.store, &event.event_ip, guid)?;
            if data.ka_seq_number < peer.ka_expected_seq_number {
                return Ok(false);
            }
            tracker_domain::sync_keep_alive(&state.store, &data, &event.event_ip)?;
            Ok(true)
        }
        EventKind::DeregisterFileByHash => {
            let data: DeregisterFileByHashRequest = serde_json::from_value(event.data.clone())
                .map_err(|e| TrackerError::SchemaViolation(e.to_string()))?;
            let guid = Uuid::from_str(&data.guid)
                .map_err(|_| TrackerError::SchemaViolation("guid: not a uuid".into()))?;
            let peer = tracker_domain::ensure_peer_exists(&state.store, &event.event_ip, guid)?;
            if data.seq_number < peer.expected_seq_number {
                return Ok(false);
            }
            tracker_domain::sync_deregister_file_by_hash(&state.store, &data)?;
            Ok(true)
        }
    }
}

// -- read-only query routes -------------------------------------------------

pub async fn file_list(State(state): State<AppState>) -> Json<Value> {
    let files = match state.store.list_files_with_chunks() {
        Ok(files) => files,
        Err(err) => return unexpected("file_list", err),
    };
    let now = tracker_domain::now_unix();
    let mut out = Vec::with_capacity(files.len());
    for (file, _) in files {
        let active_peers = match count_online_hosts(&state, file.id, now) {
            Ok(count) => count,
            Err(err) => return unexpected("file_list:hosts", err),
        };
        out.push(json!({
            "id": file.id,
            "name": file.name,
            "hash": file.full_hash,
            "active_peers": active_peers,
        }));
    }
    Json(json!({"success": true, "files": out}))
}

fn count_online_hosts(state: &AppState, file_id: u64, now: i64) -> tracker_store::Result<usize> {
    let peers = state.store.hosts_for_file(file_id)?;
    let mut count = 0;
    for peer_uuid in peers {
        if let Some(peer) = state.store.get_peer(peer_uuid)? {
            if peer.is_online(now, state.keep_alive_timeout) {
                count += 1;
            }
        }
    }
    Ok(count)
}

fn file_detail_json(state: &AppState, file: &tracker_types::File) -> Result<Value, TrackerError> {
    let chunks = state.store.get_chunks(file.id).map_err(translate_store_err)?;
    let now = tracker_domain::now_unix();
    let host_uuids = state.store.hosts_for_file(file.id).map_err(translate_store_err)?;
    let mut peers = Vec::new();
    for uuid in host_uuids {
        if let Some(peer) = state.store.get_peer(uuid).map_err(translate_store_err)? {
            if peer.is_online(now, state.keep_alive_timeout) {
                peers.push(json!({"ip": peer.ip}));
            }
        }
    }
    Ok(json!({
        "success": true,
        "name": file.name,
        "file_hash": file.full_hash,
        "peers": peers,
        "chunks": chunks.into_iter().map(|c| json!({"id": c.id, "name": c.name, "hash": c.hash})).collect::<Vec<_>>(),
    }))
}

fn translate_store_err(err: tracker_store::StoreError) -> TrackerError {
    tracing::error!(error = %err, "store read failed");
    TrackerError::Unexpected
}

pub async fn get_file(State(state): State<AppState>, Path(file_id): Path<u64>) -> Json<Value> {
    match state.store.get_file_by_id(file_id) {
        Ok(Some(file)) => match file_detail_json(&state, &file) {
            Ok(body) => Json(body),
            Err(err) => error_envelope(&err),
        },
        Ok(None) => error_envelope(&TrackerError::SchemaViolation("file does not exist".into())),
        Err(err) => unexpected("get_file", err),
    }
}

pub async fn get_file_by_hash(State(state): State<AppState>, Path(hash): Path<String>) -> Json<Value> {
    match state.store.get_file_by_hash(&hash) {
        Ok(Some(file)) => match file_detail_json(&state, &file) {
            Ok(body) => Json(body),
            Err(err) => error_envelope(&err),
        },
        Ok(None) => error_envelope(&TrackerError::SchemaViolation("file does not exist".into())),
        Err(err) => unexpected("get_file_by_hash", err),
    }
}

pub async fn tracker_list(State(state): State<AppState>) -> Json<Value> {
    match state.store.list_trackers() {
        Ok(trackers) if trackers.is_empty() => Json(json!({
            "success": false,
            "error": "No other trackers known to this one",
        })),
        Ok(trackers) => {
            let trackers: Vec<Value> = trackers
                .into_iter()
                .map(|t| json!({"name": t.ip, "ip": t.ip}))
                .collect();
            Json(json!({"success": true, "trackers": trackers}))
        }
        Err(err) => unexpected("tracker_list", err),
    }
}

pub async fn peer_status(State(state): State<AppState>, Path(guid): Path<String>) -> Json<Value> {
    let uuid = match Uuid::from_str(&guid) {
        Ok(uuid) => uuid,
        Err(_) => return error_envelope(&TrackerError::UnknownPeer),
    };
    let peer = match state.store.get_peer(uuid) {
        Ok(Some(peer)) => peer,
        Ok(None) => return error_envelope(&TrackerError::UnknownPeer),
        Err(err) => return unexpected("peer_status", err),
    };
    let file_ids = match state.store.files_hosted_by(uuid) {
        Ok(ids) => ids,
        Err(err) => return unexpected("peer_status:files", err),
    };
    let mut files = Vec::with_capacity(file_ids.len());
    for id in file_ids {
        if let Ok(Some(file)) = state.store.get_file_by_id(id) {
            files.push(json!({"id": file.id, "name": file.name, "hash": file.full_hash}));
        }
    }
    Json(json!({
        "success": true,
        "files": files,
        "expected_seq_number": peer.expected_seq_number,
        "ka_expected_seq_number": peer.ka_expected_seq_number,
    }))
}

//! Translates a [`TrackerError`] into the wire envelope.
//!
//! Every route always answers `200 OK` — `success:false` in the body is the
//! failure signal clients act on, and `dead_tracker:true` is what makes a
//! sibling self-evict on the sync path.

use axum::Json;
use serde_json::{json, Value};
use tracker_types::TrackerError;

pub fn error_envelope(err: &TrackerError) -> Json<Value> {
    Json(json!({
        "success": false,
        "error": err.to_string(),
    }))
}

/// `/tracker_sync`'s variant of the failure envelope: an `UnknownTracker`
/// failure additionally carries `dead_tracker:true`, telling the sender to
/// remove itself from its own tracker set.
pub fn sync_error_envelope(err: &TrackerError) -> Json<Value> {
    if err.is_dead_tracker() {
        Json(json!({
            "success": false,
            "dead_tracker": true,
            "error": err.to_string(),
        }))
    } else {
        error_envelope(err)
    }
}

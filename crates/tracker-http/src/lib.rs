//! The tracker's wire surface: request parsing, schema validation, routing
//! to Domain Ops, and the `/tracker_sync` dispatch table, all built on
//! [`axum`].

pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/add_file", post(routes::add_file))
        .route("/keep_alive", put(routes::keep_alive))
        .route("/deregister_file", delete(routes::deregister_file))
        .route("/deregister_file_by_hash", delete(routes::deregister_file_by_hash))
        .route("/new_tracker", post(routes::new_tracker))
        .route("/tracker_sync", patch(routes::tracker_sync))
        .route("/file_list", get(routes::file_list))
        .route("/file/:file_id", get(routes::get_file))
        .route("/file_by_hash/:hash", get(routes::get_file_by_hash))
        .route("/tracker_list", get(routes::tracker_list))
        .route("/peer_status/:guid", get(routes::peer_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use tower::ServiceExt;
    use tracker_broadcast::{BroadcastConfig, Broadcaster};
    use tracker_store::Store;

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(Store::open(dir.path().join("t.redb")).unwrap());
        let broadcaster = Broadcaster::new(BroadcastConfig::default(), store.clone());
        (
            dir,
            AppState {
                store,
                broadcaster,
                keep_alive_timeout: 300,
            },
        )
    }

    async fn post_json(app: Router, path: &str, method: &str, body: Value) -> Value {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .extension(axum::extract::ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))))
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn add_file_then_sequence_mismatch_matches_spec_scenario() {
        let (_dir, state) = test_state();
        let app = router(state);

        let first = post_json(
            app.clone(),
            "/add_file",
            "POST",
            json!({
                "name": "x",
                "full_hash": "H",
                "chunks": [{"id": 0, "name": "c0", "hash": "h0"}],
                "guid": null,
                "seq_number": 0,
            }),
        )
        .await;
        assert_eq!(first["success"], json!(true));
        let guid = first["guid"].clone();

        let second = post_json(
            app,
            "/add_file",
            "POST",
            json!({
                "name": "x",
                "full_hash": "H",
                "chunks": [{"id": 0, "name": "c0", "hash": "h0"}],
                "guid": guid,
                "seq_number": 0,
            }),
        )
        .await;
        assert_eq!(second["success"], json!(false));
        assert_eq!(
            second["error"],
            json!("Tracker is expecting sequence number 1 (sequence number 0 was sent)")
        );
    }

    #[tokio::test]
    async fn tracker_sync_from_unknown_sender_self_evicts() {
        let (_dir, state) = test_state();
        let app = router(state);

        let response = post_json(
            app,
            "/tracker_sync",
            "PATCH",
            json!({
                "event": "new_tracker",
                "event_ip": "10.0.0.9",
                "data": {},
            }),
        )
        .await;
        assert_eq!(response["success"], json!(false));
        assert_eq!(response["dead_tracker"], json!(true));
    }

    #[tokio::test]
    async fn tracker_list_reports_none_known() {
        let (_dir, state) = test_state();
        let app = router(state);

        let request = Request::builder()
            .method("GET")
            .uri("/tracker_list")
            .extension(axum::extract::ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("No other trackers known to this one"));
    }
}

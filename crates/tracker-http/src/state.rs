use std::sync::Arc;

use tracker_broadcast::Broadcaster;
use tracker_store::Store;

/// Shared application state. Cloned into every handler — cheap, since both
/// fields are themselves reference-counted.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub broadcaster: Broadcaster,
    /// Seconds a peer's `keep_alive_timestamp` may lag `now` and still count
    /// as online.
    pub keep_alive_timeout: i64,
}

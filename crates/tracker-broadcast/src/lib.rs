//! Event fan-out to sibling trackers.
//!
//! Holds one queue per known tracker and a fixed pool of worker tasks that
//! drain them by PATCHing `/tracker_sync`. Workers are interchangeable —
//! there is no per-tracker affinity, so FIFO delivery to a destination is
//! not guaranteed when more than one worker can see the same queue. That is
//! intentional: the sequence gate at the receiver makes re-ordering and
//! re-delivery harmless.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_lock::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracker_store::Store;
use tracker_types::SyncEvent;

const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_MAX_FAILURES: u32 = 3;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub worker_count: usize,
    pub max_tracker_failures: u32,
    pub poll_interval: Duration,
    pub send_timeout: Duration,
    pub port: u16,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            max_tracker_failures: DEFAULT_MAX_FAILURES,
            poll_interval: DEFAULT_POLL_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            port: 42070,
        }
    }
}

struct TrackerQueue {
    ip: String,
    queue: Mutex<VecDeque<SyncEvent>>,
    failure_count: AtomicU32,
}

/// Fan-out broadcaster. Cheaply cloneable — all state lives behind `Arc`s,
/// so the tracker map can be safely mutated from request handlers while
/// workers iterate a snapshot of it concurrently.
#[derive(Clone)]
pub struct Broadcaster {
    config: BroadcastConfig,
    client: reqwest::Client,
    store: Arc<Store>,
    trackers: Arc<RwLock<HashMap<String, Arc<TrackerQueue>>>>,
    interrupt: Arc<AtomicBool>,
    /// Signaled once a sibling reports us as evicted (`dead_tracker:true`);
    /// the binary awaits this to know when to exit.
    dead_tracker: Arc<Notify>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Broadcaster {
    /// Constructs a broadcaster without starting any workers. Workers are
    /// spawned lazily on first use via [`Broadcaster::start`], not here,
    /// since the database may not be ready at construction time. `store` is
    /// the same handle the HTTP surface uses — eviction needs to delete the
    /// Tracker row, not just drop the in-memory queue (spec.md §4.3).
    pub fn new(config: BroadcastConfig, store: Arc<Store>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.send_timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            store,
            trackers: Arc::new(RwLock::new(HashMap::new())),
            interrupt: Arc::new(AtomicBool::new(false)),
            dead_tracker: Arc::new(Notify::new()),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A future that resolves once a sibling has told us we've been
    /// evicted. The binary's main loop selects on this to drive a clean
    /// process-wide shutdown.
    pub fn dead_tracker_signal(&self) -> Arc<Notify> {
        self.dead_tracker.clone()
    }

    pub async fn seed_trackers(&self, ips: impl IntoIterator<Item = String>) {
        let mut trackers = self.trackers.write().await;
        for ip in ips {
            trackers.entry(ip.clone()).or_insert_with(|| {
                Arc::new(TrackerQueue {
                    ip,
                    queue: Mutex::new(VecDeque::new()),
                    failure_count: AtomicU32::new(0),
                })
            });
        }
    }

    /// Spawns the fixed worker pool (default 4). Idempotent: calling it
    /// more than once is a no-op past the first call.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.config.worker_count {
            let broadcaster = self.clone();
            workers.push(tokio::spawn(async move {
                broadcaster.worker_loop(worker_id).await;
            }));
        }
    }

    /// Sets the interrupt flag; workers observe it between events and
    /// between destinations and drain cleanly.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub async fn new_tracker(&self, ip: String) {
        let mut trackers = self.trackers.write().await;
        trackers.entry(ip.clone()).or_insert_with(|| {
            Arc::new(TrackerQueue {
                ip,
                queue: Mutex::new(VecDeque::new()),
                failure_count: AtomicU32::new(0),
            })
        });
    }

    /// Deletes the persisted Tracker row, then drops its in-memory queue.
    /// Mirrors `event_broadcaster.py`'s `EventBroadcaster.remove_tracker`,
    /// which calls `models.remove_tracker_by_ip(...)` before discarding the
    /// queue.
    pub async fn remove_tracker(&self, ip: &str) {
        if let Err(error) = tracker_domain::remove_tracker(&self.store, ip) {
            tracing::warn!(tracker = ip, %error, "failed to delete tracker row on eviction");
        }
        self.trackers.write().await.remove(ip);
    }

    pub async fn known_trackers(&self) -> Vec<String> {
        self.trackers.read().await.keys().cloned().collect()
    }

    /// Appends one event to every currently-known tracker's queue.
    pub async fn new_event(&self, event: SyncEvent) {
        let snapshot: Vec<Arc<TrackerQueue>> = self.trackers.read().await.values().cloned().collect();
        for tracker in snapshot {
            tracker.queue.lock().await.push_back(event.clone());
        }
    }

    async fn worker_loop(&self, worker_id: usize) {
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                tracing::debug!(worker_id, "broadcaster worker interrupted, draining");
                return;
            }

            let snapshot: Vec<Arc<TrackerQueue>> = self.trackers.read().await.values().cloned().collect();
            let mut did_work = false;

            for tracker in snapshot {
                if self.interrupt.load(Ordering::SeqCst) {
                    return;
                }
                // Peek, don't pop: the event is only removed from the queue
                // once `deliver` reports it was acknowledged. A transient
                // failure leaves it at the head of the queue so the next
                // pass over this tracker retries the very same event,
                // matching `event_broadcaster.py::_send_event`'s
                // `while keep_trying` retry loop.
                let event = { tracker.queue.lock().await.front().cloned() };
                let Some(event) = event else { continue };
                did_work = true;
                if self.deliver(&tracker, &event).await {
                    tracker.queue.lock().await.pop_front();
                }
            }

            if !did_work {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// Attempts one delivery of `event` to `tracker`. Returns `true` when the
    /// event should be removed from the queue (acknowledged, or the sender
    /// has been told to shut down so retrying is moot) and `false` when it
    /// should be retried on the next pass.
    async fn deliver(&self, tracker: &TrackerQueue, event: &SyncEvent) -> bool {
        let url = format!("http://{}:{}/tracker_sync", tracker.ip, self.config.port);
        let response = self.client.patch(&url).json(event).send().await;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(tracker = %tracker.ip, %error, "tracker_sync send failed");
                self.record_failure(tracker).await;
                return false;
            }
        };

        if !response.status().is_success() {
            tracing::warn!(tracker = %tracker.ip, status = %response.status(), "tracker_sync non-OK status");
            self.record_failure(tracker).await;
            return false;
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(tracker = %tracker.ip, %error, "tracker_sync response not JSON");
                self.record_failure(tracker).await;
                return false;
            }
        };

        if body.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            tracker.failure_count.store(0, Ordering::SeqCst);
            return true;
        }

        if body.get("dead_tracker").and_then(|v| v.as_bool()).unwrap_or(false) {
            tracing::warn!(tracker = %tracker.ip, "evicted from sibling's tracker set, signalling shutdown");
            self.dead_tracker.notify_waiters();
            return true;
        }

        self.record_failure(tracker).await;
        false
    }

    async fn record_failure(&self, tracker: &TrackerQueue) {
        let failures = tracker.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if failures > self.config.max_tracker_failures {
            tracing::warn!(tracker = %tracker.ip, failures, "tracker exceeded failure threshold, removing");
            self.remove_tracker(&tracker.ip).await;
        }
    }
}

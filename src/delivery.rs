//! Per-message delivery tracking, retry with exponential backoff, and the
//! per-destination offline spool for directed messages sent while no route
//! is known.

use crate::codec::envelope::Envelope;
use crate::config::DeliveryConfig;
use crate::ids::{MessageId, NodeId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

struct Tracker {
    destination: NodeId,
    envelope: Envelope,
    status: DeliveryStatus,
    attempts: u32,
}

struct OfflineItem {
    envelope: Envelope,
    enqueued_at: Instant,
    #[allow(dead_code)]
    retry_count: u32,
}

/// Tracks directed sends through PENDING/SENT/DELIVERED/READ/FAILED and
/// spools envelopes for destinations with no current route.
pub struct DeliveryManager {
    config: DeliveryConfig,
    trackers: Mutex<HashMap<MessageId, Tracker>>,
    offline: Mutex<HashMap<NodeId, VecDeque<OfflineItem>>>,
    status_tx: broadcast::Sender<(MessageId, DeliveryStatus)>,
}

impl DeliveryManager {
    pub fn new(config: DeliveryConfig) -> Self {
        let (status_tx, _) = broadcast::channel(256);
        Self {
            config,
            trackers: Mutex::new(HashMap::new()),
            offline: Mutex::new(HashMap::new()),
            status_tx,
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<(MessageId, DeliveryStatus)> {
        self.status_tx.subscribe()
    }

    fn emit(&self, id: MessageId, status: DeliveryStatus) {
        let _ = self.status_tx.send((id, status));
    }

    /// Registers a directed envelope as handed to the link layer.
    pub async fn register_sent(&self, envelope: Envelope) {
        let id = envelope.id;
        let destination = envelope
            .destination
            .expect("delivery tracking applies only to directed envelopes");
        self.trackers.lock().await.insert(
            id,
            Tracker {
                destination,
                envelope,
                status: DeliveryStatus::Sent,
                attempts: 0,
            },
        );
        self.emit(id, DeliveryStatus::Sent);
    }

    pub async fn on_ack(&self, message_id: MessageId) {
        let mut trackers = self.trackers.lock().await;
        if let Some(t) = trackers.get_mut(&message_id) {
            t.status = DeliveryStatus::Delivered;
        }
        drop(trackers);
        self.emit(message_id, DeliveryStatus::Delivered);
    }

    pub async fn on_read_receipt(&self, message_id: MessageId) {
        let mut trackers = self.trackers.lock().await;
        if let Some(t) = trackers.get_mut(&message_id) {
            t.status = DeliveryStatus::Read;
        }
        drop(trackers);
        self.emit(message_id, DeliveryStatus::Read);
    }

    pub async fn status_of(&self, id: &MessageId) -> Option<DeliveryStatus> {
        self.trackers.lock().await.get(id).map(|t| t.status)
    }

    /// 2s, 4s, 8s, 16s, capped at 30s.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff_initial.as_millis() as u64;
        let scaled = base.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(scaled).min(self.config.retry_backoff_cap)
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Called after `ack_timeout` elapses with no ack. Returns the envelope
    /// to re-hand to egress, or `None` if it was already acked, already
    /// failed, or retries are exhausted (in which case it is spooled).
    pub async fn on_timeout(&self, message_id: MessageId) -> Option<Envelope> {
        let mut trackers = self.trackers.lock().await;
        let Some(tracker) = trackers.get_mut(&message_id) else {
            return None;
        };
        if tracker.status != DeliveryStatus::Sent {
            return None;
        }
        if tracker.attempts >= self.config.max_retries {
            tracker.status = DeliveryStatus::Failed;
            let envelope = tracker.envelope.clone();
            let destination = tracker.destination;
            drop(trackers);
            warn!(message_id = %message_id, %destination, "delivery failed after max retries");
            self.emit(message_id, DeliveryStatus::Failed);
            self.enqueue_offline(destination, envelope).await;
            return None;
        }
        tracker.attempts += 1;
        Some(tracker.envelope.clone())
    }

    pub async fn enqueue_offline(&self, destination: NodeId, envelope: Envelope) {
        let mut offline = self.offline.lock().await;
        let queue = offline.entry(destination).or_insert_with(VecDeque::new);
        if queue.len() >= self.config.offline_queue_capacity {
            queue.pop_front();
        }
        queue.push_back(OfflineItem {
            envelope,
            enqueued_at: Instant::now(),
            retry_count: 0,
        });
        debug!(%destination, depth = queue.len(), "envelope spooled offline");
    }

    /// Removes and returns every non-expired item queued for `destination`,
    /// e.g. on `peer_connected` or once a fresh route is discovered.
    pub async fn flush(&self, destination: &NodeId) -> Vec<Envelope> {
        let Some(queue) = self.offline.lock().await.remove(destination) else {
            return Vec::new();
        };
        let expiry = self.config.offline_item_expiry;
        let now = Instant::now();
        queue
            .into_iter()
            .filter(|item| now.duration_since(item.enqueued_at) < expiry)
            .map(|item| item.envelope)
            .collect()
    }

    pub async fn sweep_expired_offline(&self) -> usize {
        let expiry = self.config.offline_item_expiry;
        let now = Instant::now();
        let mut offline = self.offline.lock().await;
        let mut removed = 0usize;
        for queue in offline.values_mut() {
            let before = queue.len();
            queue.retain(|item| now.duration_since(item.enqueued_at) < expiry);
            removed += before - queue.len();
        }
        offline.retain(|_, q| !q.is_empty());
        removed
    }

    /// Snapshot of every spooled item with its current age, for persistence
    /// via `SecureStore::save_offline_queue`.
    pub async fn snapshot_offline(&self) -> Vec<(NodeId, Envelope, Duration)> {
        let now = Instant::now();
        self.offline
            .lock()
            .await
            .iter()
            .flat_map(|(destination, q)| q.iter().map(move |item| (*destination, item)))
            .map(|(destination, item)| (destination, item.envelope.clone(), now.duration_since(item.enqueued_at)))
            .collect()
    }

    /// Reinstates a warm-restart snapshot. `age` is how long ago the item was
    /// originally enqueued, so expiry continues to count from the original
    /// wall-clock time rather than resetting at restart.
    pub async fn restore_offline(&self, items: Vec<(NodeId, Envelope, Duration)>) {
        let now = Instant::now();
        let mut offline = self.offline.lock().await;
        for (destination, envelope, age) in items {
            let queue = offline.entry(destination).or_insert_with(VecDeque::new);
            queue.push_back(OfflineItem {
                envelope,
                enqueued_at: now.checked_sub(age).unwrap_or(now),
                retry_count: 0,
            });
        }
    }

    pub async fn offline_depth(&self, destination: &NodeId) -> usize {
        self.offline
            .lock()
            .await
            .get(destination)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

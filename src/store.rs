//! `SecureStore`: the persistence collaborator for sequence counters, replay
//! high-water marks, a routing-table warm-restart snapshot and the offline
//! queue. Key material storage is out of scope here; an in-memory
//! `MemoryStore` is provided for tests and single-process demos.

use crate::ids::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSnapshotEntry {
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub hop_count: u8,
    pub hop_path: Vec<NodeId>,
    pub reliability: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub entries: Vec<RoutingSnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueItemSnapshot {
    pub destination: NodeId,
    pub envelope_bytes: Vec<u8>,
    pub enqueued_at_ms: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfflineQueueSnapshot {
    pub items: Vec<OfflineQueueItemSnapshot>,
}

#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn load_sequence_counter(&self) -> u64;
    async fn save_sequence_counter(&self, value: u64);
    async fn load_replay_high_water_marks(&self) -> HashMap<NodeId, u64>;
    async fn save_replay_high_water_marks(&self, marks: &HashMap<NodeId, u64>);
    async fn load_routing_snapshot(&self) -> Option<RoutingSnapshot>;
    async fn save_routing_snapshot(&self, snapshot: &RoutingSnapshot);
    async fn load_offline_queue(&self) -> OfflineQueueSnapshot;
    async fn save_offline_queue(&self, snapshot: &OfflineQueueSnapshot);
}

#[derive(Default)]
struct MemoryStoreState {
    sequence_counter: u64,
    replay_marks: HashMap<NodeId, u64>,
    routing_snapshot: Option<RoutingSnapshot>,
    offline_queue: OfflineQueueSnapshot,
}

/// In-memory `SecureStore` for tests and demos. A real deployment backs this
/// with a platform keychain or encrypted file; nothing here is encrypted at
/// rest.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStore for MemoryStore {
    async fn load_sequence_counter(&self) -> u64 {
        self.state.lock().expect("store lock poisoned").sequence_counter
    }

    async fn save_sequence_counter(&self, value: u64) {
        self.state.lock().expect("store lock poisoned").sequence_counter = value;
    }

    async fn load_replay_high_water_marks(&self) -> HashMap<NodeId, u64> {
        self.state.lock().expect("store lock poisoned").replay_marks.clone()
    }

    async fn save_replay_high_water_marks(&self, marks: &HashMap<NodeId, u64>) {
        self.state.lock().expect("store lock poisoned").replay_marks = marks.clone();
    }

    async fn load_routing_snapshot(&self) -> Option<RoutingSnapshot> {
        self.state.lock().expect("store lock poisoned").routing_snapshot.clone()
    }

    async fn save_routing_snapshot(&self, snapshot: &RoutingSnapshot) {
        self.state.lock().expect("store lock poisoned").routing_snapshot = Some(snapshot.clone());
    }

    async fn load_offline_queue(&self) -> OfflineQueueSnapshot {
        self.state.lock().expect("store lock poisoned").offline_queue.clone()
    }

    async fn save_offline_queue(&self, snapshot: &OfflineQueueSnapshot) {
        self.state.lock().expect("store lock poisoned").offline_queue = snapshot.clone();
    }
}

//! `LinkLayer`: the radio/transport collaborator the core does not implement
//! itself. Also provides `SimulatorHub`, an in-process broadcast-capable
//! link used by tests and `demos/simulate.rs` in place of a real BLE stack.

use crate::ids::NodeId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Central,
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: NodeId,
    pub role: LinkRole,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    FrameReceived { frame: Vec<u8>, peer: NodeId, role: LinkRole },
    PeerConnected(PeerInfo),
    PeerDisconnected(PeerInfo),
}

/// The transport contract the mesh core depends on but never implements.
/// MTU-aware framing happens above this trait (`Chunker`); `send`/`broadcast`
/// move already-chunk-sized frames.
#[async_trait]
pub trait LinkLayer: Send + Sync {
    async fn send(&self, frame: &[u8], peer: NodeId) -> bool;
    async fn broadcast(&self, frame: &[u8], exclude: &HashSet<NodeId>) -> usize;
    async fn connected_peers(&self) -> HashMap<NodeId, PeerInfo>;
    fn local_id(&self) -> NodeId;
    fn events(&self) -> mpsc::Receiver<LinkEvent>;
}

struct SimulatedNode {
    inbox: mpsc::Sender<LinkEvent>,
}

/// A shared hub connecting several `SimulatedLink`s, standing in for BLE
/// advertisement/GATT connections in tests and the demo binary. Every node
/// registered with the hub is considered mutually connected.
#[derive(Clone, Default)]
pub struct SimulatorHub {
    nodes: Arc<Mutex<HashMap<NodeId, SimulatedNode>>>,
}

impl SimulatorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, id: NodeId) -> SimulatedLink {
        let (tx, rx) = mpsc::channel(256);
        let mut nodes = self.nodes.lock().expect("hub lock poisoned");
        let existing_peers: Vec<NodeId> = nodes.keys().copied().collect();
        for other in &existing_peers {
            if let Some(node) = nodes.get(other) {
                let _ = node.inbox.try_send(LinkEvent::PeerConnected(PeerInfo {
                    id,
                    role: LinkRole::Central,
                }));
            }
        }
        nodes.insert(id, SimulatedNode { inbox: tx.clone() });
        drop(nodes);
        for other in &existing_peers {
            let _ = tx.try_send(LinkEvent::PeerConnected(PeerInfo {
                id: *other,
                role: LinkRole::Peripheral,
            }));
        }
        SimulatedLink {
            hub: self.clone(),
            local_id: id,
            events: Mutex::new(Some(rx)),
        }
    }

    pub fn leave(&self, id: NodeId) {
        let mut nodes = self.nodes.lock().expect("hub lock poisoned");
        nodes.remove(&id);
        for node in nodes.values() {
            let _ = node.inbox.try_send(LinkEvent::PeerDisconnected(PeerInfo {
                id,
                role: LinkRole::Peripheral,
            }));
        }
    }

    fn connected(&self, local: &NodeId) -> Vec<NodeId> {
        self.nodes
            .lock()
            .expect("hub lock poisoned")
            .keys()
            .copied()
            .filter(|id| id != local)
            .collect()
    }

    fn deliver(&self, to: &NodeId, frame: &[u8], from: NodeId) -> bool {
        let nodes = self.nodes.lock().expect("hub lock poisoned");
        match nodes.get(to) {
            Some(node) => node
                .inbox
                .try_send(LinkEvent::FrameReceived {
                    frame: frame.to_vec(),
                    peer: from,
                    role: LinkRole::Central,
                })
                .is_ok(),
            None => false,
        }
    }
}

/// A `LinkLayer` handle bound to one simulated node on a `SimulatorHub`.
/// `events()` hands out the receiver created at `join` time; it panics if
/// called more than once, matching the "subscribe once at startup" contract
/// real `LinkLayer` implementations are expected to honor.
pub struct SimulatedLink {
    hub: SimulatorHub,
    local_id: NodeId,
    events: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
}

#[async_trait]
impl LinkLayer for SimulatedLink {
    async fn send(&self, frame: &[u8], peer: NodeId) -> bool {
        self.hub.deliver(&peer, frame, self.local_id)
    }

    async fn broadcast(&self, frame: &[u8], exclude: &HashSet<NodeId>) -> usize {
        let mut count = 0;
        for peer in self.hub.connected(&self.local_id) {
            if exclude.contains(&peer) {
                continue;
            }
            if self.hub.deliver(&peer, frame, self.local_id) {
                count += 1;
            }
        }
        count
    }

    async fn connected_peers(&self) -> HashMap<NodeId, PeerInfo> {
        self.hub
            .connected(&self.local_id)
            .into_iter()
            .map(|id| {
                (
                    id,
                    PeerInfo {
                        id,
                        role: LinkRole::Peripheral,
                    },
                )
            })
            .collect()
    }

    fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn events(&self) -> mpsc::Receiver<LinkEvent> {
        self.events
            .lock()
            .expect("events lock poisoned")
            .take()
            .expect("SimulatedLink::events() called more than once")
    }
}

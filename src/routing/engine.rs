//! Reactive, on-demand route discovery (AODV-style): route requests,
//! replies, errors and peer announces. Deliberately does not maintain a
//! proactive table for the whole network — routes exist only for
//! destinations this node has discovered or been told about.

use super::table::{RouteEntry, RoutingTable};
use crate::codec::control::ControlMessage;
use crate::config::RoutingConfig;
use crate::error::RoutingError;
use crate::ids::{MessageId, NodeId};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info};

struct PendingRequest {
    destination: NodeId,
    started: Instant,
    notify: Vec<oneshot::Sender<RouteEntry>>,
}

pub enum DiscoveryOutcome {
    /// A valid route already existed or the destination is directly connected.
    Found(RouteEntry),
    /// A RouteRequest must be broadcast by the caller; `reply` resolves (or
    /// is dropped on timeout) when a matching RouteReply arrives.
    Started {
        request: ControlMessage,
        reply: oneshot::Receiver<RouteEntry>,
    },
    /// Discovery already in flight for this destination; `reply` resolves
    /// alongside the original requester.
    Joined { reply: oneshot::Receiver<RouteEntry> },
}

pub enum RouteRequestAction {
    Drop,
    Reply {
        to: NodeId,
        message: ControlMessage,
    },
    Rebroadcast {
        message: ControlMessage,
        exclude: HashSet<NodeId>,
    },
}

pub enum RouteReplyAction {
    Delivered,
    Forward { to: NodeId, message: ControlMessage },
    Unroutable,
}

pub struct RoutingEngine {
    local_id: NodeId,
    config: RoutingConfig,
    table: RwLock<RoutingTable>,
    reverse_routes: RwLock<HashMap<NodeId, NodeId>>,
    pending: Mutex<HashMap<NodeId, PendingRequest>>,
    seen_requests: StdMutex<LruCache<MessageId, ()>>,
}

impl RoutingEngine {
    pub fn new(local_id: NodeId, config: RoutingConfig) -> Self {
        let capacity = NonZeroUsize::new(config.seen_request_capacity.max(1)).unwrap();
        Self {
            table: RwLock::new(RoutingTable::new(&config)),
            reverse_routes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            seen_requests: StdMutex::new(LruCache::new(capacity)),
            config,
            local_id,
        }
    }

    pub async fn discover_route(
        &self,
        destination: NodeId,
        connected: &HashSet<NodeId>,
    ) -> DiscoveryOutcome {
        if let Some(entry) = self.table.read().await.get_valid(&destination).cloned() {
            return DiscoveryOutcome::Found(entry);
        }
        if connected.contains(&destination) {
            let entry = RouteEntry {
                destination,
                next_hop: destination,
                hop_count: 0,
                hop_path: vec![self.local_id, destination],
                last_used: Instant::now(),
                expires_at: Instant::now() + self.config.route_expiry,
                reliability: 1.0,
                success_count: 0,
                failure_count: 0,
            };
            self.table.write().await.offer(
                entry.destination,
                entry.next_hop,
                entry.hop_count,
                entry.hop_path.clone(),
            );
            return DiscoveryOutcome::Found(entry);
        }

        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.get_mut(&destination) {
            existing.notify.push(tx);
            return DiscoveryOutcome::Joined { reply: rx };
        }
        let request_id = MessageId::new_random();
        pending.insert(
            destination,
            PendingRequest {
                destination,
                started: Instant::now(),
                notify: vec![tx],
            },
        );
        drop(pending);

        let request = ControlMessage::RouteRequest {
            request_id,
            origin: self.local_id,
            destination,
            hop_count: 0,
            hop_path: vec![self.local_id],
            ttl: self.config.max_ttl,
        };
        DiscoveryOutcome::Started { request, reply: rx }
    }

    /// Drops the pending entry for `destination` if discovery timed out
    /// without a reply, so a later retry starts a fresh request.
    pub async fn cancel_pending(&self, destination: &NodeId) {
        self.pending.lock().await.remove(destination);
    }

    pub async fn on_route_request(
        &self,
        from: NodeId,
        request_id: MessageId,
        origin: NodeId,
        destination: NodeId,
        hop_count: u8,
        hop_path: Vec<NodeId>,
        ttl: u8,
    ) -> RouteRequestAction {
        {
            let mut seen = self.seen_requests.lock().expect("seen_requests lock poisoned");
            if seen.put(request_id, ()).is_some() {
                return RouteRequestAction::Drop;
            }
        }

        self.reverse_routes.write().await.insert(origin, from);
        {
            let mut table = self.table.write().await;
            let mut reverse_path = hop_path.clone();
            reverse_path.reverse();
            table.offer(origin, from, hop_count + 1, reverse_path);
        }

        if destination == self.local_id {
            let reply = ControlMessage::RouteReply {
                request_id,
                origin,
                destination: self.local_id,
                hop_count: 0,
                hop_path: vec![self.local_id],
            };
            return RouteRequestAction::Reply { to: from, message: reply };
        }

        if let Some(cached) = self.table.read().await.get_valid(&destination) {
            let mut combined = hop_path.clone();
            combined.extend(cached.hop_path.iter().skip(1));
            let reply = ControlMessage::RouteReply {
                request_id,
                origin,
                destination,
                hop_count: cached.hop_count,
                hop_path: combined,
            };
            return RouteRequestAction::Reply { to: from, message: reply };
        }

        if ttl <= 1 {
            return RouteRequestAction::Drop;
        }
        let mut new_path = hop_path;
        new_path.push(self.local_id);
        let message = ControlMessage::RouteRequest {
            request_id,
            origin,
            destination,
            hop_count: hop_count + 1,
            hop_path: new_path,
            ttl: ttl - 1,
        };
        let mut exclude = HashSet::new();
        exclude.insert(from);
        exclude.insert(origin);
        RouteRequestAction::Rebroadcast { message, exclude }
    }

    pub async fn on_route_reply(
        &self,
        from: NodeId,
        request_id: MessageId,
        origin: NodeId,
        destination: NodeId,
        hop_count: u8,
        hop_path: Vec<NodeId>,
    ) -> RouteReplyAction {
        {
            let mut reverse_path = hop_path.clone();
            reverse_path.reverse();
            self.table
                .write()
                .await
                .offer(destination, from, hop_count + 1, reverse_path);
        }

        if origin == self.local_id {
            let mut pending = self.pending.lock().await;
            if let Some(req) = pending.remove(&destination) {
                info!(destination = %destination, "route discovered");
                let entry = self
                    .table
                    .read()
                    .await
                    .get(&destination)
                    .cloned()
                    .expect("just inserted above");
                for sender in req.notify {
                    let _ = sender.send(entry.clone());
                }
            }
            return RouteReplyAction::Delivered;
        }

        match self.reverse_routes.read().await.get(&origin).copied() {
            Some(next) => {
                let message = ControlMessage::RouteReply {
                    request_id,
                    origin,
                    destination,
                    hop_count: hop_count + 1,
                    hop_path,
                };
                RouteReplyAction::Forward { to: next, message }
            }
            None => RouteReplyAction::Unroutable,
        }
    }

    pub async fn on_peer_disconnected(&self, peer: NodeId) -> Option<ControlMessage> {
        let affected = self.table.write().await.remove_via(&peer);
        self.reverse_routes.write().await.retain(|_, v| *v != peer);
        if affected.is_empty() {
            None
        } else {
            debug!(peer = %peer, affected = affected.len(), "routes invalidated by peer disconnect");
            Some(ControlMessage::RouteError {
                unreachable: peer,
                affected,
            })
        }
    }

    pub async fn on_route_error(&self, unreachable: NodeId, _affected: &[NodeId]) {
        self.table.write().await.remove_via(&unreachable);
    }

    pub async fn on_peer_announce(
        &self,
        from: NodeId,
        node: NodeId,
        hop_count: u8,
    ) -> Option<ControlMessage> {
        if node == self.local_id {
            return None;
        }
        self.table
            .write()
            .await
            .offer(node, from, hop_count, vec![from, node]);
        if hop_count >= 2 {
            return None;
        }
        Some(ControlMessage::PeerAnnounce {
            node,
            display_name: String::new(),
            hop_count: hop_count + 1,
        })
    }

    pub async fn mark_used(&self, destination: &NodeId) {
        self.table.write().await.mark_used(destination);
    }

    pub async fn record_success(&self, destination: &NodeId) {
        self.table.write().await.record_success(destination);
    }

    pub async fn record_failure(&self, destination: &NodeId) {
        self.table.write().await.record_failure(destination);
    }

    pub async fn route_count(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn next_hop(&self, destination: &NodeId) -> Option<NodeId> {
        self.table.read().await.get_valid(destination).map(|e| e.next_hop)
    }

    pub async fn known_routes(&self) -> Vec<RouteEntry> {
        self.table.read().await.get_valid_entries()
    }

    /// Reinstates routes from a warm-restart snapshot. Entries are offered
    /// like any other candidate, so the usual tie-break rule applies.
    pub async fn restore_routes(&self, entries: Vec<(NodeId, NodeId, u8, Vec<NodeId>)>) {
        let mut table = self.table.write().await;
        for (destination, next_hop, hop_count, hop_path) in entries {
            table.offer(destination, next_hop, hop_count, hop_path);
        }
    }

    pub async fn sweep(&self) {
        let expired = self.table.write().await.sweep_expired();
        if expired > 0 {
            debug!(expired, "swept expired routes");
        }
        let now = Instant::now();
        let timeout = self.config.route_discovery_timeout;
        self.pending
            .lock()
            .await
            .retain(|_, req| now.duration_since(req.started) < timeout);
    }
}

//! The composition root: wires codec, crypto, routing, relay and delivery
//! into the two dataflows described at the top of this crate — egress from
//! the application out to a `LinkLayer`, and ingress from a `LinkLayer` back
//! to the application or into routing/delivery control handling. Holds no
//! protocol state of its own beyond what's needed to sequence calls into the
//! other components.

use crate::assembler::Assembler;
use crate::chunker::Chunker;
use crate::codec::control::ControlMessage;
use crate::codec::envelope::Envelope;
use crate::config::MeshConfig;
use crate::crypto::identity::{LocalIdentity, PeerPublicKeys};
use crate::crypto::{decode_sealed, encode_sealed, group, CryptoEngine, GroupKey};
use crate::delivery::{DeliveryManager, DeliveryStatus};
use crate::error::{CryptoError, MeshError};
use crate::ids::{GroupId, MessageId, NodeId};
use crate::link::{LinkEvent, LinkLayer, LinkRole, PeerInfo};
use crate::relay::{IngressOutcome, LinkTag, RelayController, RelayPlan};
use crate::routing::{DiscoveryOutcome, RouteEntry, RouteReplyAction, RouteRequestAction, RoutingEngine};
use crate::store::{
    OfflineQueueItemSnapshot, OfflineQueueSnapshot, RoutingSnapshot, RoutingSnapshotEntry,
    SecureStore,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A message surfaced to the application, already decrypted and stripped of
/// transport framing.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub origin: NodeId,
    pub conversation: Option<GroupId>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct KnownDevice {
    pub id: NodeId,
    pub name: String,
    pub hop_count: u8,
    pub direct: bool,
}

/// Resolves to the terminal (or latest-observed) `DeliveryStatus` for one
/// directed send. Cloning `DeliveryManager`'s status stream rather than
/// returning a bare `Future` keeps this independent of the pipeline's
/// internal retry task.
pub struct DeliveryHandle {
    message_id: MessageId,
    status_rx: broadcast::Receiver<(MessageId, DeliveryStatus)>,
}

impl DeliveryHandle {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Waits for the first terminal status (`Delivered`, `Read`, or
    /// `Failed`) for this message.
    pub async fn wait(mut self) -> DeliveryStatus {
        loop {
            match self.status_rx.recv().await {
                Ok((id, status)) if id == self.message_id => match status {
                    DeliveryStatus::Delivered | DeliveryStatus::Read | DeliveryStatus::Failed => {
                        return status
                    }
                    _ => continue,
                },
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return DeliveryStatus::Failed,
            }
        }
    }
}

#[derive(Clone)]
struct KnownPeerInfo {
    name: String,
    hop_count: u8,
    direct: bool,
}

/// Ties every component into the mesh node's dataflows. Constructed once per
/// device via `MeshNode::start`; every public method takes `&Arc<Self>` so
/// background tasks (retry watchers, ingress loop, maintenance sweep) can
/// hold their own clone.
pub struct MeshNode {
    local_id: NodeId,
    display_name: String,
    config: MeshConfig,
    crypto: Arc<CryptoEngine>,
    routing: Arc<RoutingEngine>,
    relay: Arc<RelayController>,
    delivery: Arc<DeliveryManager>,
    assembler: Arc<Assembler>,
    chunker: Chunker,
    link: Arc<dyn LinkLayer>,
    store: Arc<dyn SecureStore>,
    sequence: AtomicU64,
    message_tx: broadcast::Sender<(InboundMessage, NodeId)>,
    group_keys: RwLock<HashMap<GroupId, GroupKey>>,
    known_identities: RwLock<HashMap<NodeId, PeerPublicKeys>>,
    known_peers: RwLock<HashMap<NodeId, KnownPeerInfo>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MeshNode {
    /// Builds a node and starts its background tasks (ingress loop,
    /// maintenance sweeps). Restores sequence counter, replay state, routing
    /// table and offline queue from `store` if anything was previously
    /// persisted there.
    pub async fn start(
        identity: LocalIdentity,
        display_name: String,
        config: MeshConfig,
        link: Arc<dyn LinkLayer>,
        store: Arc<dyn SecureStore>,
    ) -> Arc<Self> {
        let local_id = identity.node_id;
        let sequence = store.load_sequence_counter().await;
        let replay_marks = store.load_replay_high_water_marks().await;
        let crypto = Arc::new(CryptoEngine::restore(identity, config.crypto.clone(), replay_marks));
        let routing = Arc::new(RoutingEngine::new(local_id, config.routing.clone()));
        if let Some(snapshot) = store.load_routing_snapshot().await {
            let entries = snapshot
                .entries
                .into_iter()
                .map(|e| (e.destination, e.next_hop, e.hop_count, e.hop_path))
                .collect();
            routing.restore_routes(entries).await;
        }
        let relay = Arc::new(RelayController::new(config.relay.clone()));
        let delivery = Arc::new(DeliveryManager::new(config.delivery.clone()));
        let offline = store.load_offline_queue().await;
        let now = now_ms();
        let restored: Vec<(NodeId, Envelope, Duration)> = offline
            .items
            .into_iter()
            .filter_map(|item| {
                let envelope = Envelope::decode(&item.envelope_bytes, config.codec.max_envelope_bytes).ok()?;
                let age = Duration::from_millis(now.saturating_sub(item.enqueued_at_ms));
                Some((item.destination, envelope, age))
            })
            .collect();
        delivery.restore_offline(restored).await;

        let assembler = Arc::new(Assembler::new(config.chunk.clone()));
        let chunker = Chunker::new(config.chunk.clone());
        let (message_tx, _) = broadcast::channel(256);

        let node = Arc::new(Self {
            local_id,
            display_name,
            config,
            crypto,
            routing,
            relay,
            delivery,
            assembler,
            chunker,
            link,
            store,
            sequence: AtomicU64::new(sequence),
            message_tx,
            group_keys: RwLock::new(HashMap::new()),
            known_identities: RwLock::new(HashMap::new()),
            known_peers: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });
        node.clone().spawn_background_tasks().await;
        node
    }

    async fn spawn_background_tasks(self: Arc<Self>) {
        let ingress = self.clone();
        let ingress_handle = tokio::spawn(async move { ingress.ingress_loop().await });
        let maintenance = self.clone();
        let maintenance_handle = tokio::spawn(async move { maintenance.maintenance_loop().await });
        self.tasks.lock().await.extend([ingress_handle, maintenance_handle]);
    }

    async fn ingress_loop(self: Arc<Self>) {
        let mut events = self.link.events();
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::FrameReceived { frame, peer, role } => {
                    self.on_frame_received(frame, peer, role).await;
                }
                LinkEvent::PeerConnected(info) => self.on_peer_connected(info).await,
                LinkEvent::PeerDisconnected(info) => self.on_peer_disconnected(info).await,
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let interval = self.config.routing.route_sweep_interval;
        loop {
            tokio::time::sleep(interval).await;
            self.routing.sweep().await;
            self.relay.sweep();
            self.assembler.sweep().await;
            self.delivery.sweep_expired_offline().await;
            self.persist_replay_if_needed().await;
            self.persist_routing_snapshot().await;
            self.persist_offline_queue().await;
            self.broadcast_peer_announce().await;
        }
    }

    async fn persist_replay_if_needed(&self) {
        if self.crypto.envelope_replay_needs_persist().await {
            let snapshot = self.crypto.envelope_replay_snapshot().await;
            self.store.save_replay_high_water_marks(&snapshot).await;
            self.crypto.mark_envelope_replay_persisted().await;
        }
    }

    async fn persist_routing_snapshot(&self) {
        let entries = self
            .routing
            .known_routes()
            .await
            .into_iter()
            .map(|e| RoutingSnapshotEntry {
                destination: e.destination,
                next_hop: e.next_hop,
                hop_count: e.hop_count,
                hop_path: e.hop_path,
                reliability: e.reliability,
            })
            .collect();
        self.store.save_routing_snapshot(&RoutingSnapshot { entries }).await;
    }

    async fn persist_offline_queue(&self) {
        let now = now_ms();
        let items = self
            .delivery
            .snapshot_offline()
            .await
            .into_iter()
            .map(|(destination, envelope, age)| OfflineQueueItemSnapshot {
                destination,
                envelope_bytes: envelope.encode(),
                enqueued_at_ms: now.saturating_sub(age.as_millis() as u64),
                retry_count: 0,
            })
            .collect();
        self.store.save_offline_queue(&OfflineQueueSnapshot { items }).await;
    }

    /// Registers a peer's long-term public keys, learned out-of-band during
    /// pairing/discovery (out of scope here — this is the seam that work
    /// plugs into).
    pub async fn learn_peer_identity(&self, keys: PeerPublicKeys) {
        self.known_identities.write().await.insert(keys.node_id, keys);
    }

    async fn next_sequence(&self) -> u64 {
        let value = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.store.save_sequence_counter(value + 1).await;
        value
    }

    fn sign_if_required(&self, envelope: &mut Envelope) {
        if self.config.crypto.require_signature {
            let sig = self.crypto.sign(&envelope.signing_bytes());
            envelope.signature = Some(sig.to_bytes().to_vec());
        }
    }

    // ---------------------------------------------------------------- egress

    /// Sends `bytes` to `dest`, discovering a route first if none is cached.
    /// Fails immediately if encryption is required and no identity has been
    /// learned for `dest`; otherwise returns a handle whose status reaches
    /// `Failed` if route discovery times out and retries are exhausted.
    pub async fn send_direct(
        self: &Arc<Self>,
        dest: NodeId,
        bytes: Vec<u8>,
    ) -> Result<DeliveryHandle, MeshError> {
        let sequence = self.next_sequence().await;
        let payload = self.seal_for_peer(dest, &bytes).await?;
        let mut envelope = Envelope::new_direct(self.local_id, dest, sequence, now_ms(), payload);
        envelope.flags.encrypted = self.config.crypto.require_encryption;
        self.sign_if_required(&mut envelope);

        let status_rx = self.delivery.subscribe_status();
        let message_id = envelope.id;
        self.route_and_send(envelope, dest).await;
        Ok(DeliveryHandle { message_id, status_rx })
    }

    async fn seal_for_peer(&self, dest: NodeId, bytes: &[u8]) -> Result<Vec<u8>, MeshError> {
        if !self.config.crypto.require_encryption {
            return Ok(bytes.to_vec());
        }
        let keys = self
            .known_identities
            .read()
            .await
            .get(&dest)
            .cloned()
            .ok_or(CryptoError::NoSession)?;
        let (counter, nonce, ciphertext) = self.crypto.session_for(keys).await?.seal(bytes)?;
        Ok(encode_sealed(counter, &nonce, &ciphertext))
    }

    /// Looks up (or discovers) a route to `envelope.destination` and either
    /// hands it to the link layer now or waits for discovery to resolve.
    async fn route_and_send(self: &Arc<Self>, envelope: Envelope, dest: NodeId) {
        let connected: HashSet<NodeId> = self.link.connected_peers().await.into_keys().collect();
        match self.routing.discover_route(dest, &connected).await {
            DiscoveryOutcome::Found(route) => {
                self.routing.mark_used(&dest).await;
                self.deliver_via(envelope, route.next_hop).await;
            }
            DiscoveryOutcome::Started { request, reply } => {
                self.broadcast_control(request, HashSet::new()).await;
                self.clone().await_route_then_send(reply, envelope, dest);
            }
            DiscoveryOutcome::Joined { reply } => {
                self.clone().await_route_then_send(reply, envelope, dest);
            }
        }
    }

    /// Spawned so `route_and_send` doesn't block the caller for the full
    /// discovery timeout. Spools the envelope if no reply arrives in time.
    fn await_route_then_send(
        self: Arc<Self>,
        reply: tokio::sync::oneshot::Receiver<RouteEntry>,
        envelope: Envelope,
        dest: NodeId,
    ) {
        let timeout = self.config.routing.route_discovery_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, reply).await {
                Ok(Ok(route)) => self.deliver_via(envelope, route.next_hop).await,
                _ => {
                    self.routing.cancel_pending(&dest).await;
                    self.delivery.enqueue_offline(dest, envelope).await;
                }
            }
        });
    }

    async fn deliver_via(self: &Arc<Self>, envelope: Envelope, next_hop: NodeId) {
        let message_id = envelope.id;
        let chunks = self.chunker.chunk(message_id, &envelope.encode());
        let mut all_sent = true;
        for chunk in &chunks {
            if !self.link.send(&chunk.encode(), next_hop).await {
                all_sent = false;
            }
        }
        if !all_sent {
            debug!(%message_id, %next_hop, "link send failed, spooling");
            if let Some(dest) = envelope.destination {
                self.delivery.enqueue_offline(dest, envelope).await;
            }
            return;
        }
        if envelope.destination.is_some() {
            self.delivery.register_sent(envelope).await;
            let node = self.clone();
            let handle = tokio::spawn(async move { node.retry_loop(message_id).await });
            self.tasks.lock().await.push(handle);
        }
    }

    async fn retry_loop(self: Arc<Self>, message_id: MessageId) {
        let mut attempt = 0u32;
        loop {
            let wait = if attempt == 0 {
                self.config.delivery.ack_timeout
            } else {
                self.delivery.backoff_for(attempt)
            };
            tokio::time::sleep(wait).await;
            match self.delivery.on_timeout(message_id).await {
                Some(envelope) => {
                    attempt += 1;
                    let Some(dest) = envelope.destination else { return };
                    let connected: HashSet<NodeId> =
                        self.link.connected_peers().await.into_keys().collect();
                    match self.routing.discover_route(dest, &connected).await {
                        DiscoveryOutcome::Found(route) => {
                            self.deliver_via(envelope, route.next_hop).await;
                        }
                        _ => {
                            self.delivery.enqueue_offline(dest, envelope).await;
                            return;
                        }
                    }
                }
                None => return,
            }
        }
    }

    pub async fn send_broadcast(self: &Arc<Self>, bytes: Vec<u8>) {
        let sequence = self.next_sequence().await;
        let mut envelope = Envelope::new_broadcast(self.local_id, sequence, now_ms(), bytes);
        self.sign_if_required(&mut envelope);
        self.broadcast_envelope(envelope, HashSet::new()).await;
    }

    /// `members` is informational: forwarding is an ordinary broadcast flood
    /// reaching every reachable node, not a membership-aware multicast (see
    /// the group-messaging design note). Application-layer ACLs decide who
    /// actually acts on a group message once everyone can decrypt it with
    /// `group_key`.
    pub async fn send_group(
        self: &Arc<Self>,
        group_id: GroupId,
        members: &[NodeId],
        bytes: Vec<u8>,
        group_key: &GroupKey,
    ) {
        let sequence = self.next_sequence().await;
        debug!(group = %group_id, member_count = members.len(), "sending group message");
        let (nonce, ciphertext) = match group::seal(group_key, sequence, &bytes) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(group = %group_id, error = %e, "group seal failed");
                return;
            }
        };
        let payload = encode_sealed(sequence, &nonce, &ciphertext);
        let mut envelope = Envelope::new_broadcast(self.local_id, sequence, now_ms(), payload);
        envelope.conversation = Some(group_id);
        envelope.flags.group = true;
        envelope.flags.encrypted = true;
        self.sign_if_required(&mut envelope);
        self.group_keys.write().await.insert(group_id, group_key.clone());
        self.broadcast_envelope(envelope, HashSet::new()).await;
    }

    /// Generates a fresh group key, seals a copy for each member under their
    /// pairwise session, and unicasts a `GroupKeyDistribute` to each.
    pub async fn create_group(
        self: &Arc<Self>,
        group_id: GroupId,
        members: &[NodeId],
    ) -> Result<GroupKey, MeshError> {
        let key = GroupKey::generate();
        for member in members {
            let keys = self
                .known_identities
                .read()
                .await
                .get(member)
                .cloned()
                .ok_or(CryptoError::NoSession)?;
            let (counter, nonce, ciphertext) = self.crypto.seal_group_key_for(keys, &key).await?;
            let message = ControlMessage::GroupKeyDistribute {
                group: group_id,
                counter,
                nonce,
                ciphertext,
            };
            self.send_directed_control(*member, message).await;
        }
        self.group_keys.write().await.insert(group_id, key.clone());
        Ok(key)
    }

    async fn broadcast_envelope(self: &Arc<Self>, envelope: Envelope, exclude: HashSet<NodeId>) {
        let chunks = self.chunker.chunk(envelope.id, &envelope.encode());
        for chunk in &chunks {
            self.link.broadcast(&chunk.encode(), &exclude).await;
        }
    }

    fn wrap_control(&self, message: ControlMessage, destination: Option<NodeId>) -> Envelope {
        let payload = message.encode();
        let mut envelope = match destination {
            Some(dest) => Envelope::new_direct(self.local_id, dest, 0, now_ms(), payload),
            None => Envelope::new_broadcast(self.local_id, 0, now_ms(), payload),
        };
        envelope.flags.control = true;
        envelope.ttl = self.config.routing.max_ttl;
        envelope
    }

    /// Hop-by-hop unicast: the recipient is always a directly connected
    /// neighbor (the next hop in a route, or the node that forwarded a
    /// request we're replying to).
    async fn send_control_to(self: &Arc<Self>, to: NodeId, message: ControlMessage) {
        let envelope = self.wrap_control(message, Some(to));
        let chunks = self.chunker.chunk(envelope.id, &envelope.encode());
        for chunk in &chunks {
            self.link.send(&chunk.encode(), to).await;
        }
    }

    /// Directed control addressed to a node possibly several hops away
    /// (`DeliveryAck`, `ReadReceipt`, `GroupKeyDistribute`): forwarded
    /// hop-by-hop along the routing table rather than flooded.
    async fn send_directed_control(self: &Arc<Self>, dest: NodeId, message: ControlMessage) {
        let envelope = self.wrap_control(message, Some(dest));
        let connected: HashSet<NodeId> = self.link.connected_peers().await.into_keys().collect();
        match self.routing.discover_route(dest, &connected).await {
            DiscoveryOutcome::Found(route) => {
                let chunks = self.chunker.chunk(envelope.id, &envelope.encode());
                for chunk in &chunks {
                    self.link.send(&chunk.encode(), route.next_hop).await;
                }
            }
            _ => debug!(%dest, "no route for directed control message, dropping"),
        }
    }

    async fn broadcast_control(self: &Arc<Self>, message: ControlMessage, exclude: HashSet<NodeId>) {
        let envelope = self.wrap_control(message, None);
        self.broadcast_envelope(envelope, exclude).await;
    }

    async fn broadcast_peer_announce(self: &Arc<Self>) {
        let message = ControlMessage::PeerAnnounce {
            node: self.local_id,
            display_name: self.display_name.clone(),
            hop_count: 0,
        };
        self.broadcast_control(message, HashSet::new()).await;
    }

    // --------------------------------------------------------------- ingress

    async fn on_frame_received(self: &Arc<Self>, frame: Vec<u8>, peer: NodeId, _role: LinkRole) {
        let chunk = match crate::codec::chunk::Chunk::decode(&frame) {
            Ok(c) => c,
            Err(e) => {
                debug!(%peer, error = %e, "dropping malformed chunk");
                return;
            }
        };
        let Some(envelope_bytes) = self.assembler.add_chunk(chunk).await else {
            return;
        };
        let max = self.config.codec.max_envelope_bytes;
        let envelope = match Envelope::decode(&envelope_bytes, max) {
            Ok(e) => e,
            Err(e) => {
                debug!(%peer, error = %e, "dropping malformed envelope");
                return;
            }
        };
        self.handle_envelope(envelope, peer).await;
    }

    async fn handle_envelope(self: &Arc<Self>, envelope: Envelope, from: NodeId) {
        let ingress = LinkTag { peer: from };
        if self.relay.observe(&envelope, ingress) == IngressOutcome::Duplicate {
            let degree = self.link.connected_peers().await.len();
            self.relay.cancel_if_duplicate_and_dense(&envelope, degree);
            return;
        }

        if envelope.flags.control {
            self.handle_control(envelope, from).await;
            return;
        }

        if !self.crypto.accept_envelope_sequence(envelope.origin, envelope.sequence).await {
            warn!(origin = %envelope.origin, sequence = envelope.sequence, "rejecting replayed sequence");
            return;
        }
        self.persist_replay_if_needed().await;

        if !self.verify_signature(&envelope).await {
            warn!(origin = %envelope.origin, "rejecting envelope with invalid or missing signature");
            return;
        }

        let for_me = envelope.is_for_me(&self.local_id);
        let broadcast_scoped = envelope.is_broadcast();
        if for_me || broadcast_scoped {
            match self.decrypt_payload(&envelope).await {
                Some(plaintext) => self.deliver_to_application(&envelope, plaintext).await,
                None if for_me => {
                    warn!(origin = %envelope.origin, "decrypt failed, not delivering or relaying");
                    return;
                }
                None => {}
            }
            if for_me {
                self.send_delivery_ack(&envelope).await;
                return;
            }
        }

        let connected: HashSet<NodeId> = self.link.connected_peers().await.into_keys().collect();
        let next_hop = match envelope.destination {
            Some(dest) => self.routing.next_hop(&dest).await,
            None => None,
        };
        match self.relay.plan_relay(&envelope, &self.local_id, ingress, &connected, next_hop) {
            RelayPlan::None => {}
            RelayPlan::Spool => {
                if let Some(dest) = envelope.destination {
                    self.delivery.enqueue_offline(dest, envelope).await;
                }
            }
            RelayPlan::Directed { to, jitter } => self.clone().schedule_relay(envelope, vec![to], jitter),
            RelayPlan::Fanout { to, jitter } => self.clone().schedule_relay(envelope, to, jitter),
        }
    }

    fn schedule_relay(self: Arc<Self>, envelope: Envelope, to: Vec<NodeId>, jitter: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(jitter).await;
            if self.relay.take_cancelled(&envelope) {
                return;
            }
            let mut forwarded = envelope;
            forwarded.increment_hop(self.local_id);
            let bytes = forwarded.encode();
            let chunks = self.chunker.chunk(forwarded.id, &bytes);
            for peer in to {
                for chunk in &chunks {
                    self.link.send(&chunk.encode(), peer).await;
                }
            }
        });
    }

    async fn verify_signature(&self, envelope: &Envelope) -> bool {
        let Some(sig_bytes) = &envelope.signature else {
            return !self.config.crypto.require_signature;
        };
        let Ok(signature) = p256::ecdsa::Signature::from_slice(sig_bytes) else {
            return false;
        };
        let Some(keys) = self.known_identities.read().await.get(&envelope.origin).cloned() else {
            return !self.config.crypto.require_signature;
        };
        crate::crypto::identity::verify(&keys.signing, &envelope.signing_bytes(), &signature).is_ok()
    }

    async fn decrypt_payload(&self, envelope: &Envelope) -> Option<Vec<u8>> {
        if envelope.flags.group {
            let group_id = envelope.conversation?;
            let key = self.group_keys.read().await.get(&group_id).cloned()?;
            let (counter, nonce, ciphertext) = decode_sealed(&envelope.payload).ok()?;
            group::open(&key, counter, &nonce, &ciphertext).ok()
        } else if envelope.flags.encrypted {
            let keys = self.known_identities.read().await.get(&envelope.origin).cloned()?;
            let (counter, nonce, ciphertext) = decode_sealed(&envelope.payload).ok()?;
            let session = self.crypto.session_for(keys).await.ok()?;
            session.open(counter, &nonce, &ciphertext).ok()
        } else {
            Some(envelope.payload.clone())
        }
    }

    async fn deliver_to_application(&self, envelope: &Envelope, plaintext: Vec<u8>) {
        let message = InboundMessage {
            message_id: envelope.id,
            origin: envelope.origin,
            conversation: envelope.conversation,
            payload: plaintext,
        };
        let _ = self.message_tx.send((message, envelope.origin));
    }

    async fn send_delivery_ack(self: &Arc<Self>, envelope: &Envelope) {
        let ack = ControlMessage::DeliveryAck {
            message_id: envelope.id,
            receiver: self.local_id,
        };
        self.send_directed_control(envelope.origin, ack).await;
    }

    async fn handle_control(self: &Arc<Self>, envelope: Envelope, from: NodeId) {
        if let Some(dest) = envelope.destination {
            if dest != self.local_id {
                if let Some(next) = self.routing.next_hop(&dest).await {
                    let mut forwarded = envelope;
                    forwarded.increment_hop(self.local_id);
                    let chunks = self.chunker.chunk(forwarded.id, &forwarded.encode());
                    for chunk in &chunks {
                        self.link.send(&chunk.encode(), next).await;
                    }
                }
                return;
            }
        }

        let message = match ControlMessage::decode(&envelope.payload) {
            Ok(m) => m,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed control message");
                return;
            }
        };

        match message {
            ControlMessage::RouteRequest {
                request_id,
                origin,
                destination,
                hop_count,
                hop_path,
                ttl,
            } => {
                match self
                    .routing
                    .on_route_request(from, request_id, origin, destination, hop_count, hop_path, ttl)
                    .await
                {
                    RouteRequestAction::Drop => {}
                    RouteRequestAction::Reply { to, message } => self.send_control_to(to, message).await,
                    RouteRequestAction::Rebroadcast { message, exclude } => {
                        self.broadcast_control(message, exclude).await
                    }
                }
            }
            ControlMessage::RouteReply {
                request_id,
                origin,
                destination,
                hop_count,
                hop_path,
            } => {
                match self
                    .routing
                    .on_route_reply(from, request_id, origin, destination, hop_count, hop_path)
                    .await
                {
                    RouteReplyAction::Delivered | RouteReplyAction::Unroutable => {}
                    RouteReplyAction::Forward { to, message } => self.send_control_to(to, message).await,
                }
            }
            ControlMessage::RouteError { unreachable, affected } => {
                self.routing.on_route_error(unreachable, &affected).await;
            }
            ControlMessage::PeerAnnounce { node, display_name, hop_count } => {
                if !display_name.is_empty() {
                    self.known_peers.write().await.insert(
                        node,
                        KnownPeerInfo { name: display_name, hop_count, direct: hop_count == 0 },
                    );
                }
                if let Some(forward) = self.routing.on_peer_announce(from, node, hop_count).await {
                    let mut exclude = HashSet::new();
                    exclude.insert(from);
                    self.broadcast_control(forward, exclude).await;
                }
            }
            ControlMessage::DeliveryAck { message_id, receiver } => {
                self.delivery.on_ack(message_id).await;
                self.routing.record_success(&receiver).await;
            }
            ControlMessage::ReadReceipt { message_id, .. } => {
                self.delivery.on_read_receipt(message_id).await;
            }
            ControlMessage::GroupKeyDistribute { group: group_id, counter, nonce, ciphertext } => {
                let Some(keys) = self.known_identities.read().await.get(&envelope.origin).cloned() else {
                    warn!(origin = %envelope.origin, "group key from unknown peer, dropping");
                    return;
                };
                match self.crypto.open_group_key_from(keys, counter, &nonce, &ciphertext).await {
                    Ok(key) => {
                        info!(group = %group_id, "learned group key");
                        self.group_keys.write().await.insert(group_id, key);
                    }
                    Err(e) => warn!(group = %group_id, error = %e, "failed to open group key"),
                }
            }
        }
    }

    async fn on_peer_connected(self: &Arc<Self>, info: PeerInfo) {
        self.known_peers.write().await.insert(
            info.id,
            KnownPeerInfo { name: String::new(), hop_count: 0, direct: true },
        );
        for envelope in self.delivery.flush(&info.id).await {
            self.deliver_via(envelope, info.id).await;
        }
        self.broadcast_peer_announce().await;
    }

    async fn on_peer_disconnected(self: &Arc<Self>, info: PeerInfo) {
        self.known_peers.write().await.remove(&info.id);
        if let Some(error) = self.routing.on_peer_disconnected(info.id).await {
            self.broadcast_control(error, HashSet::new()).await;
        }
    }

    // --------------------------------------------------------- app-facing API

    pub fn on_message(&self) -> broadcast::Receiver<(InboundMessage, NodeId)> {
        self.message_tx.subscribe()
    }

    pub fn on_delivery_status_changed(&self) -> broadcast::Receiver<(MessageId, DeliveryStatus)> {
        self.delivery.subscribe_status()
    }

    pub async fn known_devices(&self) -> Vec<KnownDevice> {
        let mut devices: HashMap<NodeId, KnownDevice> = HashMap::new();
        for (id, info) in self.known_peers.read().await.iter() {
            devices.insert(
                *id,
                KnownDevice { id: *id, name: info.name.clone(), hop_count: info.hop_count, direct: info.direct },
            );
        }
        for peer in self.link.connected_peers().await.into_keys() {
            devices
                .entry(peer)
                .and_modify(|d| d.direct = true)
                .or_insert(KnownDevice { id: peer, name: String::new(), hop_count: 0, direct: true });
        }
        for route in self.routing.known_routes().await {
            devices.entry(route.destination).or_insert(KnownDevice {
                id: route.destination,
                name: String::new(),
                hop_count: route.hop_count,
                direct: route.hop_count == 0,
            });
        }
        devices.into_values().collect()
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}


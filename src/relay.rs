//! Seen-set dedup, ingress-link tagging, relay decision, jitter scheduling
//! and K-of-N broadcast fanout.
//!
//! Routing control traffic (RREQ/RREP/RERR/PeerAnnounce) is forwarded by
//! `RoutingEngine` itself, which already knows the reverse path; this
//! controller only decides whether and how to relay data envelopes that have
//! already passed dedup and (for directed+encrypted traffic) signature
//! verification.

use crate::codec::envelope::Envelope;
use crate::config::RelayConfig;
use crate::ids::NodeId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Fingerprint {
    id: [u8; 16],
    origin: [u8; 16],
    sequence: u64,
}

impl Fingerprint {
    fn of(env: &Envelope) -> Self {
        Self {
            id: *env.id.as_bytes(),
            origin: *env.origin.as_bytes(),
            sequence: env.sequence,
        }
    }
}

/// The (role, peer) pair an envelope first arrived over. The core does not
/// assume BLE central/peripheral roles, so this is just the peer; a
/// `LinkLayer` implementation that distinguishes link roles can fold the
/// role into its `NodeId`/`PeerId` mapping upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkTag {
    pub peer: NodeId,
}

struct SeenEntry {
    first_seen: Instant,
    ingress: LinkTag,
}

#[derive(Debug, PartialEq, Eq)]
pub enum IngressOutcome {
    FirstSeen,
    Duplicate,
}

#[derive(Debug)]
pub enum RelayPlan {
    None,
    Spool,
    Directed { to: NodeId, jitter: Duration },
    Fanout { to: Vec<NodeId>, jitter: Duration },
}

pub struct RelayController {
    config: RelayConfig,
    seen: Mutex<HashMap<Fingerprint, SeenEntry>>,
    cancelled: Mutex<HashSet<Fingerprint>>,
}

impl RelayController {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            seen: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    /// Called when a duplicate arrives for an envelope that already has a
    /// relay scheduled: in a dense neighborhood (degree above the
    /// suppression threshold) another node has likely already delivered it,
    /// so the pending relay is marked for cancellation.
    pub fn cancel_if_duplicate_and_dense(&self, env: &Envelope, degree: usize) {
        if degree > self.config.fanout_suppression_degree {
            self.cancelled
                .lock()
                .expect("cancelled-set lock poisoned")
                .insert(Fingerprint::of(env));
        }
    }

    /// Checked by the scheduled relay task right before it fires. Consumes
    /// the cancellation mark if present.
    pub fn take_cancelled(&self, env: &Envelope) -> bool {
        self.cancelled
            .lock()
            .expect("cancelled-set lock poisoned")
            .remove(&Fingerprint::of(env))
    }

    /// Atomic check-and-insert into the seen-set. Only the first sighting of
    /// a given (id, origin, sequence) triple returns `FirstSeen`.
    pub fn observe(&self, env: &Envelope, ingress: LinkTag) -> IngressOutcome {
        let fp = Fingerprint::of(env);
        let mut seen = self.seen.lock().expect("seen-set lock poisoned");
        if seen.contains_key(&fp) {
            IngressOutcome::Duplicate
        } else {
            seen.insert(
                fp,
                SeenEntry {
                    first_seen: Instant::now(),
                    ingress,
                },
            );
            IngressOutcome::FirstSeen
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().expect("seen-set lock poisoned").len()
    }

    pub fn sweep(&self) -> usize {
        let retention = self.config.seen_set_retention;
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("seen-set lock poisoned");
        let before = seen.len();
        seen.retain(|_, e| now.duration_since(e.first_seen) < retention);
        before - seen.len()
    }

    fn jitter_for_degree(&self, degree: usize) -> Duration {
        let (lo, hi) = if degree >= self.config.jitter_high_degree_threshold {
            self.config.jitter_high_degree_ms
        } else if degree >= 3 {
            self.config.jitter_medium_degree_ms
        } else {
            self.config.jitter_low_degree_ms
        };
        let ms = rand::thread_rng().gen_range(lo..=hi);
        Duration::from_millis(ms)
    }

    /// Decide whether/how to relay an already dedup-accepted envelope.
    /// `connected` is the full set of directly-linked peers; `route_next_hop`
    /// is the routing table's next hop for a directed destination, if known.
    pub fn plan_relay(
        &self,
        env: &Envelope,
        local_id: &NodeId,
        ingress: LinkTag,
        connected: &HashSet<NodeId>,
        route_next_hop: Option<NodeId>,
    ) -> RelayPlan {
        if env.origin == *local_id || env.ttl <= 1 || env.flags.control {
            return RelayPlan::None;
        }

        if let Some(dest) = env.destination {
            if dest == *local_id {
                return RelayPlan::None;
            }
            if env.flags.encrypted {
                return match route_next_hop {
                    Some(next) if next != ingress.peer => {
                        let jitter = self.jitter_for_degree(connected.len());
                        RelayPlan::Directed { to: next, jitter }
                    }
                    Some(_) => RelayPlan::None,
                    None => RelayPlan::Spool,
                };
            }
            // Directed but unencrypted traffic is still flood-eligible, same
            // as a broadcast, falling through below.
        }

        let candidates: Vec<NodeId> = connected
            .iter()
            .copied()
            .filter(|p| *p != ingress.peer && !env.hop_path.contains(p))
            .collect();
        if candidates.is_empty() {
            return RelayPlan::None;
        }
        let n = candidates.len();
        let k = (((n as f64).sqrt().ceil() as usize) + 1).min(n);
        let selected = seeded_select(candidates, k, &Fingerprint::of(env));
        let jitter = self.jitter_for_degree(n);
        RelayPlan::Fanout { to: selected, jitter }
    }
}

/// Deterministic Fisher-Yates shuffle seeded on the message fingerprint: the
/// same message always selects the same K neighbors at this node, but
/// different messages spread differently.
fn seeded_select(mut candidates: Vec<NodeId>, k: usize, fp: &Fingerprint) -> Vec<NodeId> {
    let mut seed = [0u8; 32];
    seed[..16].copy_from_slice(&fp.id);
    seed[16..].copy_from_slice(&fp.origin);
    let mut rng = StdRng::from_seed(seed);
    let len = candidates.len();
    for i in (1..len).rev() {
        let j = rng.gen_range(0..=i);
        candidates.swap(i, j);
    }
    candidates.truncate(k);
    candidates
}

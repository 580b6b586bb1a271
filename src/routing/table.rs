//! Destination → next-hop routing table.

use crate::config::RoutingConfig;
use crate::ids::NodeId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub hop_count: u8,
    pub hop_path: Vec<NodeId>,
    pub last_used: Instant,
    pub expires_at: Instant,
    pub reliability: f32,
    pub success_count: u64,
    pub failure_count: u64,
}

impl RouteEntry {
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    pub fn is_valid(&self, min_reliability: f32) -> bool {
        !self.is_expired() && self.reliability > min_reliability
    }
}

pub struct RoutingTable {
    entries: HashMap<NodeId, RouteEntry>,
    route_expiry: Duration,
    min_reliability: f32,
}

impl RoutingTable {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            entries: HashMap::new(),
            route_expiry: config.route_expiry,
            min_reliability: config.min_reliability,
        }
    }

    pub fn get(&self, destination: &NodeId) -> Option<&RouteEntry> {
        self.entries.get(destination)
    }

    pub fn get_valid(&self, destination: &NodeId) -> Option<&RouteEntry> {
        self.entries
            .get(destination)
            .filter(|e| e.is_valid(self.min_reliability))
    }

    /// Install or refresh a route, applying the tie-break rule: prefer lower
    /// hop count; on ties, prefer the fresher candidate; an expired
    /// incumbent is always replaced regardless of hop count.
    pub fn offer(
        &mut self,
        destination: NodeId,
        next_hop: NodeId,
        hop_count: u8,
        hop_path: Vec<NodeId>,
    ) {
        let now = Instant::now();
        let candidate = RouteEntry {
            destination,
            next_hop,
            hop_count,
            hop_path,
            last_used: now,
            expires_at: now + self.route_expiry,
            reliability: 1.0,
            success_count: 0,
            failure_count: 0,
        };
        match self.entries.get(&destination) {
            None => {
                self.entries.insert(destination, candidate);
            }
            Some(existing) => {
                let replace = existing.is_expired()
                    || candidate.hop_count < existing.hop_count
                    || (candidate.hop_count == existing.hop_count
                        && candidate.last_used > existing.last_used);
                if replace {
                    self.entries.insert(destination, candidate);
                }
            }
        }
    }

    pub fn mark_used(&mut self, destination: &NodeId) {
        if let Some(e) = self.entries.get_mut(destination) {
            e.last_used = Instant::now();
            e.expires_at = e.last_used + self.route_expiry;
        }
    }

    pub fn record_success(&mut self, destination: &NodeId) {
        if let Some(e) = self.entries.get_mut(destination) {
            e.success_count += 1;
            e.reliability = e.success_count as f32 / (e.success_count + e.failure_count) as f32;
        }
    }

    pub fn record_failure(&mut self, destination: &NodeId) {
        if let Some(e) = self.entries.get_mut(destination) {
            e.failure_count += 1;
            e.reliability = e.success_count as f32 / (e.success_count + e.failure_count) as f32;
        }
    }

    /// Removes every route whose next hop is `dropped_peer`, returning the
    /// affected destinations so the caller can broadcast a RouteError.
    pub fn remove_via(&mut self, dropped_peer: &NodeId) -> Vec<NodeId> {
        let affected: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.next_hop == *dropped_peer)
            .map(|(dest, _)| *dest)
            .collect();
        for dest in &affected {
            self.entries.remove(dest);
        }
        affected
    }

    /// Snapshot of every currently-valid route, e.g. for `known_devices()` or
    /// a warm-restart `SecureStore` snapshot.
    pub fn get_valid_entries(&self) -> Vec<RouteEntry> {
        self.entries
            .values()
            .filter(|e| e.is_valid(self.min_reliability))
            .cloned()
            .collect()
    }

    pub fn sweep_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        RoutingTable::new(&RoutingConfig::default())
    }

    #[test]
    fn offer_inserts_new_route() {
        let mut t = table();
        let dest = NodeId::new_random();
        let hop = NodeId::new_random();
        t.offer(dest, hop, 1, vec![hop, dest]);
        assert_eq!(t.get(&dest).unwrap().hop_count, 1);
    }

    #[test]
    fn offer_prefers_lower_hop_count() {
        let mut t = table();
        let dest = NodeId::new_random();
        let hop_a = NodeId::new_random();
        let hop_b = NodeId::new_random();
        t.offer(dest, hop_a, 3, vec![hop_a, dest]);
        t.offer(dest, hop_b, 1, vec![hop_b, dest]);
        assert_eq!(t.get(&dest).unwrap().next_hop, hop_b);
    }

    #[test]
    fn offer_keeps_better_route_on_worse_candidate() {
        let mut t = table();
        let dest = NodeId::new_random();
        let hop_a = NodeId::new_random();
        let hop_b = NodeId::new_random();
        t.offer(dest, hop_a, 1, vec![hop_a, dest]);
        t.offer(dest, hop_b, 3, vec![hop_b, dest]);
        assert_eq!(t.get(&dest).unwrap().next_hop, hop_a);
    }

    #[test]
    fn remove_via_clears_affected_routes_only() {
        let mut t = table();
        let dead_hop = NodeId::new_random();
        let live_hop = NodeId::new_random();
        let dest_a = NodeId::new_random();
        let dest_b = NodeId::new_random();
        t.offer(dest_a, dead_hop, 1, vec![dead_hop, dest_a]);
        t.offer(dest_b, live_hop, 1, vec![live_hop, dest_b]);
        let affected = t.remove_via(&dead_hop);
        assert_eq!(affected, vec![dest_a]);
        assert!(t.get(&dest_a).is_none());
        assert!(t.get(&dest_b).is_some());
    }

    #[test]
    fn reliability_tracks_success_and_failure() {
        let mut t = table();
        let dest = NodeId::new_random();
        let hop = NodeId::new_random();
        t.offer(dest, hop, 1, vec![hop, dest]);
        t.record_success(&dest);
        t.record_success(&dest);
        t.record_failure(&dest);
        let entry = t.get(&dest).unwrap();
        assert!((entry.reliability - (2.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn get_valid_entries_excludes_low_reliability_routes() {
        let mut t = table();
        let good = NodeId::new_random();
        let bad = NodeId::new_random();
        t.offer(good, NodeId::new_random(), 1, vec![]);
        t.offer(bad, NodeId::new_random(), 1, vec![]);
        for _ in 0..10 {
            t.record_failure(&bad);
        }
        let valid: Vec<NodeId> = t.get_valid_entries().iter().map(|e| e.destination).collect();
        assert!(valid.contains(&good));
        assert!(!valid.contains(&bad));
    }

    #[test]
    fn low_reliability_route_is_invalid() {
        let mut t = table();
        let dest = NodeId::new_random();
        let hop = NodeId::new_random();
        t.offer(dest, hop, 1, vec![hop, dest]);
        for _ in 0..10 {
            t.record_failure(&dest);
        }
        assert!(t.get_valid(&dest).is_none());
    }
}

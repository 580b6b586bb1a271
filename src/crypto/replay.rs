//! Sliding-window duplicate/replay rejection for a monotonic counter.
//!
//! Used both for per-origin envelope sequence numbers (§ envelope replay
//! protection) and for the per-session AEAD ratchet counter. A strict
//! highest-seen-only check would desynchronize on a single dropped or
//! reordered frame in a lossy mesh, so counters within `window` of the
//! current high-water mark are still accepted and tracked individually.

use crate::ids::NodeId;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ReplayWindow {
    window: u64,
    highest: Option<u64>,
    seen_bitmap: u64,
}

impl ReplayWindow {
    pub fn new(window: u64) -> Self {
        assert!(window > 0 && window <= 64, "window must fit a u64 bitmap");
        Self {
            window,
            highest: None,
            seen_bitmap: 0,
        }
    }

    /// Returns true and records `counter` as seen iff it is not a replay.
    pub fn check_and_accept(&mut self, counter: u64) -> bool {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.seen_bitmap = 1;
                true
            }
            Some(h) if counter > h => {
                let shift = counter - h;
                self.seen_bitmap = if shift >= self.window {
                    1
                } else {
                    (self.seen_bitmap << shift) | 1
                };
                self.highest = Some(counter);
                true
            }
            Some(h) => {
                let back = h - counter;
                if back >= self.window {
                    return false;
                }
                let bit = 1u64 << back;
                if self.seen_bitmap & bit != 0 {
                    false
                } else {
                    self.seen_bitmap |= bit;
                    true
                }
            }
        }
    }

    /// Lowest counter value this window will still accept; keys derived for
    /// counters below this floor should not be retained.
    pub fn floor(&self) -> u64 {
        self.highest
            .map(|h| h.saturating_sub(self.window - 1))
            .unwrap_or(0)
    }

    pub fn high_water_mark(&self) -> Option<u64> {
        self.highest
    }
}

/// Tracks one `ReplayWindow` per origin and batches persistence: the
/// in-memory check is strict on every message, but `SecureStore` writes only
/// happen every `persist_every` updates to avoid write-amplifying a
/// key-value store on every accepted envelope.
pub struct ReplayTracker {
    window: u64,
    persist_every: u32,
    windows: HashMap<NodeId, ReplayWindow>,
    updates_since_persist: u32,
}

impl ReplayTracker {
    pub fn new(window: u64, persist_every: u32) -> Self {
        Self {
            window,
            persist_every,
            windows: HashMap::new(),
            updates_since_persist: 0,
        }
    }

    pub fn restore(window: u64, persist_every: u32, high_water_marks: HashMap<NodeId, u64>) -> Self {
        let mut tracker = Self::new(window, persist_every);
        for (origin, mark) in high_water_marks {
            let mut w = ReplayWindow::new(window);
            w.check_and_accept(mark);
            tracker.windows.insert(origin, w);
        }
        tracker
    }

    /// Returns true iff `sequence` from `origin` is accepted (not a replay).
    pub fn accept(&mut self, origin: NodeId, sequence: u64) -> bool {
        let window = self.window;
        let w = self
            .windows
            .entry(origin)
            .or_insert_with(|| ReplayWindow::new(window));
        let accepted = w.check_and_accept(sequence);
        if accepted {
            self.updates_since_persist += 1;
        }
        accepted
    }

    /// True when enough updates have accumulated that the caller should
    /// flush `snapshot()` to `SecureStore` and call `mark_persisted`.
    pub fn needs_persist(&self) -> bool {
        self.updates_since_persist >= self.persist_every
    }

    pub fn mark_persisted(&mut self) {
        self.updates_since_persist = 0;
    }

    pub fn snapshot(&self) -> HashMap<NodeId, u64> {
        self.windows
            .iter()
            .filter_map(|(origin, w)| w.high_water_mark().map(|h| (*origin, h)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_strictly_increasing_sequence() {
        let mut w = ReplayWindow::new(64);
        assert!(w.check_and_accept(1));
        assert!(w.check_and_accept(2));
        assert!(w.check_and_accept(3));
    }

    #[test]
    fn rejects_exact_replay() {
        let mut w = ReplayWindow::new(64);
        assert!(w.check_and_accept(5));
        assert!(!w.check_and_accept(5));
    }

    #[test]
    fn accepts_mild_reordering_within_window() {
        let mut w = ReplayWindow::new(8);
        assert!(w.check_and_accept(10));
        assert!(w.check_and_accept(12));
        assert!(w.check_and_accept(11)); // out of order but within window
        assert!(!w.check_and_accept(11)); // now a replay
    }

    #[test]
    fn rejects_counter_below_floor() {
        let mut w = ReplayWindow::new(4);
        assert!(w.check_and_accept(100));
        assert!(!w.check_and_accept(50)); // far below floor
    }

    #[test]
    fn tracker_scopes_windows_per_origin() {
        let mut tracker = ReplayTracker::new(64, 16);
        let a = NodeId::new_random();
        let b = NodeId::new_random();
        assert!(tracker.accept(a, 1));
        assert!(tracker.accept(b, 1)); // independent origin, not a replay
        assert!(!tracker.accept(a, 1));
    }

    #[test]
    fn tracker_batches_persistence() {
        let mut tracker = ReplayTracker::new(64, 4);
        let origin = NodeId::new_random();
        for i in 1..4 {
            tracker.accept(origin, i);
            assert!(!tracker.needs_persist());
        }
        tracker.accept(origin, 4);
        assert!(tracker.needs_persist());
        tracker.mark_persisted();
        assert!(!tracker.needs_persist());
    }
}

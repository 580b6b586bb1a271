//! Reassembles chunks back into envelope bytes.
//!
//! Per-message state expires independently of any other component; a
//! background sweep (driven by the node's maintenance loop) evicts partial
//! messages that never completed within `expiry`.

use crate::codec::chunk::Chunk;
use crate::config::ChunkConfig;
use crate::ids::MessageId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Partial {
    total: u16,
    received: u16,
    slots: Vec<Option<Vec<u8>>>,
    first_seen: Instant,
}

pub struct Assembler {
    state: Arc<Mutex<HashMap<MessageId, Partial>>>,
    expiry: Duration,
}

impl Assembler {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            expiry: config.assembly_expiry,
        }
    }

    /// Insert a chunk. Returns the reassembled bytes once every index
    /// 0..total-1 has been observed. Re-delivering an already-filled slot is
    /// a no-op (idempotent).
    pub async fn add_chunk(&self, chunk: Chunk) -> Option<Vec<u8>> {
        let mut state = self.state.lock().await;
        let entry = state.entry(chunk.message_id).or_insert_with(|| Partial {
            total: chunk.total,
            received: 0,
            slots: vec![None; chunk.total as usize],
            first_seen: Instant::now(),
        });

        let idx = chunk.index as usize;
        if idx >= entry.slots.len() || entry.slots[idx].is_some() {
            return None;
        }
        entry.slots[idx] = Some(chunk.payload);
        entry.received += 1;

        if entry.received == entry.total {
            let entry = state.remove(&chunk.message_id).unwrap();
            let mut out = Vec::new();
            for slot in entry.slots {
                out.extend(slot.expect("all slots filled by completion check"));
            }
            Some(out)
        } else {
            None
        }
    }

    /// Drop partial messages older than `expiry`. Intended to run on a
    /// periodic timer from the node's maintenance task.
    pub async fn sweep(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.len();
        let expiry = self.expiry;
        state.retain(|_, p| p.first_seen.elapsed() < expiry);
        before - state.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::chunk::split;

    #[tokio::test]
    async fn reassembles_after_all_chunks_delivered() {
        let assembler = Assembler::new(ChunkConfig::default());
        let id = MessageId::new_random();
        let bytes = vec![5u8; 500];
        let chunks = split(id, &bytes, 162);
        let mut result = None;
        for c in chunks {
            result = assembler.add_chunk(c).await;
        }
        assert_eq!(result, Some(bytes));
    }

    #[tokio::test]
    async fn out_of_order_chunks_still_assemble() {
        let assembler = Assembler::new(ChunkConfig::default());
        let id = MessageId::new_random();
        let bytes = vec![9u8; 400];
        let mut chunks = split(id, &bytes, 162);
        chunks.reverse();
        let mut result = None;
        for c in chunks {
            result = assembler.add_chunk(c).await;
        }
        assert_eq!(result, Some(bytes));
    }

    #[tokio::test]
    async fn missing_chunk_never_completes() {
        let assembler = Assembler::new(ChunkConfig::default());
        let id = MessageId::new_random();
        let bytes = vec![3u8; 400];
        let chunks = split(id, &bytes, 162);
        let total = chunks.len();
        for c in chunks.into_iter().take(total - 1) {
            assert!(assembler.add_chunk(c).await.is_none());
        }
        assert_eq!(assembler.pending_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_chunk_is_idempotent() {
        let assembler = Assembler::new(ChunkConfig::default());
        let id = MessageId::new_random();
        let bytes = vec![1u8; 10];
        let chunks = split(id, &bytes, 162);
        assert_eq!(chunks.len(), 1);
        let c = chunks.into_iter().next().unwrap();
        assert_eq!(assembler.add_chunk(c.clone()).await, Some(bytes));
        // message already complete and removed; redelivering starts a fresh partial
        assert_eq!(assembler.pending_count().await, 0);
    }
}

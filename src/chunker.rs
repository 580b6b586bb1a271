//! Fragments serialized envelope bytes into link-MTU-sized chunks.

use crate::codec::chunk::{split, Chunk};
use crate::config::ChunkConfig;
use crate::ids::MessageId;

pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn chunk(&self, message_id: MessageId, envelope_bytes: &[u8]) -> Vec<Chunk> {
        split(message_id, envelope_bytes, self.config.payload_bytes())
    }
}

//! Link-MTU-sized slices of a serialized envelope.

use super::{Reader, Writer};
use crate::error::DecodeError;
use crate::ids::MessageId;

const FLAG_FINAL: u8 = 0b0000_0001;

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub message_id: MessageId,
    pub index: u16,
    pub total: u16,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn is_final(&self) -> bool {
        self.index + 1 == self.total
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.fixed16(self.message_id.as_bytes());
        w.u16(self.index);
        w.u16(self.total);
        w.u8(if self.is_final() { FLAG_FINAL } else { 0 });
        w.u16(self.payload.len() as u16);
        w.bytes(&self.payload);
        w.into_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        let message_id = MessageId::from_bytes(r.fixed16()?);
        let index = r.u16()?;
        let total = r.u16()?;
        let _flags = r.u8()?;
        let len = r.u16()? as usize;
        let payload = r.bytes(len)?.to_vec();
        r.finish()?;
        if index >= total {
            return Err(DecodeError::Malformed("chunk index out of range"));
        }
        Ok(Self {
            message_id,
            index,
            total,
            payload,
        })
    }
}

/// Split `bytes` into MTU-sized chunks sharing `message_id`. Always emits at
/// least one chunk, even for empty input.
pub fn split(message_id: MessageId, bytes: &[u8], payload_max: usize) -> Vec<Chunk> {
    assert!(payload_max > 0, "payload_max must be positive");
    if bytes.is_empty() {
        return vec![Chunk {
            message_id,
            index: 0,
            total: 1,
            payload: Vec::new(),
        }];
    }
    let total = ((bytes.len() + payload_max - 1) / payload_max) as u16;
    bytes
        .chunks(payload_max)
        .enumerate()
        .map(|(i, slice)| Chunk {
            message_id,
            index: i as u16,
            total,
            payload: slice.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_produces_expected_chunk_count() {
        let id = MessageId::new_random();
        let bytes = vec![7u8; 350];
        let chunks = split(id, &bytes, 162);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].total, 3);
        assert!(chunks[2].is_final());
        assert!(!chunks[0].is_final());
    }

    #[test]
    fn single_chunk_for_small_payload() {
        let id = MessageId::new_random();
        let bytes = vec![1u8; 10];
        let chunks = split(id, &bytes, 162);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total, 1);
    }

    #[test]
    fn chunk_round_trips() {
        let id = MessageId::new_random();
        let chunks = split(id, &[1, 2, 3, 4, 5], 2);
        for c in &chunks {
            let bytes = c.encode();
            let decoded = Chunk::decode(&bytes).unwrap();
            assert_eq!(*c, decoded);
        }
    }

    #[test]
    fn rejects_index_out_of_range() {
        let mut w = Writer::new();
        let id = MessageId::new_random();
        w.fixed16(id.as_bytes());
        w.u16(5); // index
        w.u16(3); // total, index >= total
        w.u8(0);
        w.u16(0);
        let bytes = w.into_vec();
        assert!(Chunk::decode(&bytes).is_err());
    }
}

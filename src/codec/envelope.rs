//! The routed, signed, authenticated unit of transmission.

use super::{Reader, Writer};
use crate::error::DecodeError;
use crate::ids::{GroupId, MessageId, NodeId};

pub const DEFAULT_TTL: u8 = 3;
pub const MAX_TTL: u8 = 8;
const WIRE_VERSION: u8 = 1;

const FLAG_CONTROL: u8 = 0b0000_0001;
const FLAG_ENCRYPTED: u8 = 0b0000_0010;
const FLAG_GROUP: u8 = 0b0000_0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeFlags {
    pub control: bool,
    pub encrypted: bool,
    pub group: bool,
}

impl EnvelopeFlags {
    fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.control {
            b |= FLAG_CONTROL;
        }
        if self.encrypted {
            b |= FLAG_ENCRYPTED;
        }
        if self.group {
            b |= FLAG_GROUP;
        }
        b
    }

    fn from_byte(b: u8) -> Self {
        Self {
            control: b & FLAG_CONTROL != 0,
            encrypted: b & FLAG_ENCRYPTED != 0,
            group: b & FLAG_GROUP != 0,
        }
    }
}

/// A routed message. `destination` absent means broadcast. `signature`,
/// when present, covers `signing_bytes()` and is checked against `origin`'s
/// signing key before the envelope is delivered or relayed as data.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: MessageId,
    pub origin: NodeId,
    pub destination: Option<NodeId>,
    pub conversation: Option<GroupId>,
    pub timestamp_ms: u64,
    pub sequence: u64,
    pub ttl: u8,
    pub hop_path: Vec<NodeId>,
    pub flags: EnvelopeFlags,
    pub payload: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

impl Envelope {
    pub fn new_direct(
        origin: NodeId,
        destination: NodeId,
        sequence: u64,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: MessageId::new_random(),
            origin,
            destination: Some(destination),
            conversation: None,
            timestamp_ms,
            sequence,
            ttl: DEFAULT_TTL,
            hop_path: vec![origin],
            flags: EnvelopeFlags::default(),
            payload,
            signature: None,
        }
    }

    pub fn new_broadcast(origin: NodeId, sequence: u64, timestamp_ms: u64, payload: Vec<u8>) -> Self {
        Self {
            id: MessageId::new_random(),
            origin,
            destination: None,
            conversation: None,
            timestamp_ms,
            sequence,
            ttl: DEFAULT_TTL,
            hop_path: vec![origin],
            flags: EnvelopeFlags::default(),
            payload,
            signature: None,
        }
    }

    /// The exact byte layout the ECDSA signature covers: id, origin, dest
    /// (or an absence byte), big-endian millisecond timestamp, big-endian
    /// sequence. Fixed-width ids and integer timestamps make this
    /// byte-identical across implementations, unlike UTF-8 UUID text or
    /// decimal timestamps.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.fixed16(self.id.as_bytes());
        w.fixed16(self.origin.as_bytes());
        match &self.destination {
            Some(dest) => {
                w.u8(0x01);
                w.fixed16(dest.as_bytes());
            }
            None => w.u8(0x00),
        }
        w.u64(self.timestamp_ms);
        w.u64(self.sequence);
        w.into_vec()
    }

    pub fn is_for_me(&self, my_id: &NodeId) -> bool {
        self.destination.as_ref() == Some(my_id)
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }

    /// Decrement TTL and append `relay` to the hop path. Never reverses either effect.
    pub fn increment_hop(&mut self, relay: NodeId) {
        self.ttl = self.ttl.saturating_sub(1);
        self.hop_path.push(relay);
    }

    /// True if this envelope must not be relayed further: TTL exhausted or
    /// `peer` already appears in the recorded path (would create a loop).
    pub fn should_drop(&self, peer: &NodeId) -> bool {
        self.ttl == 0 || self.hop_path.contains(peer)
    }

    pub fn size(&self) -> usize {
        self.encode().len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(WIRE_VERSION);
        w.u8(self.flags.to_byte());
        w.fixed16(self.id.as_bytes());
        w.fixed16(self.origin.as_bytes());
        match &self.destination {
            Some(d) => {
                w.u8(1);
                w.fixed16(d.as_bytes());
            }
            None => w.u8(0),
        }
        match &self.conversation {
            Some(c) => {
                w.u8(1);
                w.fixed16(c.as_bytes());
            }
            None => w.u8(0),
        }
        w.u64(self.timestamp_ms);
        w.u64(self.sequence);
        w.u8(self.ttl);
        w.u8(self.hop_path.len() as u8);
        for hop in &self.hop_path {
            w.fixed16(hop.as_bytes());
        }
        match &self.signature {
            Some(sig) => {
                w.u8(1);
                w.u16(sig.len() as u16);
                w.bytes(sig);
            }
            None => w.u8(0),
        }
        w.u32(self.payload.len() as u32);
        w.bytes(&self.payload);
        w.into_vec()
    }

    pub fn decode(buf: &[u8], max_size: usize) -> Result<Self, DecodeError> {
        if buf.len() > max_size {
            return Err(DecodeError::TooLarge {
                size: buf.len(),
                max: max_size,
            });
        }
        let mut r = Reader::new(buf);
        let version = r.u8()?;
        if version != WIRE_VERSION {
            return Err(DecodeError::Malformed("unsupported envelope wire version"));
        }
        let flags = EnvelopeFlags::from_byte(r.u8()?);
        let id = MessageId::from_bytes(r.fixed16()?);
        let origin = NodeId::from_bytes(r.fixed16()?);
        let destination = match r.u8()? {
            0 => None,
            1 => Some(NodeId::from_bytes(r.fixed16()?)),
            _ => return Err(DecodeError::Malformed("destination presence byte")),
        };
        let conversation = match r.u8()? {
            0 => None,
            1 => Some(GroupId::from_bytes(r.fixed16()?)),
            _ => return Err(DecodeError::Malformed("conversation presence byte")),
        };
        let timestamp_ms = r.u64()?;
        let sequence = r.u64()?;
        let ttl = r.u8()?;
        let hop_count = r.u8()? as usize;
        let mut hop_path = Vec::with_capacity(hop_count);
        for _ in 0..hop_count {
            hop_path.push(NodeId::from_bytes(r.fixed16()?));
        }
        let signature = match r.u8()? {
            0 => None,
            1 => {
                let len = r.u16()? as usize;
                Some(r.bytes(len)?.to_vec())
            }
            _ => return Err(DecodeError::Malformed("signature presence byte")),
        };
        let payload_len = r.u32()? as usize;
        let payload = r.bytes(payload_len)?.to_vec();
        r.finish()?;
        Ok(Self {
            id,
            origin,
            destination,
            conversation,
            timestamp_ms,
            sequence,
            ttl,
            hop_path,
            flags,
            payload,
            signature,
        })
    }
}

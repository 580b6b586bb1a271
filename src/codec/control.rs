//! Routing and delivery control messages. These never surface to the
//! application; the pipeline dispatches them to the routing engine or
//! delivery manager based on the discriminant byte.

use super::{Reader, Writer};
use crate::error::DecodeError;
use crate::ids::{GroupId, MessageId, NodeId};

const KIND_ROUTE_REQUEST: u8 = 0x01;
const KIND_ROUTE_REPLY: u8 = 0x02;
const KIND_ROUTE_ERROR: u8 = 0x03;
const KIND_PEER_ANNOUNCE: u8 = 0x04;
const KIND_DELIVERY_ACK: u8 = 0x05;
const KIND_READ_RECEIPT: u8 = 0x06;
const KIND_GROUP_KEY_DISTRIBUTE: u8 = 0x07;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    RouteRequest {
        request_id: MessageId,
        origin: NodeId,
        destination: NodeId,
        hop_count: u8,
        hop_path: Vec<NodeId>,
        ttl: u8,
    },
    RouteReply {
        request_id: MessageId,
        origin: NodeId,
        destination: NodeId,
        hop_count: u8,
        hop_path: Vec<NodeId>,
    },
    RouteError {
        unreachable: NodeId,
        affected: Vec<NodeId>,
    },
    PeerAnnounce {
        node: NodeId,
        display_name: String,
        hop_count: u8,
    },
    DeliveryAck {
        message_id: MessageId,
        receiver: NodeId,
    },
    ReadReceipt {
        message_id: MessageId,
        reader: NodeId,
    },
    /// `ciphertext` is the AES-256-GCM output with its 16-byte tag appended
    /// (same convention as `crypto::encode_sealed`), sealed under the
    /// sender's pairwise session with the recipient. `counter` is that
    /// session's ratchet counter for this message, carried on the wire so
    /// the recipient derives the right message key without relying on
    /// strict in-order delivery (see `crypto::session`).
    GroupKeyDistribute {
        group: GroupId,
        counter: u64,
        nonce: [u8; 12],
        ciphertext: Vec<u8>,
    },
}

fn write_node_path(w: &mut Writer, path: &[NodeId]) {
    w.u8(path.len() as u8);
    for n in path {
        w.fixed16(n.as_bytes());
    }
}

fn read_node_path(r: &mut Reader) -> Result<Vec<NodeId>, DecodeError> {
    let count = r.u8()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(NodeId::from_bytes(r.fixed16()?));
    }
    Ok(out)
}

fn write_str(w: &mut Writer, s: &str) {
    let bytes = s.as_bytes();
    w.u16(bytes.len() as u16);
    w.bytes(bytes);
}

fn read_str(r: &mut Reader) -> Result<String, DecodeError> {
    let len = r.u16()? as usize;
    let bytes = r.bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Malformed("display name not utf-8"))
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            ControlMessage::RouteRequest {
                request_id,
                origin,
                destination,
                hop_count,
                hop_path,
                ttl,
            } => {
                w.u8(KIND_ROUTE_REQUEST);
                w.fixed16(request_id.as_bytes());
                w.fixed16(origin.as_bytes());
                w.fixed16(destination.as_bytes());
                w.u8(*hop_count);
                write_node_path(&mut w, hop_path);
                w.u8(*ttl);
            }
            ControlMessage::RouteReply {
                request_id,
                origin,
                destination,
                hop_count,
                hop_path,
            } => {
                w.u8(KIND_ROUTE_REPLY);
                w.fixed16(request_id.as_bytes());
                w.fixed16(origin.as_bytes());
                w.fixed16(destination.as_bytes());
                w.u8(*hop_count);
                write_node_path(&mut w, hop_path);
            }
            ControlMessage::RouteError {
                unreachable,
                affected,
            } => {
                w.u8(KIND_ROUTE_ERROR);
                w.fixed16(unreachable.as_bytes());
                write_node_path(&mut w, affected);
            }
            ControlMessage::PeerAnnounce {
                node,
                display_name,
                hop_count,
            } => {
                w.u8(KIND_PEER_ANNOUNCE);
                w.fixed16(node.as_bytes());
                write_str(&mut w, display_name);
                w.u8(*hop_count);
            }
            ControlMessage::DeliveryAck {
                message_id,
                receiver,
            } => {
                w.u8(KIND_DELIVERY_ACK);
                w.fixed16(message_id.as_bytes());
                w.fixed16(receiver.as_bytes());
            }
            ControlMessage::ReadReceipt { message_id, reader } => {
                w.u8(KIND_READ_RECEIPT);
                w.fixed16(message_id.as_bytes());
                w.fixed16(reader.as_bytes());
            }
            ControlMessage::GroupKeyDistribute {
                group,
                counter,
                nonce,
                ciphertext,
            } => {
                w.u8(KIND_GROUP_KEY_DISTRIBUTE);
                w.fixed16(group.as_bytes());
                w.u64(*counter);
                w.bytes(nonce);
                w.u16(ciphertext.len() as u16);
                w.bytes(ciphertext);
            }
        }
        w.into_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        let kind = r.u8()?;
        let msg = match kind {
            KIND_ROUTE_REQUEST => ControlMessage::RouteRequest {
                request_id: MessageId::from_bytes(r.fixed16()?),
                origin: NodeId::from_bytes(r.fixed16()?),
                destination: NodeId::from_bytes(r.fixed16()?),
                hop_count: r.u8()?,
                hop_path: read_node_path(&mut r)?,
                ttl: r.u8()?,
            },
            KIND_ROUTE_REPLY => ControlMessage::RouteReply {
                request_id: MessageId::from_bytes(r.fixed16()?),
                origin: NodeId::from_bytes(r.fixed16()?),
                destination: NodeId::from_bytes(r.fixed16()?),
                hop_count: r.u8()?,
                hop_path: read_node_path(&mut r)?,
            },
            KIND_ROUTE_ERROR => ControlMessage::RouteError {
                unreachable: NodeId::from_bytes(r.fixed16()?),
                affected: read_node_path(&mut r)?,
            },
            KIND_PEER_ANNOUNCE => ControlMessage::PeerAnnounce {
                node: NodeId::from_bytes(r.fixed16()?),
                display_name: read_str(&mut r)?,
                hop_count: r.u8()?,
            },
            KIND_DELIVERY_ACK => ControlMessage::DeliveryAck {
                message_id: MessageId::from_bytes(r.fixed16()?),
                receiver: NodeId::from_bytes(r.fixed16()?),
            },
            KIND_READ_RECEIPT => ControlMessage::ReadReceipt {
                message_id: MessageId::from_bytes(r.fixed16()?),
                reader: NodeId::from_bytes(r.fixed16()?),
            },
            KIND_GROUP_KEY_DISTRIBUTE => {
                let group = GroupId::from_bytes(r.fixed16()?);
                let counter = r.u64()?;
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(r.bytes(12)?);
                let len = r.u16()? as usize;
                let ciphertext = r.bytes(len)?.to_vec();
                ControlMessage::GroupKeyDistribute {
                    group,
                    counter,
                    nonce,
                    ciphertext,
                }
            }
            other => return Err(DecodeError::UnknownDiscriminant(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

//! Core of a decentralized, infrastructure-free mesh messenger: a
//! hand-rolled wire codec, forward-secret pairwise sessions, AODV-style
//! reactive routing, gossip relay with degree-aware jitter, and
//! per-message delivery tracking with an offline spool.
//!
//! [`pipeline::MeshNode`] is the composition root. Everything else in this
//! crate is a component it owns; applications embedding the mesh only need
//! `pipeline`, `config`, `crypto::identity`, `link` and `store`.

pub mod assembler;
pub mod chunker;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod ids;
pub mod link;
pub mod pipeline;
pub mod relay;
pub mod routing;
pub mod store;

pub use config::MeshConfig;
pub use crypto::identity::{LocalIdentity, PeerPublicKeys};
pub use crypto::GroupKey;
pub use error::{MeshError, MeshResult};
pub use ids::{GroupId, MessageId, NodeId};
pub use link::{LinkLayer, SimulatorHub};
pub use pipeline::{DeliveryHandle, InboundMessage, KnownDevice, MeshNode};
pub use store::{MemoryStore, SecureStore};

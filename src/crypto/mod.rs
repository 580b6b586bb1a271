//! Identity, session establishment, AEAD sealing and replay protection.

pub mod group;
pub mod identity;
pub mod replay;
pub mod session;

pub use group::GroupKey;

use crate::codec::{Reader, Writer};
use crate::config::CryptoConfig;
use crate::error::CryptoError;
use crate::ids::NodeId;
use identity::{LocalIdentity, PeerPublicKeys};
use p256::ecdsa::Signature;
use replay::ReplayTracker;
use session::SessionState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A sealed (encrypted) payload as it travels inside `Envelope::payload` when
/// `flags.encrypted` is set: ratchet counter, nonce, AEAD ciphertext+tag.
pub fn encode_sealed(counter: u64, nonce: &[u8; 12], ciphertext: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.u64(counter);
    w.bytes(nonce);
    w.bytes(ciphertext);
    w.into_vec()
}

pub fn decode_sealed(bytes: &[u8]) -> Result<(u64, [u8; 12], Vec<u8>), CryptoError> {
    let mut r = Reader::new(bytes);
    let counter = r.u64().map_err(|_| CryptoError::InvalidNonce)?;
    let nonce_slice = r.bytes(12).map_err(|_| CryptoError::InvalidNonce)?;
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(nonce_slice);
    let remaining = bytes.len().checked_sub(20).ok_or(CryptoError::InvalidNonce)?;
    let ciphertext = r.bytes(remaining).map_err(|_| CryptoError::InvalidNonce)?.to_vec();
    Ok((counter, nonce, ciphertext))
}

/// Composition root for the crypto component: long-term identity, lazily
/// established per-peer sessions, and origin-scoped replay tracking for
/// envelope sequence numbers (distinct from each session's own ratchet
/// window).
pub struct CryptoEngine {
    pub identity: LocalIdentity,
    config: CryptoConfig,
    sessions: RwLock<HashMap<NodeId, Arc<SessionState>>>,
    envelope_replay: Mutex<ReplayTracker>,
}

impl CryptoEngine {
    pub fn new(identity: LocalIdentity, config: CryptoConfig) -> Self {
        let envelope_replay = ReplayTracker::new(config.replay_window, config.replay_persist_every);
        Self {
            identity,
            config,
            sessions: RwLock::new(HashMap::new()),
            envelope_replay: Mutex::new(envelope_replay),
        }
    }

    pub fn restore(
        identity: LocalIdentity,
        config: CryptoConfig,
        envelope_high_water_marks: HashMap<NodeId, u64>,
    ) -> Self {
        let envelope_replay = ReplayTracker::restore(
            config.replay_window,
            config.replay_persist_every,
            envelope_high_water_marks,
        );
        Self {
            identity,
            config,
            sessions: RwLock::new(HashMap::new()),
            envelope_replay: Mutex::new(envelope_replay),
        }
    }

    /// Fetches the session for `peer`, establishing it lazily on first use.
    pub async fn session_for(
        &self,
        peer: PeerPublicKeys,
    ) -> Result<Arc<SessionState>, CryptoError> {
        {
            let sessions = self.sessions.read().await;
            if let Some(s) = sessions.get(&peer.node_id) {
                return Ok(s.clone());
            }
        }
        let session = Arc::new(SessionState::establish(
            &self.identity,
            peer.clone(),
            self.config.replay_window,
        )?);
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(peer.node_id)
            .or_insert(session)
            .clone())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.identity.sign(bytes)
    }

    /// Envelope-sequence replay check, scoped per origin (separate from any
    /// session's own ratchet-counter window).
    pub async fn accept_envelope_sequence(&self, origin: NodeId, sequence: u64) -> bool {
        self.envelope_replay.lock().await.accept(origin, sequence)
    }

    pub async fn envelope_replay_needs_persist(&self) -> bool {
        self.envelope_replay.lock().await.needs_persist()
    }

    pub async fn envelope_replay_snapshot(&self) -> HashMap<NodeId, u64> {
        self.envelope_replay.lock().await.snapshot()
    }

    pub async fn mark_envelope_replay_persisted(&self) {
        self.envelope_replay.lock().await.mark_persisted();
    }

    /// Wraps a group key for one member: seals `key`'s raw bytes under the
    /// pairwise session with `peer`, ready to carry as a
    /// `GroupKeyDistribute` control message's `(counter, nonce, ciphertext)`.
    pub async fn seal_group_key_for(
        &self,
        peer: PeerPublicKeys,
        key: &group::GroupKey,
    ) -> Result<(u64, [u8; 12], Vec<u8>), CryptoError> {
        let session = self.session_for(peer).await?;
        session.seal(key.as_bytes())
    }

    /// Unwraps a `GroupKeyDistribute` sent by `peer` under our pairwise
    /// session with them.
    pub async fn open_group_key_from(
        &self,
        peer: PeerPublicKeys,
        counter: u64,
        nonce: &[u8; 12],
        ciphertext: &[u8],
    ) -> Result<group::GroupKey, CryptoError> {
        let session = self.session_for(peer).await?;
        let plaintext = session.open(counter, nonce, ciphertext)?;
        let bytes: [u8; 32] = plaintext
            .try_into()
            .map_err(|_| CryptoError::DecryptFailed)?;
        Ok(group::GroupKey::from_bytes(bytes))
    }
}

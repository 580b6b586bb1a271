//! Group (broadcast) encryption: a symmetric key shared by every member of a
//! conversation, distributed pairwise (see `CryptoEngine::seal_group_key`)
//! rather than re-deriving a tree. Acceptable for the small groups this mesh
//! targets; §9's re-architecting note flags per-hop membership-aware
//! multicast as the scalable follow-up, out of scope here.

use crate::error::CryptoError;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

/// A 256-bit symmetric key shared by every member of one group conversation.
/// Generated by the group creator and handed to members via
/// `GroupKeyDistribute`; never derived from a ratchet, since every member
/// must arrive at the identical bytes.
#[derive(Clone)]
pub struct GroupKey(Zeroizing<[u8; 32]>);

impl GroupKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(Zeroizing::new(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Encrypts `plaintext` under the group key with a fresh random nonce.
/// `sender_counter` is the sending member's own monotonic counter for this
/// group (not shared ratchet state) and travels as AAD, the same way a
/// pairwise session's ratchet counter does, so the receiver's replay window
/// can reject stale or duplicate group messages per sender.
pub fn seal(key: &GroupKey, sender_counter: u64, plaintext: &[u8]) -> Result<([u8; 12], Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &sender_counter.to_be_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptFailed)?;
    Ok((nonce_bytes, ciphertext))
}

pub fn open(
    key: &GroupKey,
    sender_counter: u64,
    nonce: &[u8; 12],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &sender_counter.to_be_bytes(),
            },
        )
        .map_err(|_| CryptoError::DecryptFailed)
}

//! Long-term per-device keys: a P-256 key-agreement keypair and a P-256
//! ECDSA signing keypair. Private key material never leaves this module and
//! is zeroized on drop.

use crate::error::CryptoError;
use crate::ids::NodeId;
use p256::ecdh::SharedSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::{PublicKey as AgreementPublicKey, SecretKey as AgreementSecretKey};
use rand::rngs::OsRng;

/// A peer's long-term public material, acquired out-of-band during discovery
/// (pairing, QR code exchange, or a prior session) — never generated locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPublicKeys {
    pub node_id: NodeId,
    pub agreement: AgreementPublicKey,
    pub signing: VerifyingKey,
}

pub struct LocalIdentity {
    pub node_id: NodeId,
    agreement_secret: AgreementSecretKey,
    signing_key: SigningKey,
}

impl LocalIdentity {
    pub fn generate(node_id: NodeId) -> Self {
        Self {
            node_id,
            agreement_secret: AgreementSecretKey::random(&mut OsRng),
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn agreement_public_key(&self) -> AgreementPublicKey {
        self.agreement_secret.public_key()
    }

    pub fn signing_public_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    pub fn public_keys(&self) -> PeerPublicKeys {
        PeerPublicKeys {
            node_id: self.node_id,
            agreement: self.agreement_public_key(),
            signing: self.signing_public_key(),
        }
    }

    /// ECDH with a peer's long-term agreement key. The resulting shared
    /// secret feeds the session root-key KDF in `crypto::session`; it is
    /// never used directly as a cipher key.
    pub fn agree(&self, peer: &AgreementPublicKey) -> SharedSecret {
        // p256's ergonomic ECDH API is ephemeral-secret-shaped; diffie_hellman
        // only needs the scalar and the peer's point, so a static secret key
        // works the same way an ephemeral one would.
        p256::ecdh::diffie_hellman(
            self.agreement_secret.to_nonzero_scalar(),
            peer.as_affine(),
        )
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }
}

pub fn verify(peer_signing: &VerifyingKey, bytes: &[u8], signature: &Signature) -> Result<(), CryptoError> {
    peer_signing
        .verify(bytes, signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_agrees_on_both_sides() {
        let a = LocalIdentity::generate(NodeId::new_random());
        let b = LocalIdentity::generate(NodeId::new_random());
        let shared_a = a.agree(&b.agreement_public_key());
        let shared_b = b.agree(&a.agreement_public_key());
        assert_eq!(shared_a.raw_secret_bytes(), shared_b.raw_secret_bytes());
    }

    #[test]
    fn signature_round_trips() {
        let a = LocalIdentity::generate(NodeId::new_random());
        let msg = b"envelope header bytes";
        let sig = a.sign(msg);
        assert!(verify(&a.signing_public_key(), msg, &sig).is_ok());
    }

    #[test]
    fn signature_rejected_under_wrong_key() {
        let a = LocalIdentity::generate(NodeId::new_random());
        let b = LocalIdentity::generate(NodeId::new_random());
        let msg = b"envelope header bytes";
        let sig = a.sign(msg);
        assert!(verify(&b.signing_public_key(), msg, &sig).is_err());
    }
}

//! Crate-wide error taxonomy.
//!
//! Component-internal operations return their own small error enum
//! (`DecodeError`, `CryptoError`, `RoutingError`); `MeshError` wraps them at
//! the pipeline boundary so call sites that don't need to match on a specific
//! variant can use `anyhow::Result` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("buffer truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("envelope exceeds maximum size: {size} > {max}")]
    TooLarge { size: usize, max: usize },
    #[error("unknown control message discriminant: {0:#04x}")]
    UnknownDiscriminant(u8),
    #[error("malformed field: {0}")]
    Malformed(&'static str),
    #[error("trailing bytes after decode")]
    TrailingBytes,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no session established with peer")]
    NoSession,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("key derivation failed")]
    KdfFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed (bad tag or replay)")]
    DecryptFailed,
    #[error("nonce invalid or reused")]
    InvalidNonce,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("no local signing key available")]
    NoSigningKey,
    #[error("ratchet counter {counter} outside receive window (floor {floor})")]
    CounterOutsideWindow { counter: u64, floor: u64 },
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no route to destination")]
    NoRoute,
    #[error("route discovery timed out")]
    DiscoveryTimeout,
    #[error("destination unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("codec error: {0}")]
    Codec(#[from] DecodeError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("link layer rejected send to {peer}")]
    LinkSendFailed { peer: String },
    #[error("secure store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("offline queue full for destination {0}")]
    QueueFull(String),
}

pub type MeshResult<T> = std::result::Result<T, MeshError>;

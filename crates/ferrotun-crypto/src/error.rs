//! Error taxonomy of the cryptographic core.
//!
//! Only `Entropy` escalates to the caller as a real failure; everything else
//! is contained to the handshake attempt or packet that triggered it, and is
//! never reflected back to the peer.

use ferrotun_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Random source failed; the requesting operation may be retried.
    #[error("entropy source unavailable: {0}")]
    Entropy(String),

    /// Diffie-Hellman produced the all-zero point.
    #[error("invalid curve point")]
    InvalidCurvePoint,

    /// AEAD tag or MAC did not verify during a handshake.
    #[error("handshake authentication failed")]
    HandshakeAuth,

    /// Stale, duplicated or flooding initiation; also replayed transport counters.
    #[error("replayed message")]
    Replay,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Keypair is past its reject-after limits.
    #[error("keypair expired")]
    RekeyExpired,

    /// Transport packet failed AEAD authentication.
    #[error("packet authentication failed")]
    PacketAuth,

    #[error("encryption failed")]
    Encryption,

    #[error("no current keypair")]
    NoCurrentKeypair,

    /// Receiver index does not name a live handshake or keypair.
    #[error("unknown receiver index {0}")]
    UnknownIndex(u32),

    /// Responder is under load and the message carried no valid mac2.
    #[error("cookie required")]
    CookieRequired,

    /// Message does not belong to the attempt in flight.
    #[error("invalid handshake state: {0}")]
    InvalidState(&'static str),
}

impl From<CoreError> for CryptoError {
    fn from(err: CoreError) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}

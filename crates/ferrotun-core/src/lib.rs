//! Core ferrotun protocol types, framing, and constants.
//!
//! This crate provides:
//! - Bit-exact layouts for the four tunnel messages (initiation, response,
//!   cookie reply, transport data)
//! - TAI64N timestamps carried inside handshake initiations
//! - The rekey / reject policy shared by the crypto and device layers
//!
//! Nothing here touches key material; the crypto crate fills the encrypted
//! fields and the MAC trailers.

#![forbid(unsafe_code)]

pub mod messages;
pub mod policy;
pub mod timestamp;

pub use messages::{
    message_type, CookieReply, Initiation, MessageType, Response, TransportHeader,
};
pub use policy::RekeyConfig;
pub use timestamp::Timestamp;

use thiserror::Error;

/// Curve25519 keys, chain keys and symmetric keys are all 32 bytes.
pub const KEY_LEN: usize = 32;

/// Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// MAC1 / MAC2 trailer width (keyed BLAKE2s-128).
pub const MAC_LEN: usize = 16;

/// TAI64N timestamp width.
pub const TIMESTAMP_LEN: usize = 12;

/// XChaCha20 nonce width used by cookie replies.
pub const COOKIE_NONCE_LEN: usize = 24;

/// Cookie width (keyed BLAKE2s-128).
pub const COOKIE_LEN: usize = 16;

/// Default MTU of the tunnel interface.
pub const DEFAULT_MTU: i32 = 1420;

/// Largest message that fits a single UDP datagram.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Transport overhead: 16 bytes of header plus the AEAD tag.
pub const MESSAGE_TRANSPORT_SIZE: usize = TransportHeader::SIZE + TAG_LEN;

/// Largest plaintext that can be tunneled in one transport message.
pub const MAX_CONTENT_SIZE: usize = MAX_MESSAGE_SIZE - MESSAGE_TRANSPORT_SIZE;

/// Plaintext is padded to a multiple of this many bytes before sealing.
pub const PADDING_MULTIPLE: usize = 16;

/// Wire decoding errors.
///
/// These never travel back to the peer; a malformed datagram is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("message too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("invalid message length: {0} bytes, expected {1}")]
    InvalidLength(usize, usize),

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("unexpected message type: {found}, expected {expected}")]
    UnexpectedType { found: u8, expected: u8 },

    #[error("reserved header bytes are not zero")]
    ReservedBits,

    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

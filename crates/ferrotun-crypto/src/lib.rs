//! Cryptographic core for ferrotun.
//!
//! This crate provides:
//! - HMAC-BLAKE2s key derivation chains and constant-time helpers
//! - Curve25519 keys with clamping and all-zero DH rejection
//! - The `Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s` handshake engine
//! - MAC trailers and the stateless cookie challenge
//! - Transport keypairs with atomic counters and a replay window
//! - Per-peer keypair rotation (current / next / previous)
//!
//! # Design
//!
//! Secrets are held in types that zero themselves on drop, and the handshake
//! only writes intermediate chain values back to its state after a step has
//! fully succeeded. Failures are contained to the attempt or packet that
//! caused them; none of them is ever answered on the wire.

#![forbid(unsafe_code)]

pub mod cookie;
pub mod error;
pub mod handshake;
pub mod kdf;
pub mod keypair;
pub mod keys;
pub mod replay;
pub mod session;

pub use cookie::{CookieChecker, CookieGenerator};
pub use error::CryptoError;
pub use handshake::{open_initiation, Handshake, HandshakeState, OpenedInitiation, Role};
pub use keypair::Keypair;
pub use keys::{Identity, PrivateKey, PublicKey, SharedSecret};
pub use replay::ReplayWindow;
pub use session::KeypairSet;

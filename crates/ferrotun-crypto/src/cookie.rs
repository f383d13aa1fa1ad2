//! MAC trailers and the cookie challenge.
//!
//! Every handshake message ends in `mac1 || mac2`. `mac1` is keyed by the
//! receiver's static public key and lets the receiver drop garbage before
//! doing any DH. `mac2` is keyed by a cookie the receiver handed out
//! earlier; a responder under load insists on it before allocating any
//! per-attempt state.
//!
//! The cookie itself is a keyed MAC of the sender's address under a secret
//! that rotates every `cookie_refresh_time`, so the responder stores nothing
//! per initiator.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use ferrotun_core::{CookieReply, COOKIE_LEN, COOKIE_NONCE_LEN, KEY_LEN, MAC_LEN, TAG_LEN};

use crate::error::CryptoError;
use crate::kdf::{ct_eq, hash, mac128, SecretBytes};
use crate::keys::PublicKey;

const LABEL_MAC1: &[u8] = b"mac1----";
const LABEL_COOKIE: &[u8] = b"cookie--";

/// Byte range covered by mac1 (everything before the two MAC fields).
fn mac1_body(msg: &[u8]) -> Result<&[u8], CryptoError> {
    msg.len()
        .checked_sub(2 * MAC_LEN)
        .map(|end| &msg[..end])
        .ok_or_else(|| CryptoError::MalformedMessage("message shorter than MACs".into()))
}

/// Byte range covered by mac2 (everything up to and including mac1).
fn mac2_body(msg: &[u8]) -> Result<&[u8], CryptoError> {
    msg.len()
        .checked_sub(MAC_LEN)
        .map(|end| &msg[..end])
        .ok_or_else(|| CryptoError::MalformedMessage("message shorter than MACs".into()))
}

fn mac1_field(msg: &[u8]) -> [u8; MAC_LEN] {
    let start = msg.len() - 2 * MAC_LEN;
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&msg[start..start + MAC_LEN]);
    out
}

fn mac2_field(msg: &[u8]) -> &[u8] {
    &msg[msg.len() - MAC_LEN..]
}

/// IP octets followed by the big-endian port.
pub fn address_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut out = match addr {
        SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
        SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
    };
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Responder side: validates MACs and issues cookie replies.
pub struct CookieChecker {
    mac1_key: [u8; KEY_LEN],
    encryption_key: SecretBytes,
    secret: SecretBytes,
    secret_set: Option<Instant>,
    refresh: Duration,
}

impl CookieChecker {
    pub fn new(local_static: &PublicKey, refresh: Duration) -> Self {
        Self {
            mac1_key: hash(&[LABEL_MAC1, local_static.as_bytes()]),
            encryption_key: Zeroizing::new(hash(&[LABEL_COOKIE, local_static.as_bytes()])),
            secret: Zeroizing::new([0u8; KEY_LEN]),
            secret_set: None,
            refresh,
        }
    }

    /// True if `msg` carries a valid mac1 for the local identity.
    pub fn check_mac1(&self, msg: &[u8]) -> bool {
        let Ok(body) = mac1_body(msg) else {
            return false;
        };
        let expected = mac128(&self.mac1_key, &[body]);
        ct_eq(&expected, &mac1_field(msg))
    }

    /// True if `msg` carries a mac2 made with the cookie for `src`.
    ///
    /// A cookie issued under a rotated-out secret no longer verifies.
    pub fn check_mac2(
        &mut self,
        msg: &[u8],
        src: &SocketAddr,
        now: Instant,
    ) -> Result<bool, CryptoError> {
        let Ok(body) = mac2_body(msg) else {
            return Ok(false);
        };
        let cookie = self.cookie_for(src, now)?;
        let expected = mac128(&cookie[..], &[body]);
        Ok(ct_eq(&expected, mac2_field(msg)))
    }

    /// Answer `msg` from `src` with an encrypted cookie.
    pub fn create_reply(
        &mut self,
        msg: &[u8],
        receiver: u32,
        src: &SocketAddr,
        now: Instant,
    ) -> Result<CookieReply, CryptoError> {
        mac1_body(msg)?;
        let cookie = self.cookie_for(src, now)?;

        let mut nonce = [0u8; COOKIE_NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;

        let cipher = XChaCha20Poly1305::new((&*self.encryption_key).into());
        let mac1 = mac1_field(msg);
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &cookie[..],
                    aad: &mac1,
                },
            )
            .map_err(|_| CryptoError::Encryption)?;
        let encrypted_cookie: [u8; COOKIE_LEN + TAG_LEN] = sealed
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Encryption)?;

        debug!("issuing cookie reply to index {}", receiver);
        Ok(CookieReply {
            receiver,
            nonce,
            encrypted_cookie,
        })
    }

    fn cookie_for(
        &mut self,
        src: &SocketAddr,
        now: Instant,
    ) -> Result<Zeroizing<[u8; COOKIE_LEN]>, CryptoError> {
        let stale = self
            .secret_set
            .map_or(true, |set| now.saturating_duration_since(set) >= self.refresh);
        if stale {
            OsRng
                .try_fill_bytes(&mut self.secret[..])
                .map_err(|e| CryptoError::Entropy(e.to_string()))?;
            self.secret_set = Some(now);
        }
        Ok(Zeroizing::new(mac128(
            &self.secret[..],
            &[&address_bytes(src)],
        )))
    }
}

/// Initiator side: stamps outgoing MACs and stores received cookies.
pub struct CookieGenerator {
    mac1_key: [u8; KEY_LEN],
    decryption_key: SecretBytes,
    last_mac1: Option<[u8; MAC_LEN]>,
    cookie: Option<(Zeroizing<[u8; COOKIE_LEN]>, Instant)>,
    refresh: Duration,
}

impl CookieGenerator {
    pub fn new(remote_static: &PublicKey, refresh: Duration) -> Self {
        Self {
            mac1_key: hash(&[LABEL_MAC1, remote_static.as_bytes()]),
            decryption_key: Zeroizing::new(hash(&[LABEL_COOKIE, remote_static.as_bytes()])),
            last_mac1: None,
            cookie: None,
            refresh,
        }
    }

    /// Write mac1 and, when a fresh cookie is held, mac2 into an encoded
    /// handshake message.
    pub fn stamp(&mut self, msg: &mut [u8], now: Instant) -> Result<(), CryptoError> {
        let body_len = mac1_body(msg)?.len();

        let mac1 = mac128(&self.mac1_key, &[&msg[..body_len]]);
        msg[body_len..body_len + MAC_LEN].copy_from_slice(&mac1);
        self.last_mac1 = Some(mac1);

        let mac2 = match &self.cookie {
            Some((cookie, received)) if now.saturating_duration_since(*received) < self.refresh => {
                mac128(&cookie[..], &[&msg[..body_len + MAC_LEN]])
            }
            _ => [0u8; MAC_LEN],
        };
        msg[body_len + MAC_LEN..].copy_from_slice(&mac2);
        Ok(())
    }

    /// Accept a cookie reply for the last message we stamped.
    pub fn consume_reply(&mut self, reply: &CookieReply, now: Instant) -> Result<(), CryptoError> {
        let Some(mac1) = self.last_mac1 else {
            return Err(CryptoError::InvalidState("no message awaiting a cookie"));
        };

        let cipher = XChaCha20Poly1305::new((&*self.decryption_key).into());
        let plain = cipher
            .decrypt(
                XNonce::from_slice(&reply.nonce),
                Payload {
                    msg: &reply.encrypted_cookie,
                    aad: &mac1,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::HandshakeAuth)?;

        let mut cookie = Zeroizing::new([0u8; COOKIE_LEN]);
        if plain.len() != COOKIE_LEN {
            return Err(CryptoError::HandshakeAuth);
        }
        cookie.copy_from_slice(&plain);
        self.cookie = Some((cookie, now));
        debug!("stored cookie for index {}", reply.receiver);
        Ok(())
    }

    pub fn has_fresh_cookie(&self, now: Instant) -> bool {
        self.cookie
            .as_ref()
            .is_some_and(|(_, received)| now.saturating_duration_since(*received) < self.refresh)
    }
}

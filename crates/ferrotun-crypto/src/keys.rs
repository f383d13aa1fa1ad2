//! Curve25519 key material.
//!
//! Private keys and shared secrets zero themselves on drop. A shared secret
//! is only handed out after the all-zero check, so callers never see the
//! point at infinity as key material.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use ferrotun_core::KEY_LEN;

use crate::error::CryptoError;
use crate::kdf::is_zero;

/// Clamped X25519 scalar.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    /// Draw a fresh scalar from the OS CSPRNG and clamp it.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = Self([0u8; KEY_LEN]);
        OsRng
            .try_fill_bytes(&mut key.0)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        key.clamp();
        Ok(key)
    }

    /// Import raw scalar bytes, clamping them.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let mut key = Self(bytes);
        key.clamp();
        key
    }

    /// Placeholder for a slot that holds no key; reads as wiped.
    pub(crate) fn zeroed() -> Self {
        Self([0u8; KEY_LEN])
    }

    // https://cr.yp.to/ecdh.html
    fn clamp(&mut self) {
        self.0[0] &= 248;
        self.0[31] &= 127;
        self.0[31] |= 64;
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// A wiped key reads as all zeros.
    pub fn is_zero(&self) -> bool {
        is_zero(&self.0)
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// X25519 with the remote point. An all-zero result is refused.
    pub fn shared_secret(&self, remote: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let secret = StaticSecret::from(self.0);
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(remote.0));
        let out = SharedSecret(*shared.as_bytes());
        if out.is_zero() {
            return Err(CryptoError::InvalidCurvePoint);
        }
        Ok(out)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// X25519 public point.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; KEY_LEN] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        is_zero(&self.0)
    }

    /// Parse a hex-encoded key (64 characters).
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut out = [0u8; KEY_LEN];
        hex::decode_to_slice(s.trim(), &mut out)
            .map_err(|e| CryptoError::MalformedMessage(format!("public key: {}", e)))?;
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; KEY_LEN]> for PublicKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = CryptoError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::MalformedMessage(format!("public key of {} bytes", bytes.len()))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &self.to_hex()[..8])
    }
}

/// X25519 output; scoped to the derivation step that consumes it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        is_zero(&self.0)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Long-term static keypair of the local device.
pub struct Identity {
    private: PrivateKey,
    public: PublicKey,
}

impl Identity {
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::from_private(PrivateKey::generate()?))
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("public", &self.public).finish()
    }
}

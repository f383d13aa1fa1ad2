//! HMAC-based key derivation over BLAKE2s.
//!
//! The chains follow HKDF (RFC 5869): extract a pseudorandom key with one
//! HMAC, then expand it into one, two or three 32-byte outputs where each
//! output feeds the next. The extracted key never leaves this module and
//! is wiped before returning.

use blake2::digest::consts::U16;
use blake2::{Blake2s256, Blake2sMac, Digest};
use hmac::{Mac, SimpleHmac};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use ferrotun_core::{KEY_LEN, MAC_LEN};

type HmacBlake2s = SimpleHmac<Blake2s256>;

/// A 32-byte secret that is wiped when dropped.
pub type SecretBytes = Zeroizing<[u8; KEY_LEN]>;

/// HMAC-BLAKE2s keyed by `key` over the concatenation of `parts`.
pub fn derive_mac(key: &[u8], parts: &[&[u8]]) -> SecretBytes {
    let Ok(mut mac) = HmacBlake2s::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    for part in parts {
        mac.update(part);
    }
    Zeroizing::new(mac.finalize().into_bytes().into())
}

pub fn kdf1(key: &[u8], input: &[u8]) -> SecretBytes {
    let prk = derive_mac(key, &[input]);
    derive_mac(&prk[..], &[&[0x1]])
}

pub fn kdf2(key: &[u8], input: &[u8]) -> (SecretBytes, SecretBytes) {
    let prk = derive_mac(key, &[input]);
    let t0 = derive_mac(&prk[..], &[&[0x1]]);
    let t1 = derive_mac(&prk[..], &[&t0[..], &[0x2]]);
    (t0, t1)
}

pub fn kdf3(key: &[u8], input: &[u8]) -> (SecretBytes, SecretBytes, SecretBytes) {
    let prk = derive_mac(key, &[input]);
    let t0 = derive_mac(&prk[..], &[&[0x1]]);
    let t1 = derive_mac(&prk[..], &[&t0[..], &[0x2]]);
    let t2 = derive_mac(&prk[..], &[&t1[..], &[0x3]]);
    (t0, t1, t2)
}

/// BLAKE2s-256 over the concatenation of `parts`.
///
/// Only used for the handshake transcript and for deriving the static
/// MAC/cookie keys, never for session key material.
pub fn hash(parts: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `h = HASH(h || data)`
pub fn mix_hash(h: &mut [u8; KEY_LEN], data: &[u8]) {
    *h = hash(&[&h[..], data]);
}

/// Keyed BLAKE2s with a 128-bit output, used for MAC1, MAC2 and cookies.
pub fn mac128(key: &[u8], parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let Ok(mut mac) = Blake2sMac::<U16>::new_from_slice(key) else {
        unreachable!("MAC keys are at most 32 bytes");
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// True iff every byte is zero.
///
/// Accumulates with OR over the whole input and compares once at the end,
/// so the running time does not depend on where a nonzero byte sits.
pub fn is_zero(bytes: &[u8]) -> bool {
    let acc = bytes.iter().fold(0u8, |acc, b| acc | b);
    acc.ct_eq(&0u8).into()
}

/// Constant-time equality for MACs and tags.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Overwrite every byte with zero.
pub fn wipe(bytes: &mut [u8]) {
    bytes.zeroize();
}

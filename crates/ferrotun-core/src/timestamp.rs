//! TAI64N timestamps.
//!
//! The initiation carries the sender's wall clock as TAI64N: 8 bytes of
//! big-endian seconds offset by 2^62 (plus the 10 s TAI/UTC base offset),
//! then 4 bytes of big-endian nanoseconds. Big-endian encoding makes byte
//! order and chronological order agree, which is all the responder needs
//! to reject stale or duplicated initiations.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::TIMESTAMP_LEN;

const TAI64_BASE: u64 = (1u64 << 62) + 10;

/// A TAI64N label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp([u8; TIMESTAMP_LEN]);

impl Timestamp {
    /// The zero timestamp; every real timestamp is after it.
    pub const ZERO: Self = Self([0u8; TIMESTAMP_LEN]);

    /// Current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_unix(since_epoch.as_secs(), since_epoch.subsec_nanos())
    }

    pub fn from_unix(secs: u64, nanos: u32) -> Self {
        let mut out = [0u8; TIMESTAMP_LEN];
        out[..8].copy_from_slice(&(TAI64_BASE + secs).to_be_bytes());
        out[8..].copy_from_slice(&nanos.to_be_bytes());
        Self(out)
    }

    pub fn from_bytes(bytes: [u8; TIMESTAMP_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TIMESTAMP_LEN] {
        &self.0
    }

    /// Strictly later than `other`.
    pub fn is_after(&self, other: &Timestamp) -> bool {
        self > other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_follows_time() {
        let early = Timestamp::from_unix(1_700_000_000, 999_999_999);
        let late = Timestamp::from_unix(1_700_000_001, 0);
        assert!(late.is_after(&early));
        assert!(!early.is_after(&late));
        assert!(!late.is_after(&late));
    }

    #[test]
    fn test_nanos_break_ties() {
        let a = Timestamp::from_unix(5, 1);
        let b = Timestamp::from_unix(5, 2);
        assert!(b.is_after(&a));
    }

    #[test]
    fn test_encoding() {
        let ts = Timestamp::from_unix(0, 0x0102_0304);
        assert_eq!(&ts.as_bytes()[..8], &TAI64_BASE.to_be_bytes());
        assert_eq!(&ts.as_bytes()[8..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_now_is_after_zero() {
        assert!(Timestamp::now().is_after(&Timestamp::ZERO));
    }
}

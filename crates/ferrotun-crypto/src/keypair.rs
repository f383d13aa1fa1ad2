//! Directional transport keys produced by one completed handshake.
//!
//! Outbound packets use the send key with the atomically allocated counter
//! as nonce; inbound packets are checked against the replay window after
//! the AEAD verifies. Both keys can be wiped eagerly while other threads
//! still hold the `Arc`; later use then fails with `RekeyExpired`.
//!
//! # Wire Format
//!
//! ```text
//! [4 bytes: type] [4 bytes: receiver index] [8 bytes: counter LE] [ciphertext + 16-byte tag]
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use bytes::{BufMut, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use ferrotun_core::{RekeyConfig, TransportHeader, KEY_LEN, TAG_LEN};

use crate::error::CryptoError;
use crate::kdf::SecretBytes;
use crate::replay::ReplayWindow;

#[derive(Zeroize, ZeroizeOnDrop)]
struct TransportKeys {
    send: [u8; KEY_LEN],
    receive: [u8; KEY_LEN],
}

/// One session's pair of directional keys plus their counters.
pub struct Keypair {
    keys: RwLock<Option<TransportKeys>>,
    send_counter: AtomicU64,
    replay: Mutex<ReplayWindow>,
    created: Instant,
    is_initiator: bool,
    local_index: u32,
    remote_index: u32,
}

impl Keypair {
    pub fn new(
        send: SecretBytes,
        receive: SecretBytes,
        is_initiator: bool,
        local_index: u32,
        remote_index: u32,
        reject_after_messages: u64,
        created: Instant,
    ) -> Self {
        Self {
            keys: RwLock::new(Some(TransportKeys {
                send: *send,
                receive: *receive,
            })),
            send_counter: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new(reject_after_messages)),
            created,
            is_initiator,
            local_index,
            remote_index,
        }
    }

    /// Encrypt `plaintext` into a complete transport message.
    ///
    /// Each call consumes one counter value; counters are never reused,
    /// even by concurrent senders.
    pub fn seal(
        &self,
        plaintext: &[u8],
        policy: &RekeyConfig,
        now: Instant,
    ) -> Result<BytesMut, CryptoError> {
        if self.age(now) >= policy.reject_after_time() {
            return Err(CryptoError::RekeyExpired);
        }

        let limit = policy.reject_after_messages;
        let counter = self
            .send_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < limit).then_some(c + 1)
            })
            .map_err(|_| CryptoError::RekeyExpired)?;

        let guard = match self.keys.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let keys = guard.as_ref().ok_or(CryptoError::RekeyExpired)?;

        let ciphertext = ChaCha20Poly1305::new((&keys.send).into())
            .encrypt(&counter_to_nonce(counter), plaintext)
            .map_err(|_| CryptoError::Encryption)?;
        drop(guard);

        let header = TransportHeader {
            receiver: self.remote_index,
            counter,
        };
        let mut message = header.encode(ciphertext.len());
        message.put_slice(&ciphertext);
        Ok(message)
    }

    /// Decrypt the ciphertext of a transport message addressed to this keypair.
    pub fn open(
        &self,
        counter: u64,
        ciphertext: &[u8],
        policy: &RekeyConfig,
        now: Instant,
    ) -> Result<Vec<u8>, CryptoError> {
        if self.age(now) >= policy.reject_after_time() {
            return Err(CryptoError::RekeyExpired);
        }
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::MalformedMessage("ciphertext too short".into()));
        }

        // Fail fast before spending an AEAD on a replay
        if !self.lock_replay().check(counter) {
            return Err(CryptoError::Replay);
        }

        let plaintext = {
            let guard = match self.keys.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let keys = guard.as_ref().ok_or(CryptoError::RekeyExpired)?;
            ChaCha20Poly1305::new((&keys.receive).into())
                .decrypt(&counter_to_nonce(counter), ciphertext)
                .map_err(|_| CryptoError::PacketAuth)?
        };

        // Only record after authentication so forged counters cannot
        // advance the window
        if !self.lock_replay().check_and_update(counter) {
            return Err(CryptoError::Replay);
        }

        Ok(plaintext)
    }

    fn lock_replay(&self) -> std::sync::MutexGuard<'_, ReplayWindow> {
        match self.replay.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Send counter has crossed the rekey threshold, or this side initiated
    /// the handshake and the keypair has aged past it.
    ///
    /// Only the initiator rekeys by time so both ends do not race to
    /// replace the same keypair.
    pub fn needs_rekey(&self, policy: &RekeyConfig, now: Instant) -> bool {
        self.send_counter() >= policy.rekey_after_messages
            || (self.is_initiator && self.age(now) >= policy.rekey_after_time())
    }

    /// Past reject-after limits, or already wiped.
    pub fn is_expired(&self, policy: &RekeyConfig, now: Instant) -> bool {
        self.send_counter() >= policy.reject_after_messages
            || self.age(now) >= policy.reject_after_time()
            || self.is_wiped()
    }

    /// Zero both keys now. Outstanding handles can no longer seal or open.
    pub fn wipe(&self) {
        let mut guard = match self.keys.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // TransportKeys zeroes itself on drop
        guard.take();
    }

    pub fn is_wiped(&self) -> bool {
        let guard = match self.keys.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.is_none()
    }

    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.created)
    }

    /// Next counter value to be allocated.
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Acquire)
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("is_initiator", &self.is_initiator)
            .field("send_counter", &self.send_counter())
            .finish()
    }
}

/// Convert a counter to the 12-byte ChaCha20-Poly1305 nonce.
fn counter_to_nonce(counter: u64) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(nonce_bytes)
}

//! Per-peer keypair rotation.
//!
//! A peer holds at most three keypairs:
//! - `next`: installed by a handshake, not yet confirmed by the peer
//! - `current`: the only keypair used to encrypt outbound packets
//! - `previous`: kept for stragglers still in flight under the old keys
//!
//! Readers take a short read lock and clone the `Arc`, so the packet path
//! always sees a consistent keypair. Every keypair that leaves the set is
//! wiped immediately and its local index is returned to the caller, which
//! owns the index table.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tracing::debug;

use ferrotun_core::RekeyConfig;

use crate::keypair::Keypair;

#[derive(Default)]
struct Slots {
    previous: Option<Arc<Keypair>>,
    current: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

/// Current / next / previous keypairs of one peer.
#[derive(Default)]
pub struct KeypairSet {
    slots: RwLock<Slots>,
}

fn retire(keypair: Arc<Keypair>, retired: &mut Vec<u32>) {
    keypair.wipe();
    retired.push(keypair.local_index());
}

impl KeypairSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Slots> {
        match self.slots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots> {
        match self.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Snapshot of the keypair used for encryption.
    pub fn current(&self) -> Option<Arc<Keypair>> {
        self.read().current.clone()
    }

    pub fn next(&self) -> Option<Arc<Keypair>> {
        self.read().next.clone()
    }

    pub fn previous(&self) -> Option<Arc<Keypair>> {
        self.read().previous.clone()
    }

    /// Install a freshly negotiated keypair.
    ///
    /// Goes to `next` while a valid `current` exists, otherwise straight to
    /// `current`. Returns the local indices of keypairs that were discarded.
    pub fn install(&self, keypair: Arc<Keypair>, policy: &RekeyConfig, now: Instant) -> Vec<u32> {
        let mut retired = Vec::new();
        let mut slots = self.write();

        let current_valid = slots
            .current
            .as_ref()
            .is_some_and(|current| !current.is_expired(policy, now));

        if current_valid {
            debug!("installing keypair {} as next", keypair.local_index());
            if let Some(stale) = slots.next.replace(keypair) {
                retire(stale, &mut retired);
            }
        } else {
            debug!("installing keypair {} as current", keypair.local_index());
            if let Some(expired) = slots.current.replace(keypair) {
                retire(expired, &mut retired);
            }
            if let Some(stale) = slots.next.take() {
                retire(stale, &mut retired);
            }
        }

        retired
    }

    /// The peer proved it holds `keypair`: promote it if it is `next`.
    ///
    /// The old current becomes previous and the old previous is wiped.
    pub fn confirm(&self, keypair: &Arc<Keypair>) -> Vec<u32> {
        let mut retired = Vec::new();

        {
            let slots = self.read();
            let is_next = slots
                .next
                .as_ref()
                .is_some_and(|next| Arc::ptr_eq(next, keypair));
            if !is_next {
                return retired;
            }
        }

        let mut slots = self.write();
        // Re-check under the write lock; a concurrent install may have won
        let Some(next) = slots.next.take_if(|next| Arc::ptr_eq(next, keypair)) else {
            return retired;
        };
        debug!("promoting keypair {} to current", next.local_index());
        if let Some(oldest) = slots.previous.take() {
            retire(oldest, &mut retired);
        }
        slots.previous = slots.current.replace(next);
        retired
    }

    /// Wipe every keypair past its reject-after limits.
    pub fn expire(&self, policy: &RekeyConfig, now: Instant) -> Vec<u32> {
        let mut retired = Vec::new();
        let mut guard = self.write();
        let slots = &mut *guard;

        for slot in [&mut slots.previous, &mut slots.current, &mut slots.next] {
            if let Some(expired) = slot.take_if(|kp| kp.is_expired(policy, now)) {
                debug!("keypair {} expired", expired.local_index());
                retire(expired, &mut retired);
            }
        }

        retired
    }

    /// Wipe and drop everything.
    pub fn clear(&self) -> Vec<u32> {
        let mut retired = Vec::new();
        let mut guard = self.write();
        let slots = &mut *guard;

        for slot in [&mut slots.previous, &mut slots.current, &mut slots.next] {
            if let Some(keypair) = slot.take() {
                retire(keypair, &mut retired);
            }
        }

        retired
    }

    pub fn is_empty(&self) -> bool {
        let slots = self.read();
        slots.previous.is_none() && slots.current.is_none() && slots.next.is_none()
    }
}

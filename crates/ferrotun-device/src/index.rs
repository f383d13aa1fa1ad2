//! Receiver index table.
//!
//! Every handshake attempt and every installed keypair is known to the
//! remote side by a random 32-bit index. Incoming responses, cookie
//! replies and transport packets are routed by looking that index up here.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ferrotun_crypto::{Keypair, PublicKey};
use rand::Rng;

use crate::lock;

#[derive(Clone)]
pub enum IndexEntry {
    /// An initiation or response is in flight under this index.
    Handshake { peer: PublicKey },
    /// A completed session.
    Keypair {
        peer: PublicKey,
        keypair: Arc<Keypair>,
    },
}

impl IndexEntry {
    pub fn peer(&self) -> &PublicKey {
        match self {
            Self::Handshake { peer } | Self::Keypair { peer, .. } => peer,
        }
    }
}

#[derive(Default)]
pub struct IndexTable {
    entries: Mutex<HashMap<u32, IndexEntry>>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh nonzero index for a handshake with `peer`.
    pub fn allocate_handshake(&self, peer: PublicKey) -> u32 {
        let mut entries = lock(&self.entries);
        let mut rng = rand::thread_rng();
        loop {
            let index: u32 = rng.gen();
            if index == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = entries.entry(index) {
                slot.insert(IndexEntry::Handshake { peer });
                return index;
            }
        }
    }

    /// Point the keypair's local index at the keypair, replacing the
    /// handshake entry that negotiated it.
    pub fn install_keypair(&self, keypair: &Arc<Keypair>, peer: PublicKey) {
        lock(&self.entries).insert(
            keypair.local_index(),
            IndexEntry::Keypair {
                peer,
                keypair: Arc::clone(keypair),
            },
        );
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry> {
        lock(&self.entries).get(&index).cloned()
    }

    pub fn remove(&self, index: u32) -> Option<IndexEntry> {
        lock(&self.entries).remove(&index)
    }

    /// Remove `index` only while it still names a handshake.
    pub fn remove_handshake(&self, index: u32) -> bool {
        let mut entries = lock(&self.entries);
        if matches!(entries.get(&index), Some(IndexEntry::Handshake { .. })) {
            entries.remove(&index);
            true
        } else {
            false
        }
    }

    /// Drop every index owned by `peer`.
    pub fn remove_peer(&self, peer: &PublicKey) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.peer() != peer);
        before - entries.len()
    }

    /// Handshake attempts currently holding an index.
    pub fn pending_handshakes(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|entry| matches!(entry, IndexEntry::Handshake { .. }))
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

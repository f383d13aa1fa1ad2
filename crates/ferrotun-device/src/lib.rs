//! Device layer for ferrotun.
//!
//! This crate provides:
//! - The network-interface capability set ([`Tun`]) and an in-memory backend
//! - The UDP transport binding that follows the interface's up/down state
//! - The link-state reactor consuming interface events
//! - Per-peer handshake/keypair glue, the index table and timer sweep
//!
//! The packet and control paths share per-peer state; everything is
//! reached through `&self` and guarded by short-held locks or atomics.

#![forbid(unsafe_code)]

pub mod device;
pub mod error;
pub mod index;
pub mod link;
pub mod load;
pub mod memory;
pub mod peer;
pub mod transport;
pub mod tun;

pub use device::{Device, Outcome};
pub use error::DeviceError;
pub use index::{IndexEntry, IndexTable};
pub use link::{run_event_reader, LinkState};
pub use load::HandshakeLoad;
pub use memory::MemoryTun;
pub use peer::{Peer, TimerAction};
pub use transport::UdpBinding;
pub use tun::{Tun, TunEvent};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

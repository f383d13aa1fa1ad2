//! Link-state reactor.
//!
//! Interface events drive two flags that the packet path reads without
//! locking: the tracked MTU and whether the link is up. Coming up binds the
//! UDP transport, going down drops it. Duplicate events are no-ops because
//! both transitions are compare-and-swap.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use ferrotun_core::{MAX_MESSAGE_SIZE, MESSAGE_TRANSPORT_SIZE};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};

use crate::transport::UdpBinding;
use crate::tun::{Tun, TunEvent};

pub struct LinkState {
    mtu: AtomicI32,
    up: AtomicBool,
}

impl LinkState {
    pub fn new(mtu: i32) -> Self {
        Self {
            mtu: AtomicI32::new(mtu),
            up: AtomicBool::new(false),
        }
    }

    pub fn mtu(&self) -> i32 {
        self.mtu.load(Ordering::Acquire)
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Store a new MTU, returning the previous one.
    pub fn swap_mtu(&self, mtu: i32) -> i32 {
        self.mtu.swap(mtu, Ordering::AcqRel)
    }

    /// Down -> up. False if already up.
    pub fn mark_up(&self) -> bool {
        self.up
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Up -> down. False if already down.
    pub fn mark_down(&self) -> bool {
        self.up
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// True if a full-MTU packet would not fit in one transport message.
pub fn mtu_too_large(mtu: i32) -> bool {
    i64::from(mtu) + MESSAGE_TRANSPORT_SIZE as i64 > MAX_MESSAGE_SIZE as i64
}

fn update_mtu(tun: &dyn Tun, link: &LinkState) {
    let mtu = match tun.mtu() {
        Ok(mtu) => mtu,
        Err(e) => {
            error!("Failed to load updated MTU of device: {}", e);
            return;
        }
    };

    let old = link.swap_mtu(mtu);
    if old != mtu {
        if mtu_too_large(mtu) {
            info!("MTU updated: {} (too large)", mtu);
        } else {
            info!("MTU updated: {}", mtu);
        }
    }
}

/// Consume interface events until the interface closes the channel.
pub async fn run_event_reader(
    mut events: UnboundedReceiver<TunEvent>,
    tun: &dyn Tun,
    link: &LinkState,
    binding: &UdpBinding,
) {
    debug!("event reader started");

    while let Some(event) = events.recv().await {
        if event.contains(TunEvent::MTU_UPDATE) {
            update_mtu(tun, link);
        }

        if event.contains(TunEvent::UP) && link.mark_up() {
            info!("Interface set up");
            if let Err(e) = binding.open().await {
                error!("Failed to bind UDP socket: {}", e);
                link.mark_down();
            }
        }

        if event.contains(TunEvent::DOWN) && link.mark_down() {
            info!("Interface set down");
            binding.close().await;
        }
    }

    debug!("event reader stopped");
}

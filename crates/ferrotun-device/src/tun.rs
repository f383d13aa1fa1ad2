//! Network-interface capability set.
//!
//! Backends (kernel TUN devices, the in-memory test device) implement
//! [`Tun`]. The interface reports state changes through a single event
//! channel which the link-state reactor drains until the backend closes it.

use anyhow::Result;
use bitflags::bitflags;
use tokio::sync::mpsc::UnboundedReceiver;

bitflags! {
    /// Interface state changes. One event may carry several flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TunEvent: u8 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const MTU_UPDATE = 1 << 2;
    }
}

pub trait Tun: Send + Sync {
    /// Read one packet into `buf`, returning its length; 0 when none is pending.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one packet to the interface.
    fn write(&self, packet: &[u8]) -> Result<usize>;

    fn mtu(&self) -> Result<i32>;

    fn name(&self) -> Result<String>;

    /// Hand out the event channel. There is only one consumer, so every
    /// call after the first returns `None`.
    fn events(&self) -> Option<UnboundedReceiver<TunEvent>>;

    /// Close the interface; the event channel closes with it.
    fn close(&self) -> Result<()>;
}

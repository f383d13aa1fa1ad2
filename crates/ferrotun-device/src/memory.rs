//! In-memory network interface.
//!
//! Packets injected with [`MemoryTun::inject`] are returned by `read`, and
//! everything passed to `write` can be collected with
//! [`MemoryTun::take_written`]. State changes are driven by hand through
//! [`MemoryTun::send_event`] and [`MemoryTun::set_mtu`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::lock;
use crate::tun::{Tun, TunEvent};

pub struct MemoryTun {
    name: String,
    mtu: AtomicI32,
    mtu_error: Mutex<Option<String>>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    outbound: Mutex<Vec<Vec<u8>>>,
    events_tx: Mutex<Option<UnboundedSender<TunEvent>>>,
    events_rx: Mutex<Option<UnboundedReceiver<TunEvent>>>,
    closed: AtomicBool,
}

impl MemoryTun {
    pub fn new(name: impl Into<String>, mtu: i32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            mtu: AtomicI32::new(mtu),
            mtu_error: Mutex::new(None),
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(Vec::new()),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a packet for the next `read`.
    pub fn inject(&self, packet: Vec<u8>) {
        lock(&self.inbound).push_back(packet);
    }

    /// Drain everything written so far.
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *lock(&self.outbound))
    }

    /// Emit an event; false once the interface is closed.
    pub fn send_event(&self, event: TunEvent) -> bool {
        match lock(&self.events_tx).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Change the MTU and announce it.
    pub fn set_mtu(&self, mtu: i32) -> bool {
        self.mtu.store(mtu, Ordering::Release);
        self.send_event(TunEvent::MTU_UPDATE)
    }

    /// Make `mtu()` fail with `reason` until cleared with `None`.
    pub fn fail_mtu(&self, reason: Option<String>) {
        *lock(&self.mtu_error) = reason;
    }
}

impl Tun for MemoryTun {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            bail!("{} is closed", self.name);
        }
        let Some(packet) = lock(&self.inbound).pop_front() else {
            return Ok(0);
        };
        if packet.len() > buf.len() {
            bail!(
                "packet of {} bytes does not fit a {} byte buffer",
                packet.len(),
                buf.len()
            );
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn write(&self, packet: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            bail!("{} is closed", self.name);
        }
        lock(&self.outbound).push(packet.to_vec());
        Ok(packet.len())
    }

    fn mtu(&self) -> Result<i32> {
        if let Some(reason) = lock(&self.mtu_error).as_ref() {
            bail!("{}", reason);
        }
        Ok(self.mtu.load(Ordering::Acquire))
    }

    fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    fn events(&self) -> Option<UnboundedReceiver<TunEvent>> {
        lock(&self.events_rx).take()
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing {}", self.name);
        }
        lock(&self.events_tx).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let tun = MemoryTun::new("mem0", 1420);
        let mut buf = [0u8; 64];

        assert_eq!(tun.read(&mut buf).unwrap(), 0);
        tun.inject(vec![1, 2, 3]);
        assert_eq!(tun.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        tun.write(&[9, 9]).unwrap();
        assert_eq!(tun.take_written(), vec![vec![9, 9]]);
        assert!(tun.take_written().is_empty());
    }

    #[test]
    fn test_events_single_consumer() {
        let tun = MemoryTun::new("mem0", 1420);
        let mut rx = tun.events().unwrap();
        assert!(tun.events().is_none());

        assert!(tun.send_event(TunEvent::UP));
        assert_eq!(rx.try_recv().unwrap(), TunEvent::UP);

        tun.close().unwrap();
        assert!(!tun.send_event(TunEvent::DOWN));
        assert!(rx.try_recv().is_err());
        assert!(tun.read(&mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_mtu() {
        let tun = MemoryTun::new("mem0", 1420);
        assert_eq!(tun.mtu().unwrap(), 1420);
        tun.set_mtu(9000);
        assert_eq!(tun.mtu().unwrap(), 9000);

        tun.fail_mtu(Some("gone".into()));
        assert!(tun.mtu().is_err());
        tun.fail_mtu(None);
        assert_eq!(tun.mtu().unwrap(), 9000);
    }
}

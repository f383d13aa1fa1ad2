//! UDP socket binding owned by the link-state reactor.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// The outbound/inbound UDP socket, present only while the interface is up.
pub struct UdpBinding {
    port: u16,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl UdpBinding {
    /// `port` 0 lets the OS pick a port on every bind.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            socket: Mutex::new(None),
        }
    }

    /// Bind the configured port. A no-op if already bound.
    pub async fn open(&self) -> io::Result<SocketAddr> {
        let mut guard = self.socket.lock().await;
        if let Some(socket) = guard.as_ref() {
            return socket.local_addr();
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        let addr = socket.local_addr()?;
        info!("UDP bind has been updated: listening on {}", addr);
        *guard = Some(Arc::new(socket));
        Ok(addr)
    }

    /// Drop the socket. Returns whether one was bound.
    pub async fn close(&self) -> bool {
        let closed = self.socket.lock().await.take().is_some();
        if closed {
            debug!("UDP bind closed");
        }
        closed
    }

    /// Snapshot of the current socket for the packet path.
    pub async fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().await.clone()
    }

    pub async fn is_bound(&self) -> bool {
        self.socket.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .await
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

//! Production implementations backed by the system clock and Tokio sockets.

use crate::error::EnvError;
use crate::types::Datagram;
use crate::{DatagramTransport, TrackerClock};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// UDP port the tracking gateway broadcasts on.
pub const DEFAULT_GATEWAY_PORT: u16 = 7778;

/// Largest datagram the gateway sends is well below this.
const MAX_DATAGRAM: usize = 2048;

/// Production clock: monotonic time since construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl SystemClock {
    /// Creates a new SystemClock.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped clock for sharing across contexts.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerClock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Gateway datagrams over a Tokio UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    closed: AtomicBool,
    close_signal: Notify,
}

impl UdpTransport {
    /// Binds to `0.0.0.0:port`.
    pub async fn bind(port: u16) -> Result<Self, EnvError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        Self::bind_addr(addr).await
    }

    /// Binds to an explicit address.
    pub async fn bind_addr(addr: SocketAddr) -> Result<Self, EnvError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| EnvError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, EnvError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn recv(&self) -> Result<Datagram, EnvError> {
        if self.is_closed() {
            return Err(EnvError::Closed);
        }
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tokio::select! {
            received = self.socket.recv_from(&mut buf) => {
                let (len, _from) = received?;
                buf.truncate(len);
                Ok(Datagram::new(buf))
            }
            _ = self.close_signal.notified() => Err(EnvError::Closed),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

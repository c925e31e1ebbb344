//! In-memory transport used by the replay harness and tests.

use crate::error::EnvError;
use crate::types::Datagram;
use crate::DatagramTransport;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex, Notify};

/// Transport fed from a Tokio channel instead of a socket.
pub struct ChannelTransport {
    /// Receiver behind a tokio mutex so `recv` can take `&self`
    rx: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: AtomicBool,
    /// Wakes a pending `recv` on close
    close_signal: Notify,
}

/// Producer side of a [`ChannelTransport`].
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Datagram>,
}

impl ChannelSender {
    /// Queues a datagram. Fails once the transport side is gone.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), EnvError> {
        self.tx
            .send(Datagram::new(payload))
            .map_err(|_| EnvError::Closed)
    }
}

impl ChannelTransport {
    /// Creates a connected sender/transport pair.
    pub fn pair() -> (ChannelSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ChannelSender { tx },
            Self {
                rx: Mutex::new(rx),
                closed: AtomicBool::new(false),
                close_signal: Notify::new(),
            },
        )
    }
}

#[async_trait]
impl DatagramTransport for ChannelTransport {
    async fn recv(&self) -> Result<Datagram, EnvError> {
        let closing = self.close_signal.notified();
        tokio::pin!(closing);
        // Register before checking the flag so a concurrent close is not missed.
        closing.as_mut().enable();
        if self.is_closed() {
            return Err(EnvError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            datagram = rx.recv() => datagram.ok_or(EnvError::Closed),
            _ = &mut closing => Err(EnvError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (tx, transport) = ChannelTransport::pair();
        tx.send(vec![1]).unwrap();
        tx.send(vec![2]).unwrap();

        assert_eq!(transport.recv().await.unwrap().payload, vec![1]);
        assert_eq!(transport.recv().await.unwrap().payload, vec![2]);
    }

    #[tokio::test]
    async fn test_channel_reports_closed_when_sender_dropped() {
        let (tx, transport) = ChannelTransport::pair();
        drop(tx);
        assert!(transport.recv().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let (_tx, transport) = ChannelTransport::pair();
        let transport = std::sync::Arc::new(transport);

        let waiter = {
            let transport = std::sync::Arc::clone(&transport);
            tokio::spawn(async move { transport.recv().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        transport.close();

        let result = tokio::time::timeout(std::time::Duration::from_millis(500), waiter)
            .await
            .expect("recv not woken by close")
            .unwrap();
        assert!(result.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_tx, transport) = ChannelTransport::pair();
        transport.close();
        transport.close();
        assert!(transport.recv().await.unwrap_err().is_closed());
    }
}

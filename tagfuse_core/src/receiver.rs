//! Receive Loop - Datagram transport to per-endpoint handoff queues.
//!
//! This is the network-receive context. It owns nothing but counters: every
//! datagram is stamped with the shared clock, decoded, and pushed into the
//! registry's inbox. The render context drains the inbox on its own tick.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  recv()  ┌─────────────────────┐  push()  ┌─────────┐
//! │  Transport   │ ───────▶ │ Receiver            │ ───────▶ │  Inbox  │
//! │ (UDP/channel)│          │ • clock.now_secs()  │          │ (queues)│
//! └──────────────┘          │ • decode_datagram() │          └────┬────┘
//!                           └─────────────────────┘               │ tick()
//!                                                           ┌─────▼────┐
//!                                                           │ Registry │
//!                                                           └──────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tagfuse_core::receiver::{Receiver, ReceiverConfig};
//! use tagfuse_env::{SystemClock, UdpTransport};
//!
//! let clock = SystemClock::shared();
//! let transport = Arc::new(UdpTransport::bind(7778).await?);
//! let receiver = Receiver::new(clock, transport, registry.inbox_sender(), ReceiverConfig::default());
//! let handle = receiver.handle();
//! let task = tokio::spawn(receiver.run());
//!
//! // ... later, from anywhere
//! handle.shutdown();
//! ```

use crate::codec::decode_datagram;
use crate::handoff::InboxSender;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tagfuse_env::{DatagramTransport, EnvError, TrackerClock, DEFAULT_GATEWAY_PORT};
use tracing::{debug, error, info, warn};

/// Configuration for the receive loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// UDP port of the gateway (default: 7778)
    pub port: u16,

    /// Upper bound on how long a stop request waits for `recv` (default: 100 ms)
    pub poll_interval_ms: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_GATEWAY_PORT,
            poll_interval_ms: 100,
        }
    }
}

/// Receive-loop counters, shared with the handle.
#[derive(Debug, Default)]
struct Counters {
    datagrams: AtomicU64,
    records: AtomicU64,
    decode_errors: AtomicU64,
    overwritten: AtomicU64,
}

/// Snapshot of the receive-loop counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverStats {
    pub datagrams: u64,
    pub records: u64,
    pub decode_errors: u64,
    /// Measurements that overwrote an undrained one
    pub overwritten: u64,
}

impl Counters {
    fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
        }
    }
}

/// Stop and close flags shared between the loop and its handles.
#[derive(Debug, Default)]
struct Flags {
    stop: AtomicBool,
    /// Set before the transport is closed so the resulting error is not logged
    close_requested: AtomicBool,
}

/// The receive loop.
///
/// Generic over the clock and transport implementations, so the same loop
/// runs against a UDP socket or an in-memory channel.
pub struct Receiver<C, T>
where
    C: TrackerClock,
    T: DatagramTransport,
{
    clock: Arc<C>,
    transport: Arc<T>,
    sender: InboxSender,
    config: ReceiverConfig,
    flags: Arc<Flags>,
    counters: Arc<Counters>,
}

/// Control handle for a running [`Receiver`].
pub struct ReceiverHandle<T: DatagramTransport> {
    transport: Arc<T>,
    flags: Arc<Flags>,
    counters: Arc<Counters>,
}

impl<T: DatagramTransport> Clone for ReceiverHandle<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            flags: Arc::clone(&self.flags),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<T: DatagramTransport> ReceiverHandle<T> {
    /// Stops the loop and closes the transport. Idempotent.
    ///
    /// Measurements already pushed into the inbox stay there until drained.
    pub fn shutdown(&self) {
        if self.flags.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flags.stop.store(true, Ordering::SeqCst);
        self.transport.close();
        info!("Receive loop shutdown requested");
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReceiverStats {
        self.counters.snapshot()
    }
}

impl<C, T> Receiver<C, T>
where
    C: TrackerClock,
    T: DatagramTransport,
{
    pub fn new(clock: Arc<C>, transport: Arc<T>, sender: InboxSender, config: ReceiverConfig) -> Self {
        Self {
            clock,
            transport,
            sender,
            config,
            flags: Arc::new(Flags::default()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn handle(&self) -> ReceiverHandle<T> {
        ReceiverHandle {
            transport: Arc::clone(&self.transport),
            flags: Arc::clone(&self.flags),
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        self.counters.snapshot()
    }

    /// Runs until shut down or until the transport closes on its own.
    ///
    /// Returns the final counters. An unrequested close is an error.
    pub async fn run(self) -> Result<ReceiverStats, EnvError> {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        info!(poll_ms = poll.as_millis() as u64, "Receive loop started");

        while !self.flags.stop.load(Ordering::SeqCst) {
            let received = match tokio::time::timeout(poll, self.transport.recv()).await {
                Ok(received) => received,
                // Timed out: re-check the stop flag.
                Err(_) => continue,
            };

            match received {
                Ok(datagram) => {
                    let arrival = self.clock.now_secs();
                    self.dispatch(&datagram.payload, arrival);
                }
                Err(_) if self.flags.close_requested.load(Ordering::SeqCst) => break,
                Err(e) if e.is_closed() => {
                    warn!("Transport closed without shutdown request");
                    self.flags.stop.store(true, Ordering::SeqCst);
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "Datagram receive failed");
                }
            }
        }

        let stats = self.counters.snapshot();
        info!(
            datagrams = stats.datagrams,
            records = stats.records,
            decode_errors = stats.decode_errors,
            "Receive loop stopped"
        );
        Ok(stats)
    }

    /// Decodes one datagram and queues its records. Returns the number of
    /// records queued.
    pub fn dispatch(&self, payload: &[u8], arrival: f64) -> usize {
        self.counters.datagrams.fetch_add(1, Ordering::Relaxed);
        let mut queued = 0;
        for record in decode_datagram(payload) {
            match record {
                Ok(record) => {
                    if self
                        .sender
                        .push(record.endpoint, arrival, record.measurement)
                    {
                        self.counters.overwritten.fetch_add(1, Ordering::Relaxed);
                    }
                    queued += 1;
                }
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, len = payload.len(), "Datagram decode stopped");
                }
            }
        }
        self.counters
            .records
            .fetch_add(queued as u64, Ordering::Relaxed);
        queued
    }
}

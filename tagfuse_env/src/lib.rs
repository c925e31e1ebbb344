//! tagfuse Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" boundary between the fusion core and
//! the outside world, so the same core runs against a real gateway
//! (UDP + system clock) or against a replay harness (channels + manual clock).
//!
//! # Core Concept
//!
//! The fusion core never reads the wall clock or touches a socket directly:
//! - Time (`now()`) comes from a [`TrackerClock`]
//! - Raw datagrams (`recv()`) come from a [`DatagramTransport`]
//!
//! # Example
//!
//! ```ignore
//! use tagfuse_env::{DatagramTransport, SystemClock, TrackerClock, UdpTransport};
//!
//! async fn pump<T: DatagramTransport>(clock: &SystemClock, transport: &T) {
//!     while let Ok(datagram) = transport.recv().await {
//!         let arrival = clock.now_secs();
//!         handle(arrival, datagram.payload);
//!     }
//! }
//! ```

mod channel;
mod context;
mod error;
mod tokio_impl;
mod transport;
mod types;

pub use channel::{ChannelSender, ChannelTransport};
pub use context::TrackerClock;
pub use error::EnvError;
pub use tokio_impl::{SystemClock, UdpTransport, DEFAULT_GATEWAY_PORT};
pub use transport::DatagramTransport;
pub use types::Datagram;

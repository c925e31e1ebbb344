//! Datagram transport abstraction.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::Datagram;

/// Abstraction over whatever delivers raw gateway datagrams.
///
/// # Implementations
///
/// - **Production**: `UdpTransport` wraps a tokio UDP socket
/// - **Replay/Tests**: `ChannelTransport` is fed from an in-memory channel
///
/// # Packet Flow
///
/// ```text
/// Gateway                 Transport                 Receive loop
///   |                         |                          |
///   |-- UDP datagram -------->|                          |
///   |                         |-- recv() -> Datagram --->|
///   |                         |                          |-- decode + enqueue
/// ```
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    /// Receives the next datagram.
    ///
    /// # Returns
    /// * `Ok(datagram)` - A datagram arrived
    /// * `Err(EnvError::Closed)` - The transport was closed
    /// * `Err(EnvError::Io)` - The underlying socket failed
    async fn recv(&self) -> Result<Datagram, EnvError>;

    /// Closes the transport. Pending and future `recv` calls fail with
    /// `EnvError::Closed`. Calling it more than once is harmless.
    fn close(&self);

    /// Whether [`DatagramTransport::close`] has been called.
    fn is_closed(&self) -> bool;
}

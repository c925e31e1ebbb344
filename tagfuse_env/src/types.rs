//! Common types for the environment abstraction.

use serde::{Deserialize, Serialize};

/// A raw datagram as delivered by a transport.
///
/// The payload is opaque here; decoding belongs to the core codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datagram {
    /// The raw bytes
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Creates a datagram from payload bytes.
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl From<Vec<u8>> for Datagram {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

//! Error types for the tagfuse environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The transport was closed on request
    #[error("Transport closed")]
    Closed,

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binding the local socket failed
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl EnvError {
    /// Whether this error only signals an orderly shutdown.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

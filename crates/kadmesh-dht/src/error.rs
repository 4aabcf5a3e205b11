//! DHT error types

use thiserror::Error;

/// DHT-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DhtError {
    /// The caller-supplied cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// A single request exceeded its own deadline
    #[error("Operation timeout")]
    Timeout,

    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("RPC failed: {0}")]
    Rpc(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] kadmesh_protocol::ProtocolError),
}

impl DhtError {
    /// Whether this error came from cancellation rather than the network
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DhtError::Cancelled)
    }
}

/// Result type for DHT operations
pub type Result<T> = std::result::Result<T, DhtError>;

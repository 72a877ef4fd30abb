//! Error handling for the node
//!
//! Every boundary function returns `Result<T>` with an error naming one of
//! the node's failure kinds and carrying a human-readable reason.

use std::fmt;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Failure kinds for node operations
#[derive(Debug, Clone)]
pub enum NodeError {
    /// Malformed request, failed structural predicate, invariant violation.
    /// State is unchanged.
    Validation(String),
    /// Mempool full, sealing budget exhausted, proposer not selected.
    /// State is unchanged; the caller may retry later.
    Resource(String),
    /// Seal verification failed or a chain fork was rejected
    Consensus(String),
    /// Message parse failure or a broken peer channel
    Transport(String),
    /// Invariant broken despite input validation; fatal for the operation
    Internal(String),
    /// Requested block, transaction, or address is unknown
    NotFound(String),
    /// Configuration errors
    Config(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Chain store errors
    Database(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// Insufficient funds for a transaction
    InsufficientFunds { required: u64, available: u64 },
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Validation(msg) => write!(f, "Validation error: {msg}"),
            NodeError::Resource(msg) => write!(f, "Resource error: {msg}"),
            NodeError::Consensus(msg) => write!(f, "Consensus error: {msg}"),
            NodeError::Transport(msg) => write!(f, "Transport error: {msg}"),
            NodeError::Internal(msg) => write!(f, "Internal error: {msg}"),
            NodeError::NotFound(msg) => write!(f, "Not found: {msg}"),
            NodeError::Config(msg) => write!(f, "Configuration error: {msg}"),
            NodeError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            NodeError::Io(msg) => write!(f, "I/O error: {msg}"),
            NodeError::Database(msg) => write!(f, "Database error: {msg}"),
            NodeError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            NodeError::InsufficientFunds {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient funds: required {required}, available {available}"
                )
            }
        }
    }
}

impl std::error::Error for NodeError {}

impl NodeError {
    /// Whether the failure is the caller's fault (a 4xx-equivalent), as
    /// opposed to a node-side failure (5xx-equivalent) or a missing entity.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            NodeError::Validation(_) | NodeError::InsufficientFunds { .. }
        )
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<sled::Error> for NodeError {
    fn from(err: sled::Error) -> Self {
        NodeError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for NodeError {
    fn from(err: bincode::error::EncodeError) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for NodeError {
    fn from(err: bincode::error::DecodeError) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

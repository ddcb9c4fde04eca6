use crate::address::AddressError;
use crate::ring::RingError;
use crate::space::SpaceError;
use thiserror::Error;

/// Errors returned by allocator operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("{0} is not within the address universe")]
    OutOfUniverse(String),

    #[error("{op} request for {ident} cancelled")]
    Cancelled { op: &'static str, ident: String },

    #[error("address {addr} is already owned by {owner}")]
    AddressInUse { addr: String, owner: String },

    #[error("address {addr} is owned by other peer {peer}")]
    AddressOwnedByPeer { addr: String, peer: String },

    #[error("{0}")]
    NotFound(String),

    #[error("ring protocol error: {0}")]
    RingProtocol(#[from] RingError),

    #[error(transparent)]
    Space(#[from] SpaceError),

    #[error("invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("failed to decode gossip: {0}")]
    Decode(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("allocator is shutting down")]
    ShuttingDown,
}

impl AllocatorError {
    /// Whether retrying the same request later can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AllocatorError::Persistence(_) | AllocatorError::AddressOwnedByPeer { .. }
        )
    }
}

impl From<serde_json::Error> for AllocatorError {
    fn from(err: serde_json::Error) -> Self {
        AllocatorError::Decode(err.to_string())
    }
}

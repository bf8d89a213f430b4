//! Error types for the replica engine.

use thiserror::Error;
use vsr_core::ModificationCounter;

/// Errors raised by [`VersionedReplica`](crate::replica::VersionedReplica).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("Replica already initialized at version {0}")]
    AlreadyInitialized(ModificationCounter),

    #[error("Delta covers an empty range: from {from} to {to}")]
    EmptyRange {
        from: ModificationCounter,
        to: ModificationCounter,
    },
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

//! Error types for the Vesper SDK.

use thiserror::Error;
use vsr_delta::ReplicaError;

/// Errors surfaced by subscriptions and the client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdkError {
    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("Resync failed: {0}")]
    ResyncFailed(String),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("Already subscribed: {0}")]
    AlreadySubscribed(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Malformed(err.to_string())
    }
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;

//! Vesper SDK - async client for replicated rule sets and reconciled results
//!
//! This SDK keeps a listener's local view of server state correct while
//! notifications arrive late, out of order, duplicated or with gaps.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use vsr_sdk::{Client, ClientConfig, RuleListener};
//! use vsr_core::Rule;
//!
//! struct Printer;
//!
//! impl RuleListener for Printer {
//!     fn rule_added(&self, rule: &Rule) {
//!         println!("+ {}", rule);
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let client = Client::new_with_memory_transport(ClientConfig::default());
//! client.transport().create_rule_stream("do-not-retry", 0, ["job-17"]);
//!
//! let rules = client.subscribe_rules("do-not-retry").await.unwrap();
//! rules.add_listener(Arc::new(Printer)).await.unwrap();
//!
//! client
//!     .transport()
//!     .publish_rule_change("do-not-retry", ["job-42"], Vec::<&str>::new())
//!     .await
//!     .unwrap();
//! # });
//! ```
//!
//! # Architecture
//!
//! - [`client`] - Entry point holding the transport, dispatcher and config
//! - [`network`] - Transport traits and the in-memory transport
//! - [`dispatch`] - Wire envelope decoding and routing
//! - [`subscription`] - Rule and view subscriptions with gap-triggered resync
//! - [`listener`] - Listener contracts and reconciled call types
//! - [`notifier`] - Serial per-listener delivery with coalescing
//! - [`error`] - Error types

pub mod client;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod network;
pub mod notifier;
pub mod subscription;

// Re-exports for convenience
pub use client::{Client, ClientConfig, ClientConfigBuilder};
pub use dispatch::{
    DispatchOutcome, DispatchStats, Envelope, NotificationDispatcher, PendingCall, RuleMessage,
    WireBody,
};
pub use error::{Result, SdkError};
pub use listener::{Deliver, ListenerId, RuleCall, RuleListener, ViewCall, ViewListener};
pub use network::{MemoryTransport, RpcStats, RuleSource, TransportError, ViewSource};
pub use notifier::{ListenerNotifier, NotifierStats};
pub use subscription::{RuleSubscription, ViewSubscription};

// Re-export the data model and engine types listeners work with
pub use vsr_core::{
    LogicalTime, ModificationCounter, ResultFragment, ResultSnapshot, Rule, RuleDelta,
    RuleSnapshot, TargetId, Value,
};
pub use vsr_delta::{NetworkConfig, ReconcilerStats};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Client, ClientConfig};
    pub use crate::error::SdkError;
    pub use crate::listener::{RuleListener, ViewListener};
    pub use crate::network::{MemoryTransport, RuleSource, ViewSource};
    pub use crate::subscription::{RuleSubscription, ViewSubscription};
    pub use vsr_core::{ResultFragment, ResultSnapshot, Rule};
}

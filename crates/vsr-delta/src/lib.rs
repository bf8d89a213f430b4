//! Vesper Delta - versioned replication and result reconciliation
//!
//! This crate implements the state-keeping half of Vesper:
//! - A generic versioned replica that applies in-sequence deltas and
//!   detects gaps
//! - Rule-set replication on top of it
//! - Result reconciliation for full and fragment results delivered out of order
//! - A seeded delivery simulator for exercising all of the above
//!
//! # Versioned replica
//!
//! ```text
//! On delta d = (from, to]:
//!   to <= version    -> stale, drop
//!   from == version  -> apply, version = to
//!   otherwise        -> gap, owner resyncs from `version`
//! ```
//!
//! # Example
//!
//! ```rust
//! use vsr_delta::{ApplyOutcome, RuleSetReplicator};
//! use vsr_core::{RuleDelta, RuleSnapshot};
//!
//! let mut replica = RuleSetReplicator::seeded(RuleSnapshot::new(5, ["A", "B"]));
//!
//! let delta = RuleDelta::new(5, 6).with_added(["C"]);
//! assert!(matches!(replica.apply_delta(&delta), Ok(ApplyOutcome::Applied(_))));
//! assert!(matches!(replica.apply_delta(&delta), Ok(ApplyOutcome::Stale)));
//! assert_eq!(replica.version().get(), 6);
//! ```

pub mod error;
pub mod reconcile;
pub mod replica;
pub mod ruleset;
pub mod simulator;

pub use error::{ReplicaError, Result};

pub use replica::{
    ApplyOutcome,
    DeltaPosition,
    Replicated,
    ResyncOutcome,
    VersionRange,
    VersionedReplica,
    VersionedSnapshot,
};

pub use ruleset::RuleSetReplicator;

pub use reconcile::{
    merge,
    Classification,
    IncomingResult,
    MergeOutcome,
    ReconcileOutcome,
    ReconcilerStats,
    ResultKind,
    ResultReconciler,
};

pub use simulator::{DeliverySimulator, DeliveryStats, NetworkConfig};

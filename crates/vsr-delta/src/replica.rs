//! Generic versioned replica.
//!
//! A replica holds `(version, state)` and advances only by applying a delta
//! whose range starts exactly at the current version, or by installing an
//! authoritative snapshot during resync.
//!
//! ```text
//! on delta d:
//!   if d.to <= version            -> Stale   (duplicate or already covered)
//!   elif d.from == version        -> Applied (state = merge(state, d); version = d.to)
//!   else                          -> Gap     (owner fetches snapshot(since = version))
//!
//! on snapshot s (resync):
//!   if s.version < version        -> Stale   (would move the version backwards)
//!   else                          -> state = s; version = s.version
//! ```
//!
//! The replica never performs I/O itself. On [`ApplyOutcome::Gap`] the owner
//! is expected to fetch a snapshot while still holding whatever lock guards
//! the replica, and then call [`VersionedReplica::resync`].

use crate::error::{ReplicaError, Result};
use tracing::debug;
use vsr_core::ModificationCounter;

/// A change covering a half-open range of versions `(from, to]`.
pub trait VersionRange {
    fn from_version(&self) -> ModificationCounter;
    fn to_version(&self) -> ModificationCounter;
}

/// Full authoritative state stamped with its version.
pub trait VersionedSnapshot {
    fn version(&self) -> ModificationCounter;
}

/// State that can be driven by deltas and replaced by snapshots.
pub trait Replicated: Default {
    type Delta: VersionRange;
    type Snapshot: VersionedSnapshot;
    /// What listeners need to hear about after a change.
    type Effect;

    /// Merge an in-sequence delta into the state.
    fn apply(&mut self, delta: &Self::Delta) -> Self::Effect;

    /// Replace the state wholesale, reporting the net effect relative to the old state.
    fn replace(&mut self, snapshot: Self::Snapshot) -> Self::Effect;
}

/// Where a delta falls relative to the replica's version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaPosition {
    Stale,
    InSequence,
    Gap,
}

/// Result of [`VersionedReplica::apply_delta`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome<E> {
    /// The delta was merged and the version advanced.
    Applied(E),
    /// Already covered by the current version; nothing changed.
    Stale,
    /// Versions between `since` and the delta are missing; a resync is required.
    Gap {
        since: ModificationCounter,
        received_from: ModificationCounter,
    },
}

/// Result of [`VersionedReplica::resync`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResyncOutcome<E> {
    Replaced(E),
    /// The snapshot was older than the current version and was ignored.
    Stale,
}

/// A local mirror of server-authoritative state.
#[derive(Debug, Clone)]
pub struct VersionedReplica<S: Replicated> {
    version: ModificationCounter,
    state: S,
    initialized: bool,
    resyncs: u64,
}

impl<S: Replicated> VersionedReplica<S> {
    /// An empty, uninitialized replica. Every delta is a gap until it is seeded.
    pub fn new() -> Self {
        Self {
            version: ModificationCounter::ZERO,
            state: S::default(),
            initialized: false,
            resyncs: 0,
        }
    }

    /// A replica seeded from an initial snapshot.
    pub fn seeded(snapshot: S::Snapshot) -> Self {
        let mut replica = Self::new();
        replica.install(snapshot);
        replica
    }

    pub fn version(&self) -> ModificationCounter {
        self.version
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of snapshots installed through [`resync`](Self::resync).
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// Seed state and version in one step. Valid once per replica lifetime.
    pub fn initialize(&mut self, snapshot: S::Snapshot) -> Result<S::Effect> {
        if self.initialized {
            return Err(ReplicaError::AlreadyInitialized(self.version));
        }
        Ok(self.install(snapshot))
    }

    /// Locate a delta relative to the current version without touching state.
    pub fn position(&self, delta: &S::Delta) -> DeltaPosition {
        if !self.initialized {
            DeltaPosition::Gap
        } else if delta.to_version() <= self.version {
            DeltaPosition::Stale
        } else if delta.from_version() == self.version {
            DeltaPosition::InSequence
        } else {
            // Either a hole before the delta or a delta straddling our version;
            // neither can be applied exactly.
            DeltaPosition::Gap
        }
    }

    /// Apply a delta if it is in sequence.
    ///
    /// Stale deltas are dropped. Gaps leave the replica untouched and tell the
    /// caller which version to resync from.
    pub fn apply_delta(&mut self, delta: &S::Delta) -> Result<ApplyOutcome<S::Effect>> {
        let (from, to) = (delta.from_version(), delta.to_version());
        if to <= from {
            return Err(ReplicaError::EmptyRange { from, to });
        }

        match self.position(delta) {
            DeltaPosition::Stale => {
                debug!(version = %self.version, %from, %to, "dropping stale delta");
                Ok(ApplyOutcome::Stale)
            }
            DeltaPosition::InSequence => {
                let effect = self.state.apply(delta);
                self.version = to;
                Ok(ApplyOutcome::Applied(effect))
            }
            DeltaPosition::Gap => Ok(ApplyOutcome::Gap {
                since: self.version,
                received_from: from,
            }),
        }
    }

    /// Install an authoritative snapshot fetched after a gap.
    ///
    /// Later snapshots win; a snapshot older than the current version is
    /// ignored so the version never moves backwards.
    pub fn resync(&mut self, snapshot: S::Snapshot) -> ResyncOutcome<S::Effect> {
        if self.initialized && snapshot.version() < self.version {
            debug!(
                version = %self.version,
                snapshot = %snapshot.version(),
                "discarding resync snapshot older than replica"
            );
            return ResyncOutcome::Stale;
        }
        self.resyncs += 1;
        ResyncOutcome::Replaced(self.install(snapshot))
    }

    fn install(&mut self, snapshot: S::Snapshot) -> S::Effect {
        self.version = snapshot.version();
        self.initialized = true;
        self.state.replace(snapshot)
    }
}

impl<S: Replicated> Default for VersionedReplica<S> {
    fn default() -> Self {
        Self::new()
    }
}

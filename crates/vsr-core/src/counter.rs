//! Modification counters.
//!
//! A counter identifies one revision of a replicated entity. Counters only
//! ever move forward: the server bumps the counter on every mutation and the
//! replica never stores a value lower than one it has already seen.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic revision number for one stream of updates.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModificationCounter(u64);

impl ModificationCounter {
    pub const ZERO: ModificationCounter = ModificationCounter(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The counter immediately after this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Number of revisions between `self` and a later counter.
    pub fn distance_to(self, later: ModificationCounter) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Debug for ModificationCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for ModificationCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ModificationCounter {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ModificationCounter> for u64 {
    fn from(value: ModificationCounter) -> u64 {
        value.0
    }
}

/// Server-assigned recomputation sequence number.
///
/// Shares the representation of [`ModificationCounter`] but is a distinct
/// notion: it orders computation cycles, not state revisions.
pub type LogicalTime = ModificationCounter;

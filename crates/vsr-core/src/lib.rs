//! Vesper core data model.
//!
//! - [`counter`] - monotonic modification counters and logical times
//! - [`rule`] - opaque rules, rule deltas and snapshots, set semantics
//! - [`result`] - full result snapshots, partial fragments, overlay and diff

pub mod counter;
pub mod result;
pub mod rule;

pub use counter::{LogicalTime, ModificationCounter};
pub use result::{overlay, ResultFragment, ResultSnapshot, ResultValues, TargetId, Value};
pub use rule::{Rule, RuleChanges, RuleDelta, RuleSet, RuleSnapshot};

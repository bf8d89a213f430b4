//! Result-stream reconciliation.
//!
//! Results arrive as full snapshots or partial fragments, each stamped with a
//! logical time. Delivery is unordered, and merging is neither commutative
//! nor associative, so every arrival is classified against the baseline time
//! and merged by a rule chosen from this matrix:
//!
//! ```text
//!               | Full                         | Fragment
//! --------------+------------------------------+-------------------------------------------
//! New   (t > b) | baseline = incoming          | baseline = overlay(baseline, incoming)
//! Ambig (t = b) | baseline = overlay(b, in)    | baseline = overlay(baseline, incoming)
//! Old   (t < b) | discard                      | baseline = overlay(incoming, baseline) @ b
//! ```
//!
//! The Old/Fragment cell rebuilds the baseline with the late fragment as the
//! older base and the held baseline replayed on top. Already-observed values
//! never regress; targets only the late fragment knows about are picked up.
//!
//! A baseline installed from an authoritative snapshot already contains every
//! result computed at its time. A result arriving later with that same time
//! is still overlaid, but counted as `covered` rather than ambiguous.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};
use vsr_core::{overlay, LogicalTime, ResultFragment, ResultSnapshot, ResultValues};

/// Whether a result carries every target or only changed ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    Full,
    Fragment,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKind::Full => f.write_str("full"),
            ResultKind::Fragment => f.write_str("fragment"),
        }
    }
}

/// Position of an incoming result's time relative to the baseline's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    New,
    Ambiguous,
    Old,
}

impl Classification {
    /// Classify `incoming` against `baseline`. Anything is new to an empty baseline.
    pub fn of(incoming: LogicalTime, baseline: Option<LogicalTime>) -> Self {
        match baseline {
            None => Classification::New,
            Some(b) if incoming > b => Classification::New,
            Some(b) if incoming == b => Classification::Ambiguous,
            Some(_) => Classification::Old,
        }
    }
}

/// A result on its way into the reconciler.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingResult {
    pub kind: ResultKind,
    pub logical_time: LogicalTime,
    pub values: ResultValues,
}

impl IncomingResult {
    pub fn full(snapshot: ResultSnapshot) -> Self {
        Self {
            kind: ResultKind::Full,
            logical_time: snapshot.logical_time,
            values: snapshot.values,
        }
    }

    pub fn fragment(fragment: ResultFragment) -> Self {
        Self {
            kind: ResultKind::Fragment,
            logical_time: fragment.logical_time,
            values: fragment.values,
        }
    }
}

impl From<ResultSnapshot> for IncomingResult {
    fn from(snapshot: ResultSnapshot) -> Self {
        Self::full(snapshot)
    }
}

impl From<ResultFragment> for IncomingResult {
    fn from(fragment: ResultFragment) -> Self {
        Self::fragment(fragment)
    }
}

/// Outcome of the pure merge function.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeOutcome {
    Baseline(ResultSnapshot),
    Discarded,
}

/// `merge(baseline, incoming, classification, kind) -> baseline'`
///
/// The kind travels inside `incoming`. `classification` is normally
/// [`Classification::of`] the two times, but is taken as an argument so the
/// matrix can be exercised cell by cell.
pub fn merge(
    baseline: Option<&ResultSnapshot>,
    incoming: &IncomingResult,
    classification: Classification,
) -> MergeOutcome {
    let empty = ResultValues::new();
    let (base_values, base_time) = match baseline {
        Some(b) => (&b.values, b.logical_time),
        None => (&empty, incoming.logical_time),
    };

    match (classification, incoming.kind) {
        (Classification::New, ResultKind::Full) => MergeOutcome::Baseline(ResultSnapshot {
            logical_time: incoming.logical_time,
            values: incoming.values.clone(),
        }),
        (Classification::New, ResultKind::Fragment)
        | (Classification::Ambiguous, ResultKind::Full)
        | (Classification::Ambiguous, ResultKind::Fragment) => {
            MergeOutcome::Baseline(ResultSnapshot {
                logical_time: incoming.logical_time.max(base_time),
                values: overlay(base_values, &incoming.values),
            })
        }
        (Classification::Old, ResultKind::Full) => MergeOutcome::Discarded,
        (Classification::Old, ResultKind::Fragment) => MergeOutcome::Baseline(ResultSnapshot {
            logical_time: base_time,
            values: overlay(&incoming.values, base_values),
        }),
    }
}

/// Counters of how arrivals were handled.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerStats {
    pub new: u64,
    pub ambiguous: u64,
    /// Results at the time of an installed snapshot, already contained in it.
    pub covered: u64,
    pub old_discarded: u64,
    pub old_rebased: u64,
    pub discontinuities: u64,
    pub resyncs: u64,
}

/// What happened to one arrival.
#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// The baseline changed. `delta` lists the targets whose value differs
    /// from the previous baseline.
    Merged {
        classification: Classification,
        kind: ResultKind,
        baseline: ResultSnapshot,
        delta: ResultFragment,
    },
    /// An old full result; the baseline is unchanged.
    Discarded,
    /// A fragment skipped at least one logical time. Nothing was merged; the
    /// owner should resync, then call [`ResultReconciler::reconcile_unchecked`].
    Discontinuity {
        baseline_time: LogicalTime,
        incoming_time: LogicalTime,
    },
}

/// Owner of the baseline for one view.
#[derive(Debug, Clone)]
pub struct ResultReconciler {
    baseline: Option<ResultSnapshot>,
    /// Time of the last snapshot installed out of band, while still the baseline time.
    authoritative_at: Option<LogicalTime>,
    detect_discontinuities: bool,
    stats: ReconcilerStats,
}

impl ResultReconciler {
    pub fn new() -> Self {
        Self {
            baseline: None,
            authoritative_at: None,
            detect_discontinuities: true,
            stats: ReconcilerStats::default(),
        }
    }

    /// Start from an existing baseline, e.g. one fetched at subscription time.
    pub fn seeded(baseline: ResultSnapshot) -> Self {
        Self {
            authoritative_at: Some(baseline.logical_time),
            baseline: Some(baseline),
            ..Self::new()
        }
    }

    /// Toggle reporting of skipped logical times for fragments.
    pub fn with_discontinuity_detection(mut self, enabled: bool) -> Self {
        self.detect_discontinuities = enabled;
        self
    }

    pub fn baseline(&self) -> Option<&ResultSnapshot> {
        self.baseline.as_ref()
    }

    pub fn baseline_time(&self) -> Option<LogicalTime> {
        self.baseline.as_ref().map(|b| b.logical_time)
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    /// Classify and merge one arrival.
    pub fn reconcile(&mut self, incoming: IncomingResult) -> ReconcileOutcome {
        if self.detect_discontinuities && incoming.kind == ResultKind::Fragment {
            if let Some(baseline_time) = self.baseline_time() {
                if baseline_time.distance_to(incoming.logical_time) > 1 {
                    self.stats.discontinuities += 1;
                    debug!(
                        baseline = %baseline_time,
                        logical_time = %incoming.logical_time,
                        "fragment skips logical times"
                    );
                    return ReconcileOutcome::Discontinuity {
                        baseline_time,
                        incoming_time: incoming.logical_time,
                    };
                }
            }
        }
        self.reconcile_unchecked(incoming)
    }

    /// Merge without discontinuity detection.
    pub fn reconcile_unchecked(&mut self, incoming: IncomingResult) -> ReconcileOutcome {
        let classification = Classification::of(incoming.logical_time, self.baseline_time());
        let kind = incoming.kind;

        match classification {
            Classification::New => self.stats.new += 1,
            Classification::Ambiguous if self.authoritative_at == Some(incoming.logical_time) => {
                self.stats.covered += 1;
                debug!(
                    logical_time = %incoming.logical_time,
                    %kind,
                    "result already covered by installed snapshot"
                );
            }
            Classification::Ambiguous => {
                self.stats.ambiguous += 1;
                warn!(
                    logical_time = %incoming.logical_time,
                    %kind,
                    "ambiguous concurrent result, merging by overlay"
                );
            }
            Classification::Old => match kind {
                ResultKind::Full => {
                    self.stats.old_discarded += 1;
                    debug!(
                        logical_time = %incoming.logical_time,
                        baseline = ?self.baseline_time(),
                        "discarding old full result"
                    );
                }
                ResultKind::Fragment => {
                    self.stats.old_rebased += 1;
                    debug!(
                        logical_time = %incoming.logical_time,
                        baseline = ?self.baseline_time(),
                        "rebasing held baseline onto late fragment"
                    );
                }
            },
        }

        match merge(self.baseline.as_ref(), &incoming, classification) {
            MergeOutcome::Discarded => ReconcileOutcome::Discarded,
            MergeOutcome::Baseline(next) => {
                let delta = next.diff(self.baseline.as_ref());
                if Some(next.logical_time) != self.authoritative_at {
                    self.authoritative_at = None;
                }
                self.baseline = Some(next.clone());
                ReconcileOutcome::Merged {
                    classification,
                    kind,
                    baseline: next,
                    delta,
                }
            }
        }
    }

    /// Install an authoritative snapshot fetched out of band.
    ///
    /// Returns the delta against the previous baseline, or `None` if the
    /// snapshot was older than what is already held.
    pub fn install(&mut self, snapshot: ResultSnapshot) -> Option<ResultFragment> {
        if let Some(held) = self.baseline_time() {
            if snapshot.logical_time < held {
                debug!(
                    snapshot = %snapshot.logical_time,
                    baseline = %held,
                    "discarding result snapshot older than baseline"
                );
                return None;
            }
        }
        self.stats.resyncs += 1;
        let delta = snapshot.diff(self.baseline.as_ref());
        self.authoritative_at = Some(snapshot.logical_time);
        self.baseline = Some(snapshot);
        Some(delta)
    }
}

impl Default for ResultReconciler {
    fn default() -> Self {
        Self::new()
    }
}

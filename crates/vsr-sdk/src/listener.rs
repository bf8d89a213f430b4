//! Listener contracts and the reconciled calls delivered to them.
//!
//! Listeners only ever see reconciled state. Every method has a no-op
//! default so implementations override just what they care about.

use std::fmt;
use ulid::Ulid;
use vsr_core::{overlay, LogicalTime, ResultFragment, ResultSnapshot, Rule, RuleChanges};
use vsr_delta::{merge, Classification, IncomingResult, MergeOutcome};

/// Handle for a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(Ulid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callbacks for a replicated rule set.
pub trait RuleListener: Send + Sync {
    fn rule_added(&self, _rule: &Rule) {}

    fn rule_removed(&self, _rule: &Rule) {}

    fn rules_added(&self, _rules: &[Rule]) {}

    fn rules_removed(&self, _rules: &[Rule]) {}
}

/// Callbacks for a view's computation cycles.
pub trait ViewListener: Send + Sync {
    fn cycle_started(&self, _logical_time: LogicalTime) {}

    /// A full result arrived. `full` is the reconciled baseline; `delta`
    /// holds the targets that changed relative to the previous one.
    fn cycle_completed(&self, _full: &ResultSnapshot, _delta: &ResultFragment) {}

    fn cycle_fragment_completed(&self, _full: &ResultSnapshot, _delta: &ResultFragment) {}

    fn view_definition_compiled(&self) {}

    fn view_definition_compilation_failed(&self, _reason: &str) {}

    fn cycle_execution_failed(&self, _logical_time: LogicalTime, _reason: &str) {}

    fn process_completed(&self) {}

    fn process_terminated(&self, _interrupted: bool) {}

    fn client_shutdown(&self, _reason: Option<&str>) {}
}

/// A queued call that knows how to invoke a listener of type `L`.
pub trait Deliver<L: ?Sized>: Sized + Send + 'static {
    fn deliver(self, listener: &L);

    /// Fold `next` into this call if both can be delivered as one.
    ///
    /// Returns `next` back when the calls must stay separate.
    fn coalesce(&mut self, next: Self) -> Option<Self> {
        Some(next)
    }
}

/// A reconciled rule-set call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleCall {
    Added(Rule),
    Removed(Rule),
    AddedBatch(Vec<Rule>),
    RemovedBatch(Vec<Rule>),
}

impl RuleCall {
    /// Calls describing a net change. Removals come first.
    pub fn from_changes(changes: RuleChanges) -> Vec<RuleCall> {
        let mut calls = Vec::with_capacity(2);
        let RuleChanges {
            mut added,
            mut removed,
        } = changes;

        match removed.len() {
            0 => {}
            1 => calls.extend(removed.pop().map(RuleCall::Removed)),
            _ => calls.push(RuleCall::RemovedBatch(removed)),
        }

        match added.len() {
            0 => {}
            1 => calls.extend(added.pop().map(RuleCall::Added)),
            _ => calls.push(RuleCall::AddedBatch(added)),
        }

        calls
    }
}

impl Deliver<dyn RuleListener> for RuleCall {
    fn deliver(self, listener: &dyn RuleListener) {
        match self {
            RuleCall::Added(rule) => listener.rule_added(&rule),
            RuleCall::Removed(rule) => listener.rule_removed(&rule),
            RuleCall::AddedBatch(rules) => listener.rules_added(&rules),
            RuleCall::RemovedBatch(rules) => listener.rules_removed(&rules),
        }
    }
}

/// A reconciled view call.
#[derive(Clone, Debug, PartialEq)]
pub enum ViewCall {
    Started(LogicalTime),
    Completed {
        full: ResultSnapshot,
        delta: ResultFragment,
    },
    FragmentCompleted {
        full: ResultSnapshot,
        delta: ResultFragment,
    },
    DefinitionCompiled,
    CompilationFailed(String),
    ExecutionFailed {
        logical_time: LogicalTime,
        reason: String,
    },
    ProcessCompleted,
    ProcessTerminated {
        interrupted: bool,
    },
    Shutdown(Option<String>),
}

impl ViewCall {
    pub fn is_result(&self) -> bool {
        matches!(
            self,
            ViewCall::Completed { .. } | ViewCall::FragmentCompleted { .. }
        )
    }
}

/// Fold a queued `(full, delta)` pair with a newer one.
fn fold_result(
    full: &mut ResultSnapshot,
    delta: &mut ResultFragment,
    next_full: ResultSnapshot,
    next_delta: ResultFragment,
) {
    let classification = Classification::of(next_full.logical_time, Some(full.logical_time));
    if let MergeOutcome::Baseline(merged) =
        merge(Some(&*full), &IncomingResult::full(next_full), classification)
    {
        *full = merged;
    }
    delta.values = overlay(&delta.values, &next_delta.values);
    delta.logical_time = delta.logical_time.max(next_delta.logical_time);
}

impl Deliver<dyn ViewListener> for ViewCall {
    fn deliver(self, listener: &dyn ViewListener) {
        match self {
            ViewCall::Started(time) => listener.cycle_started(time),
            ViewCall::Completed { full, delta } => listener.cycle_completed(&full, &delta),
            ViewCall::FragmentCompleted { full, delta } => {
                listener.cycle_fragment_completed(&full, &delta)
            }
            ViewCall::DefinitionCompiled => listener.view_definition_compiled(),
            ViewCall::CompilationFailed(reason) => {
                listener.view_definition_compilation_failed(&reason)
            }
            ViewCall::ExecutionFailed {
                logical_time,
                reason,
            } => listener.cycle_execution_failed(logical_time, &reason),
            ViewCall::ProcessCompleted => listener.process_completed(),
            ViewCall::ProcessTerminated { interrupted } => listener.process_terminated(interrupted),
            ViewCall::Shutdown(reason) => listener.client_shutdown(reason.as_deref()),
        }
    }

    fn coalesce(&mut self, next: Self) -> Option<Self> {
        match (self, next) {
            (
                ViewCall::Completed { full, delta },
                ViewCall::Completed {
                    full: next_full,
                    delta: next_delta,
                },
            ) => {
                fold_result(full, delta, next_full, next_delta);
                None
            }
            (
                ViewCall::FragmentCompleted { full, delta },
                ViewCall::FragmentCompleted {
                    full: next_full,
                    delta: next_delta,
                },
            ) => {
                fold_result(full, delta, next_full, next_delta);
                None
            }
            (_, next) => Some(next),
        }
    }
}

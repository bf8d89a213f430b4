//! Rule-set replication on top of [`VersionedReplica`].
//!
//! In-sequence deltas are merged as `(state ∖ removed) ∪ added`. After a gap
//! the authoritative snapshot replaces the local set and the difference is
//! reported as synthetic added/removed changes.

use crate::replica::{Replicated, VersionRange, VersionedReplica, VersionedSnapshot};
use vsr_core::{ModificationCounter, Rule, RuleChanges, RuleDelta, RuleSet, RuleSnapshot};

impl VersionRange for RuleDelta {
    fn from_version(&self) -> ModificationCounter {
        self.from_version
    }

    fn to_version(&self) -> ModificationCounter {
        self.to_version
    }
}

impl VersionedSnapshot for RuleSnapshot {
    fn version(&self) -> ModificationCounter {
        self.version
    }
}

impl Replicated for RuleSet {
    type Delta = RuleDelta;
    type Snapshot = RuleSnapshot;
    type Effect = RuleChanges;

    fn apply(&mut self, delta: &RuleDelta) -> RuleChanges {
        RuleSet::apply(self, &delta.added, &delta.removed)
    }

    fn replace(&mut self, snapshot: RuleSnapshot) -> RuleChanges {
        RuleSet::replace(self, snapshot.rules)
    }
}

/// Local mirror of a server-authoritative rule set.
pub type RuleSetReplicator = VersionedReplica<RuleSet>;

impl VersionedReplica<RuleSet> {
    pub fn contains(&self, rule: &Rule) -> bool {
        self.state().contains(rule)
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.state().iter()
    }

    /// Current contents as a snapshot, e.g. for handing to a late listener.
    pub fn snapshot(&self) -> RuleSnapshot {
        RuleSnapshot {
            version: self.version(),
            rules: self.state().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{ApplyOutcome, ResyncOutcome};

    fn rules(replica: &RuleSetReplicator) -> Vec<&str> {
        replica.rules().map(Rule::as_str).collect()
    }

    #[test]
    fn test_rule_set_scenario() {
        let mut replica = RuleSetReplicator::seeded(RuleSnapshot::new(5, ["A", "B"]));

        // {A,B}@5 + {5->6, +C} = {A,B,C}@6
        let delta = RuleDelta::new(5, 6).with_added(["C"]);
        let outcome = replica.apply_delta(&delta).unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied(RuleChanges {
                added: vec![Rule::from("C")],
                removed: vec![],
            })
        );
        assert_eq!(rules(&replica), vec!["A", "B", "C"]);
        assert_eq!(replica.version().get(), 6);

        // Redelivery is stale.
        assert_eq!(replica.apply_delta(&delta).unwrap(), ApplyOutcome::Stale);
        assert_eq!(rules(&replica), vec!["A", "B", "C"]);

        // {7->8, -A} skips version 7.
        let gap = RuleDelta::new(7, 8).with_removed(["A"]);
        let outcome = replica.apply_delta(&gap).unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Gap {
                since: ModificationCounter::new(6),
                received_from: ModificationCounter::new(7),
            }
        );

        let outcome = replica.resync(RuleSnapshot::new(8, ["B", "C"]));
        assert_eq!(
            outcome,
            ResyncOutcome::Replaced(RuleChanges {
                added: vec![],
                removed: vec![Rule::from("A")],
            })
        );
        assert_eq!(rules(&replica), vec!["B", "C"]);
        assert_eq!(replica.version().get(), 8);
    }

    #[test]
    fn test_seed_reports_every_rule_as_added() {
        let mut replica = RuleSetReplicator::new();

        let changes = replica.initialize(RuleSnapshot::new(1, ["X", "Y"])).unwrap();

        assert_eq!(changes.added.len(), 2);
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn test_snapshot_round_trips_state() {
        let replica = RuleSetReplicator::seeded(RuleSnapshot::new(4, ["A"]));
        assert_eq!(replica.snapshot(), RuleSnapshot::new(4, ["A"]));
    }
}

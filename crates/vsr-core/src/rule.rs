//! Rule sets replicated from a server-authoritative source.
//!
//! Rules are opaque: the only thing a replica ever asks of a rule is whether
//! it is in the set. The server describes changes as version-ranged deltas
//! and answers resync requests with a full [`RuleSnapshot`].

use crate::counter::ModificationCounter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// An opaque rule, e.g. a "do not retry" entry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rule(String);

impl Rule {
    pub fn new(rule: impl Into<String>) -> Self {
        Self(rule.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rule({})", self.0)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Rule {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Rule {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Incremental change between two versions of a rule set.
///
/// A well-formed delta always covers a non-empty range: `to_version > from_version`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDelta {
    pub from_version: ModificationCounter,
    pub to_version: ModificationCounter,
    #[serde(default)]
    pub added: BTreeSet<Rule>,
    #[serde(default)]
    pub removed: BTreeSet<Rule>,
}

impl RuleDelta {
    pub fn new(from_version: u64, to_version: u64) -> Self {
        Self {
            from_version: ModificationCounter::new(from_version),
            to_version: ModificationCounter::new(to_version),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn with_added<I, R>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Rule>,
    {
        self.added.extend(rules.into_iter().map(Into::into));
        self
    }

    pub fn with_removed<I, R>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Rule>,
    {
        self.removed.extend(rules.into_iter().map(Into::into));
        self
    }

    /// Whether the delta covers a non-empty version range.
    pub fn is_well_formed(&self) -> bool {
        self.to_version > self.from_version
    }
}

/// Authoritative full state of a rule set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub version: ModificationCounter,
    #[serde(default)]
    pub rules: BTreeSet<Rule>,
}

impl RuleSnapshot {
    pub fn new<I, R>(version: u64, rules: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Rule>,
    {
        Self {
            version: ModificationCounter::new(version),
            rules: rules.into_iter().map(Into::into).collect(),
        }
    }
}

/// Net membership change produced by applying a delta or a resync.
///
/// Only rules whose membership actually changed are listed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleChanges {
    pub added: Vec<Rule>,
    pub removed: Vec<Rule>,
}

impl RuleChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set of rules with plain set semantics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: BTreeSet<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.rules.contains(rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// `state' = (state ∖ removed) ∪ added`
    ///
    /// Removing an absent rule and adding a present one are no-ops.
    pub fn apply(&mut self, added: &BTreeSet<Rule>, removed: &BTreeSet<Rule>) -> RuleChanges {
        let mut changes = RuleChanges::default();

        for rule in removed {
            if self.rules.remove(rule) {
                changes.removed.push(rule.clone());
            }
        }
        for rule in added {
            if self.rules.insert(rule.clone()) {
                // A rule removed and re-added by the same delta nets out.
                if let Some(pos) = changes.removed.iter().position(|r| r == rule) {
                    changes.removed.remove(pos);
                } else {
                    changes.added.push(rule.clone());
                }
            }
        }

        changes
    }

    /// Replace the whole set, returning the difference relative to the old one.
    pub fn replace(&mut self, rules: BTreeSet<Rule>) -> RuleChanges {
        let changes = RuleChanges {
            added: rules.difference(&self.rules).cloned().collect(),
            removed: self.rules.difference(&rules).cloned().collect(),
        };
        self.rules = rules;
        changes
    }

    pub fn into_inner(self) -> BTreeSet<Rule> {
        self.rules
    }
}

impl FromIterator<Rule> for RuleSet {
    fn from_iter<T: IntoIterator<Item = Rule>>(iter: T) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

impl From<BTreeSet<Rule>> for RuleSet {
    fn from(rules: BTreeSet<Rule>) -> Self {
        Self { rules }
    }
}

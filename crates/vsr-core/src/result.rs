//! Computation results: full snapshots and partial fragments.
//!
//! Both shapes map targets to computed values at a logical time. A
//! [`ResultSnapshot`] carries every target; a [`ResultFragment`] carries only
//! the targets whose value changed.

use crate::counter::LogicalTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a computation target (a position, a trade, a portfolio node).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A computed value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Double(f64),
    Text(String),
    /// The target could not be computed; carries the reason.
    Failed(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
            Value::Failed(reason) => write!(f, "<failed: {}>", reason),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

/// Target to value map shared by snapshots and fragments.
pub type ResultValues = BTreeMap<TargetId, Value>;

/// `overlay(base, update)`: copy of `base` with every target in `update` overwritten.
pub fn overlay(base: &ResultValues, update: &ResultValues) -> ResultValues {
    let mut merged = base.clone();
    for (target, value) in update {
        merged.insert(target.clone(), value.clone());
    }
    merged
}

fn collect_values<I, T, V>(values: I) -> ResultValues
where
    I: IntoIterator<Item = (T, V)>,
    T: Into<TargetId>,
    V: Into<Value>,
{
    values
        .into_iter()
        .map(|(t, v)| (t.into(), v.into()))
        .collect()
}

/// A full result: every target's current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSnapshot {
    pub logical_time: LogicalTime,
    #[serde(default)]
    pub values: ResultValues,
}

impl ResultSnapshot {
    pub fn new<I, T, V>(logical_time: u64, values: I) -> Self
    where
        I: IntoIterator<Item = (T, V)>,
        T: Into<TargetId>,
        V: Into<Value>,
    {
        Self {
            logical_time: LogicalTime::new(logical_time),
            values: collect_values(values),
        }
    }

    pub fn get(&self, target: &str) -> Option<&Value> {
        self.values.get(&TargetId::from(target))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Targets whose value differs from `previous`, stamped with this snapshot's time.
    ///
    /// Targets that disappeared since `previous` cannot be expressed in a
    /// fragment and are omitted.
    pub fn diff(&self, previous: Option<&ResultSnapshot>) -> ResultFragment {
        let values = match previous {
            None => self.values.clone(),
            Some(prev) => self
                .values
                .iter()
                .filter(|(target, value)| prev.values.get(*target) != Some(*value))
                .map(|(t, v)| (t.clone(), v.clone()))
                .collect(),
        };
        ResultFragment {
            logical_time: self.logical_time,
            values,
        }
    }
}

/// A partial result: only targets whose value changed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFragment {
    pub logical_time: LogicalTime,
    #[serde(default)]
    pub values: ResultValues,
}

impl ResultFragment {
    pub fn new<I, T, V>(logical_time: u64, values: I) -> Self
    where
        I: IntoIterator<Item = (T, V)>,
        T: Into<TargetId>,
        V: Into<Value>,
    {
        Self {
            logical_time: LogicalTime::new(logical_time),
            values: collect_values(values),
        }
    }

    pub fn get(&self, target: &str) -> Option<&Value> {
        self.values.get(&TargetId::from(target))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<ResultSnapshot> for ResultFragment {
    fn from(snapshot: ResultSnapshot) -> Self {
        Self {
            logical_time: snapshot.logical_time,
            values: snapshot.values,
        }
    }
}

//! Named aggregators: registration, per-superstep merge, and visibility.
//!
//! An aggregator is `(name, reducer, persistent)` where the reducer is
//! associative and commutative with an identity. Each registered name owns
//! two cells:
//!
//! - **current** - the in-progress accumulator the ongoing superstep writes
//!   into via `aggregate(name, delta)`;
//! - **previous** - the globally merged value readable by user code, always
//!   one superstep behind the writes.
//!
//! Between supersteps every worker publishes its current cells to the
//! coordination tree, the leader reduces all contributions (folding into
//! the old value for persistent aggregators, replacing it otherwise), and
//! every worker adopts the merged result as its previous cells. Current
//! cells reset to identity when their contribution is taken.

use crate::error::{PregelError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// An associative, commutative reduction with identity.
pub trait AggregatorReducer: Send + Sync {
    fn identity(&self) -> Value;
    fn reduce(&self, left: &Value, right: &Value) -> Value;
}

fn as_number(value: &Value) -> f64 {
    value.as_f64().unwrap_or(0.0)
}

/// Numeric sum with identity 0.
pub struct SumAggregator;

impl AggregatorReducer for SumAggregator {
    fn identity(&self) -> Value {
        Value::from(0.0)
    }

    fn reduce(&self, left: &Value, right: &Value) -> Value {
        Value::from(as_number(left) + as_number(right))
    }
}

/// Numeric maximum; `null` is the identity.
pub struct MaxAggregator;

impl AggregatorReducer for MaxAggregator {
    fn identity(&self) -> Value {
        Value::Null
    }

    fn reduce(&self, left: &Value, right: &Value) -> Value {
        match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => Value::from(l.max(r)),
            (Some(l), None) => Value::from(l),
            (None, Some(r)) => Value::from(r),
            (None, None) => Value::Null,
        }
    }
}

/// Numeric minimum; `null` is the identity.
pub struct MinAggregator;

impl AggregatorReducer for MinAggregator {
    fn identity(&self) -> Value {
        Value::Null
    }

    fn reduce(&self, left: &Value, right: &Value) -> Value {
        match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => Value::from(l.min(r)),
            (Some(l), None) => Value::from(l),
            (None, Some(r)) => Value::from(r),
            (None, None) => Value::Null,
        }
    }
}

/// A registration request produced in `init`.
pub struct AggregatorSpec {
    pub name: String,
    pub reducer: Arc<dyn AggregatorReducer>,
    pub persistent: bool,
}

/// Typed accessor to one aggregator's previous value.
///
/// Handed out at registration so algorithm code reads its own aggregators
/// without re-stating the deserialization at every use site.
pub struct AggregatorHandle<T> {
    name: String,
    _marker: PhantomData<T>,
}

impl<T: serde::de::DeserializeOwned> AggregatorHandle<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read and decode the previous value from a view.
    pub fn read(&self, view: &AggregatorView) -> Result<T> {
        let value = view
            .get(&self.name)
            .cloned()
            .ok_or_else(|| PregelError::UnknownAggregator(self.name.clone()))?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Snapshot of previous values handed to user hooks.
pub type AggregatorView = BTreeMap<String, Value>;

/// Payload of the leader-written `aggregates/<N>/master` node: the merged
/// (post-override) values plus the master halt flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalAggregates {
    pub values: BTreeMap<String, Value>,
    pub halted: bool,
}

struct AggregatorEntry {
    reducer: Arc<dyn AggregatorReducer>,
    persistent: bool,
    current: Value,
    previous: Value,
}

/// Per-worker registry of named aggregators.
pub struct AggregatorRegistry {
    entries: BTreeMap<String, AggregatorEntry>,
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register an aggregator. Idempotent: a name already registered keeps
    /// its existing cells.
    pub fn register(&mut self, spec: AggregatorSpec) {
        self.entries.entry(spec.name).or_insert_with(|| {
            let current = spec.reducer.identity();
            let previous = spec.reducer.identity();
            AggregatorEntry {
                reducer: spec.reducer,
                persistent: spec.persistent,
                current,
                previous,
            }
        });
    }

    /// Merge a delta into the current cell.
    pub fn aggregate(&mut self, name: &str, delta: &Value) -> Result<()> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| PregelError::UnknownAggregator(name.to_string()))?;
        entry.current = entry.reducer.reduce(&entry.current, delta);
        Ok(())
    }

    /// Previous (readable) value of one aggregator.
    pub fn previous(&self, name: &str) -> Option<Value> {
        self.entries.get(name).map(|entry| entry.previous.clone())
    }

    /// Snapshot of all previous values.
    pub fn view(&self) -> AggregatorView {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.previous.clone()))
            .collect()
    }

    /// Take this superstep's contribution: returns the current cells and
    /// resets them to identity.
    pub fn take_contributions(&mut self) -> BTreeMap<String, Value> {
        self.entries
            .iter_mut()
            .map(|(name, entry)| {
                let identity = entry.reducer.identity();
                let contribution = std::mem::replace(&mut entry.current, identity);
                (name.clone(), contribution)
            })
            .collect()
    }

    /// Leader-side global merge over all workers' contributions for one
    /// superstep. Persistent aggregators fold the step merge into the old
    /// previous value; non-persistent ones are replaced by it.
    pub fn merge_global(
        &self,
        contributions: &[BTreeMap<String, Value>],
    ) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|(name, entry)| {
                let mut step_value = entry.reducer.identity();
                for contribution in contributions {
                    if let Some(delta) = contribution.get(name) {
                        step_value = entry.reducer.reduce(&step_value, delta);
                    }
                }
                let merged = if entry.persistent {
                    entry.reducer.reduce(&entry.previous, &step_value)
                } else {
                    step_value
                };
                (name.clone(), merged)
            })
            .collect()
    }

    /// Adopt globally merged values as the previous cells.
    pub fn adopt_previous(&mut self, values: &BTreeMap<String, Value>) {
        for (name, entry) in self.entries.iter_mut() {
            if let Some(value) = values.get(name) {
                entry.previous = value.clone();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

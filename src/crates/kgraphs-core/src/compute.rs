//! The vertex-program contract.
//!
//! Algorithms implement [`ComputeFunction`]. The engine calls `init` once
//! per worker (aggregator registration happens there), `compute` for every
//! active vertex each superstep, and `master_compute` on the elected leader
//! between supersteps. Effects emitted through [`ComputeContext`] - value
//! updates, messages, edge mutations, aggregator deltas, halt votes - are
//! collected per compute thread and applied at the phase boundary, so
//! compute always observes a stable snapshot of its vertex.

use crate::aggregate::{AggregatorHandle, AggregatorReducer, AggregatorSpec, AggregatorView};
use crate::config::PregelConfig;
use crate::error::Result;
use crate::vertex::{Edge, EdgeMutation, VertexId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read-only view of the vertex being computed.
pub struct VertexView<'a> {
    pub id: &'a VertexId,
    pub value: &'a Value,
    pub halted: bool,
}

/// Associative, commutative reduction of messages bound for one
/// destination. Must not be used by algorithms that rely on message
/// multiplicity.
pub trait Combiner: Send + Sync {
    fn combine(&self, left: &Value, right: &Value) -> Value;
}

/// A user algorithm.
pub trait ComputeFunction: Send + Sync {
    /// Called once per worker before the first superstep. Register
    /// aggregators here.
    fn init(&self, _config: &PregelConfig, _ctx: &mut InitContext) -> Result<()> {
        Ok(())
    }

    /// Optional hook before each superstep's compute pass.
    fn pre_superstep(&self, _superstep: i32, _aggregators: &AggregatorView) {}

    /// Optional hook after each superstep's compute pass.
    fn post_superstep(&self, _superstep: i32, _aggregators: &AggregatorView) {}

    /// Compute one vertex for one superstep. `messages` holds everything
    /// sent to this vertex in the previous superstep.
    fn compute(
        &self,
        superstep: i32,
        vertex: &VertexView<'_>,
        messages: &[Value],
        edges: &[Edge],
        ctx: &mut ComputeContext<'_>,
    ) -> Result<()>;

    /// Master program, run on the elected leader between supersteps.
    fn master_compute(&self, _superstep: i32, _ctx: &mut MasterContext) -> Result<()> {
        Ok(())
    }

    /// Value given to a vertex materialized by an inbound message to an id
    /// not present in the input graph.
    fn default_vertex_value(&self) -> Value {
        Value::Null
    }

    /// Combiner applied on inbound bags when `combiner.enabled` is set.
    fn combiner(&self) -> Option<Arc<dyn Combiner>> {
        None
    }
}

/// Registration surface passed to `init`.
pub struct InitContext {
    specs: Vec<AggregatorSpec>,
}

impl InitContext {
    pub(crate) fn new() -> Self {
        Self { specs: Vec::new() }
    }

    /// Register a named aggregator; returns a typed read handle.
    pub fn register_aggregator<T>(
        &mut self,
        name: &str,
        reducer: Arc<dyn AggregatorReducer>,
        persistent: bool,
    ) -> AggregatorHandle<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.specs.push(AggregatorSpec {
            name: name.to_string(),
            reducer,
            persistent,
        });
        AggregatorHandle::new(name)
    }

    pub(crate) fn take_specs(&mut self) -> Vec<AggregatorSpec> {
        std::mem::take(&mut self.specs)
    }
}

/// Effects collected from one compute thread during one superstep.
#[derive(Default)]
pub struct EffectBatch {
    pub value_updates: Vec<(VertexId, Value)>,
    pub messages: Vec<(VertexId, Value)>,
    pub mutations: Vec<EdgeMutation>,
    pub aggregate_deltas: Vec<(String, Value)>,
    pub halt_votes: Vec<VertexId>,
}

impl EffectBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: EffectBatch) {
        self.value_updates.extend(other.value_updates);
        self.messages.extend(other.messages);
        self.mutations.extend(other.mutations);
        self.aggregate_deltas.extend(other.aggregate_deltas);
        self.halt_votes.extend(other.halt_votes);
    }
}

/// Callback surface handed to `compute` for one vertex.
pub struct ComputeContext<'a> {
    superstep: i32,
    vertex: VertexId,
    aggregators: &'a AggregatorView,
    effects: &'a mut EffectBatch,
}

impl<'a> ComputeContext<'a> {
    pub(crate) fn new(
        superstep: i32,
        vertex: VertexId,
        aggregators: &'a AggregatorView,
        effects: &'a mut EffectBatch,
    ) -> Self {
        Self {
            superstep,
            vertex,
            aggregators,
            effects,
        }
    }

    pub fn superstep(&self) -> i32 {
        self.superstep
    }

    /// Stage a new value for this vertex, applied at the phase boundary.
    pub fn set_new_vertex_value(&mut self, value: Value) {
        self.effects
            .value_updates
            .push((self.vertex.clone(), value));
    }

    /// Send a message to any vertex, delivered next superstep.
    /// Self-messages are permitted.
    pub fn send_message_to(&mut self, dest: impl Into<VertexId>, payload: Value) {
        self.effects.messages.push((dest.into(), payload));
    }

    /// Stage a new out-edge from this vertex.
    pub fn add_edge(&mut self, target: impl Into<VertexId>, value: Value) {
        self.effects.mutations.push(EdgeMutation::Add {
            source: self.vertex.clone(),
            target: target.into(),
            value,
        });
    }

    /// Stage removal of every out-edge to `target`.
    pub fn remove_edge(&mut self, target: impl Into<VertexId>) {
        self.effects.mutations.push(EdgeMutation::Remove {
            source: self.vertex.clone(),
            target: target.into(),
        });
    }

    /// Contribute a delta to a registered aggregator.
    pub fn aggregate(&mut self, name: &str, delta: Value) {
        self.effects
            .aggregate_deltas
            .push((name.to_string(), delta));
    }

    /// The globally merged value of an aggregator from the previous
    /// superstep (identity before the first merge).
    pub fn get_aggregated_value(&self, name: &str) -> Value {
        self.aggregators.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Declare this vertex done; any inbound message re-awakens it.
    pub fn vote_to_halt(&mut self) {
        self.effects.halt_votes.push(self.vertex.clone());
    }
}

/// Callback surface for the master program.
pub struct MasterContext {
    values: BTreeMap<String, Value>,
    halted: bool,
}

impl MasterContext {
    pub(crate) fn new(values: BTreeMap<String, Value>) -> Self {
        Self {
            values,
            halted: false,
        }
    }

    /// Globally merged value of an aggregator for the superstep that just
    /// finished.
    pub fn get_aggregated_value(&self, name: &str) -> Value {
        self.values.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Override an aggregator's value; every worker observes the override
    /// in the next superstep.
    pub fn set_aggregated_value(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    /// Force global termination regardless of pending work.
    pub fn halt_computation(&mut self) {
        self.halted = true;
    }

    pub(crate) fn into_parts(self) -> (BTreeMap<String, Value>, bool) {
        (self.values, self.halted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::SumAggregator;
    use serde_json::json;

    #[test]
    fn test_compute_context_records_effects() {
        let aggregators = AggregatorView::new();
        let mut effects = EffectBatch::new();
        let vid = VertexId::new("v1");
        let mut ctx = ComputeContext::new(2, vid.clone(), &aggregators, &mut effects);

        ctx.set_new_vertex_value(json!(0.5));
        ctx.send_message_to("v2", json!(1.0));
        ctx.send_message_to("v1", json!("self"));
        ctx.add_edge("v3", json!(null));
        ctx.remove_edge("v2");
        ctx.aggregate("count", json!(1.0));
        ctx.vote_to_halt();

        assert_eq!(effects.value_updates, vec![(vid.clone(), json!(0.5))]);
        assert_eq!(effects.messages.len(), 2);
        assert_eq!(effects.mutations.len(), 2);
        assert_eq!(effects.aggregate_deltas, vec![("count".into(), json!(1.0))]);
        assert_eq!(effects.halt_votes, vec![vid]);
    }

    #[test]
    fn test_effect_batch_merge() {
        let aggregators = AggregatorView::new();
        let mut left = EffectBatch::new();
        let mut right = EffectBatch::new();
        ComputeContext::new(0, VertexId::new("a"), &aggregators, &mut left)
            .send_message_to("x", json!(1));
        ComputeContext::new(0, VertexId::new("b"), &aggregators, &mut right)
            .send_message_to("y", json!(2));

        left.merge(right);
        assert_eq!(left.messages.len(), 2);
    }

    #[test]
    fn test_master_context_override_and_halt() {
        let mut ctx = MasterContext::new(BTreeMap::from([("sum".to_string(), json!(6.0))]));
        assert_eq!(ctx.get_aggregated_value("sum"), json!(6.0));
        assert_eq!(ctx.get_aggregated_value("missing"), Value::Null);

        ctx.set_aggregated_value("sum", json!(0.0));
        ctx.halt_computation();
        let (values, halted) = ctx.into_parts();
        assert_eq!(values["sum"], json!(0.0));
        assert!(halted);
    }

    #[test]
    fn test_init_context_collects_specs() {
        let mut ctx = InitContext::new();
        let handle: AggregatorHandle<f64> =
            ctx.register_aggregator("total", Arc::new(SumAggregator), true);
        assert_eq!(handle.name(), "total");
        let specs = ctx.take_specs();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].persistent);
    }
}

//! Worker-local message pipeline: outbound partitioning and inbound bags.
//!
//! Outbound messages are buffered per destination partition
//! (`hash(dst) mod P`) and flushed once the worker finishes its send phase.
//! Inbound records drain into per-destination-vertex bags during the
//! receive phase; when the algorithm supplies a combiner, the bag is
//! reduced to a single value on delivery.

use crate::compute::Combiner;
use crate::vertex::{partition_for, VertexId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One user message in flight, tagged with its emission superstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub superstep: i32,
    pub dest: VertexId,
    pub payload: Value,
}

/// A record on the partitioned transport: either a user message or the
/// end-of-step sentinel a sender publishes to every partition after its
/// flush for a superstep is durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportRecord {
    Message(MessageEnvelope),
    EndOfStep { superstep: i32, sender: String },
}

/// Outbound buffers for one send phase, keyed by destination partition.
pub struct OutboundBuffer {
    partitions: Vec<Vec<MessageEnvelope>>,
}

impl OutboundBuffer {
    pub fn new(num_partitions: usize) -> Self {
        Self {
            partitions: (0..num_partitions).map(|_| Vec::new()).collect(),
        }
    }

    /// Buffer a message for `dest`, preserving emission order within the
    /// destination partition.
    pub fn push(&mut self, superstep: i32, dest: VertexId, payload: Value) {
        let partition = partition_for(&dest, self.partitions.len());
        self.partitions[partition].push(MessageEnvelope {
            superstep,
            dest,
            payload,
        });
    }

    pub fn message_count(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    /// Drain all buffers, indexed by partition.
    pub fn take_batches(&mut self) -> Vec<Vec<MessageEnvelope>> {
        let count = self.partitions.len();
        std::mem::replace(
            &mut self.partitions,
            (0..count).map(|_| Vec::new()).collect(),
        )
    }
}

/// Per-destination-vertex message bags for the next superstep.
pub struct InboundBags {
    bags: HashMap<VertexId, Vec<Value>>,
}

impl InboundBags {
    pub fn new() -> Self {
        Self {
            bags: HashMap::new(),
        }
    }

    /// File a delivered payload under its destination. With a combiner the
    /// bag holds exactly one combined value; without one, arrival order per
    /// source is preserved (cross-source order is unspecified).
    pub fn deliver(&mut self, dest: VertexId, payload: Value, combiner: Option<&dyn Combiner>) {
        let bag = self.bags.entry(dest).or_default();
        match combiner {
            Some(combiner) if !bag.is_empty() => {
                let combined = combiner.combine(&bag[0], &payload);
                bag[0] = combined;
            }
            _ => bag.push(payload),
        }
    }

    pub fn has_any(&self) -> bool {
        self.bags.values().any(|bag| !bag.is_empty())
    }

    pub fn destinations(&self) -> impl Iterator<Item = &VertexId> {
        self.bags.keys()
    }

    /// Drain every bag, handing ownership to the compute phase.
    pub fn take_all(&mut self) -> HashMap<VertexId, Vec<Value>> {
        std::mem::take(&mut self.bags)
    }
}

impl Default for InboundBags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct SumCombiner;

    impl Combiner for SumCombiner {
        fn combine(&self, left: &Value, right: &Value) -> Value {
            Value::from(left.as_f64().unwrap_or(0.0) + right.as_f64().unwrap_or(0.0))
        }
    }

    #[test]
    fn test_outbound_partitions_by_destination() {
        let mut buffer = OutboundBuffer::new(4);
        for i in 0..40 {
            buffer.push(0, VertexId::new(format!("v{}", i)), json!(i));
        }
        assert_eq!(buffer.message_count(), 40);

        let batches = buffer.take_batches();
        assert_eq!(batches.len(), 4);
        for (partition, batch) in batches.iter().enumerate() {
            for envelope in batch {
                assert_eq!(partition_for(&envelope.dest, 4), partition);
            }
        }
        assert_eq!(buffer.message_count(), 0);
    }

    #[test]
    fn test_outbound_preserves_emission_order() {
        let mut buffer = OutboundBuffer::new(1);
        buffer.push(2, VertexId::new("x"), json!("first"));
        buffer.push(2, VertexId::new("x"), json!("second"));
        let batches = buffer.take_batches();
        assert_eq!(batches[0][0].payload, json!("first"));
        assert_eq!(batches[0][1].payload, json!("second"));
    }

    #[test]
    fn test_inbound_bags_without_combiner() {
        let mut bags = InboundBags::new();
        bags.deliver(VertexId::new("x"), json!(1), None);
        bags.deliver(VertexId::new("x"), json!(2), None);
        bags.deliver(VertexId::new("y"), json!(3), None);

        let drained = bags.take_all();
        assert_eq!(drained[&VertexId::new("x")], vec![json!(1), json!(2)]);
        assert_eq!(drained[&VertexId::new("y")], vec![json!(3)]);
        assert!(!bags.has_any());
    }

    #[test]
    fn test_inbound_bags_with_combiner() {
        let combiner = SumCombiner;
        let mut bags = InboundBags::new();
        for _ in 0..100 {
            bags.deliver(VertexId::new("x"), json!(1.0), Some(&combiner));
        }
        let drained = bags.take_all();
        assert_eq!(drained[&VertexId::new("x")], vec![json!(100.0)]);
    }

    #[test]
    fn test_transport_record_round_trip() {
        let record = TransportRecord::Message(MessageEnvelope {
            superstep: 3,
            dest: VertexId::new("v"),
            payload: json!({"rank": 0.25}),
        });
        let bytes = serde_json::to_vec(&record).unwrap();
        let decoded: TransportRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, record);
    }
}

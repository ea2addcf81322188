//! Vertex identity, ownership, and the per-worker vertex state store.
//!
//! A vertex is `(value, halted, out-edges)` keyed by [`VertexId`]. Each
//! worker holds exactly the vertices whose partition it owns
//! (`owner(vid) = hash(vid) mod P`), sharded internally by compute thread
//! so per-vertex state needs no locks. Edge mutations issued during compute
//! are staged as [`EdgeMutation`] values and applied atomically at the end
//! of the send phase, so compute always iterates a stable edge snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Opaque vertex identity: hashable, totally ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VertexId(String);

impl VertexId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VertexId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for VertexId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Owning partition of a vertex id.
///
/// FNV-1a over the id bytes: the mapping must be identical on every worker
/// process for the life of a job, so this deliberately avoids `std`'s
/// randomly-seeded hashers.
pub fn partition_for(vid: &VertexId, num_partitions: usize) -> usize {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in vid.as_str().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % num_partitions as u64) as usize
}

/// A directed out-edge owned by its source vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub target: VertexId,
    pub value: Value,
}

impl Edge {
    pub fn new(target: impl Into<VertexId>, value: Value) -> Self {
        Self {
            target: target.into(),
            value,
        }
    }
}

/// Per-vertex state held by the owning worker.
#[derive(Debug, Clone)]
pub struct VertexEntry {
    pub value: Value,
    pub halted: bool,
    pub edges: Vec<Edge>,
}

/// A staged topology change, applied at the end of the send phase.
#[derive(Debug, Clone)]
pub enum EdgeMutation {
    Add {
        source: VertexId,
        target: VertexId,
        value: Value,
    },
    Remove {
        source: VertexId,
        target: VertexId,
    },
    ReplaceAll {
        source: VertexId,
        edges: Vec<Edge>,
    },
}

impl EdgeMutation {
    pub fn source(&self) -> &VertexId {
        match self {
            EdgeMutation::Add { source, .. }
            | EdgeMutation::Remove { source, .. }
            | EdgeMutation::ReplaceAll { source, .. } => source,
        }
    }
}

/// Sharded map `vertexId -> VertexEntry` for one worker.
///
/// Shard assignment uses `hash(vid) mod T`; unlike [`partition_for`] it is
/// worker-local, so the process-seeded `DefaultHasher` is fine here.
pub struct VertexStore {
    shards: Vec<HashMap<VertexId, VertexEntry>>,
}

impl VertexStore {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| HashMap::new()).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(&self, vid: &VertexId) -> usize {
        let mut hasher = DefaultHasher::new();
        vid.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Install a vertex with value and edges, replacing any existing entry.
    pub fn insert(&mut self, vid: VertexId, value: Value, edges: Vec<Edge>) {
        let shard = self.shard_index(&vid);
        self.shards[shard].insert(
            vid,
            VertexEntry {
                value,
                halted: false,
                edges,
            },
        );
    }

    /// Materialize a vertex if absent: default value, no edges, awake.
    /// Returns whether it was created.
    pub fn ensure(&mut self, vid: &VertexId, default_value: &Value) -> bool {
        let shard = self.shard_index(vid);
        if self.shards[shard].contains_key(vid) {
            return false;
        }
        self.shards[shard].insert(
            vid.clone(),
            VertexEntry {
                value: default_value.clone(),
                halted: false,
                edges: Vec::new(),
            },
        );
        true
    }

    pub fn contains(&self, vid: &VertexId) -> bool {
        let shard = self.shard_index(vid);
        self.shards[shard].contains_key(vid)
    }

    pub fn get(&self, vid: &VertexId) -> Option<&VertexEntry> {
        let shard = self.shard_index(vid);
        self.shards[shard].get(vid)
    }

    pub fn get_mut(&mut self, vid: &VertexId) -> Option<&mut VertexEntry> {
        let shard = self.shard_index(vid);
        self.shards[shard].get_mut(vid)
    }

    pub fn set_value(&mut self, vid: &VertexId, value: Value) {
        if let Some(entry) = self.get_mut(vid) {
            entry.value = value;
        }
    }

    pub fn vote_halt(&mut self, vid: &VertexId) {
        if let Some(entry) = self.get_mut(vid) {
            entry.halted = true;
        }
    }

    /// Re-awaken a vertex; message delivery wins over a halt vote.
    pub fn wake(&mut self, vid: &VertexId) {
        if let Some(entry) = self.get_mut(vid) {
            entry.halted = false;
        }
    }

    /// Apply staged topology changes. `Remove` drops every edge to the
    /// target; `Add` permits parallel edges.
    pub fn apply_mutations(&mut self, mutations: Vec<EdgeMutation>) {
        for mutation in mutations {
            match mutation {
                EdgeMutation::Add {
                    source,
                    target,
                    value,
                } => {
                    if let Some(entry) = self.get_mut(&source) {
                        entry.edges.push(Edge { target, value });
                    }
                }
                EdgeMutation::Remove { source, target } => {
                    if let Some(entry) = self.get_mut(&source) {
                        entry.edges.retain(|edge| edge.target != target);
                    }
                }
                EdgeMutation::ReplaceAll { source, edges } => {
                    if let Some(entry) = self.get_mut(&source) {
                        entry.edges = edges;
                    }
                }
            }
        }
    }

    /// Whether any vertex has not voted to halt.
    pub fn any_active(&self) -> bool {
        self.shards
            .iter()
            .any(|shard| shard.values().any(|entry| !entry.halted))
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VertexId, &VertexEntry)> {
        self.shards.iter().flat_map(|shard| shard.iter())
    }

    /// Hand the shards to the compute fan-out; pair with
    /// [`restore_shards`](Self::restore_shards).
    pub fn take_shards(&mut self) -> Vec<HashMap<VertexId, VertexEntry>> {
        std::mem::take(&mut self.shards)
    }

    pub fn restore_shards(&mut self, shards: Vec<HashMap<VertexId, VertexEntry>>) {
        self.shards = shards;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partition_for_is_stable() {
        let vid = VertexId::new("vertex-17");
        let first = partition_for(&vid, 8);
        assert_eq!(first, partition_for(&vid, 8));
        assert!(first < 8);
    }

    #[test]
    fn test_partition_spread() {
        // 100 ids over 4 partitions should touch every partition
        let mut seen = [false; 4];
        for i in 0..100 {
            seen[partition_for(&VertexId::new(format!("v{}", i)), 4)] = true;
        }
        assert!(seen.iter().all(|hit| *hit));
    }

    #[test]
    fn test_insert_and_lookup_across_shards() {
        let mut store = VertexStore::new(4);
        for i in 0..32 {
            store.insert(VertexId::new(format!("v{}", i)), json!(i), Vec::new());
        }
        assert_eq!(store.len(), 32);
        let entry = store.get(&VertexId::new("v7")).unwrap();
        assert_eq!(entry.value, json!(7));
        assert!(!entry.halted);
    }

    #[test]
    fn test_ensure_materializes_default() {
        let mut store = VertexStore::new(2);
        let vid = VertexId::new("emergent");
        assert!(store.ensure(&vid, &json!(0.0)));
        assert!(!store.ensure(&vid, &json!(99.0)));
        let entry = store.get(&vid).unwrap();
        assert_eq!(entry.value, json!(0.0));
        assert!(entry.edges.is_empty());
        assert!(!entry.halted);
    }

    #[test]
    fn test_halt_and_wake() {
        let mut store = VertexStore::new(1);
        let vid = VertexId::new("v");
        store.insert(vid.clone(), json!(null), Vec::new());
        store.vote_halt(&vid);
        assert!(!store.any_active());
        store.wake(&vid);
        assert!(store.any_active());
    }

    #[test]
    fn test_mutations_apply_in_order() {
        let mut store = VertexStore::new(2);
        let vid = VertexId::new("src");
        store.insert(vid.clone(), json!(null), vec![Edge::new("a", json!(1))]);

        store.apply_mutations(vec![
            EdgeMutation::Add {
                source: vid.clone(),
                target: VertexId::new("b"),
                value: json!(2),
            },
            EdgeMutation::Remove {
                source: vid.clone(),
                target: VertexId::new("a"),
            },
        ]);
        let edges = &store.get(&vid).unwrap().edges;
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, VertexId::new("b"));

        store.apply_mutations(vec![EdgeMutation::ReplaceAll {
            source: vid.clone(),
            edges: vec![Edge::new("c", json!(3)), Edge::new("d", json!(4))],
        }]);
        assert_eq!(store.get(&vid).unwrap().edges.len(), 2);
    }

    #[test]
    fn test_mutation_to_missing_vertex_is_ignored() {
        let mut store = VertexStore::new(1);
        store.apply_mutations(vec![EdgeMutation::Add {
            source: VertexId::new("ghost"),
            target: VertexId::new("x"),
            value: json!(null),
        }]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_take_and_restore_shards() {
        let mut store = VertexStore::new(3);
        store.insert(VertexId::new("v"), json!(1), Vec::new());
        let shards = store.take_shards();
        assert_eq!(shards.len(), 3);
        store.restore_shards(shards);
        assert_eq!(store.len(), 1);
    }
}

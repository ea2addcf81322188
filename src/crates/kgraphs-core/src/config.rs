//! Engine configuration.
//!
//! The driver hands workers a flat string-keyed properties map; this module
//! parses it into the typed [`PregelConfig`]. Keys the engine does not
//! recognize are left for the algorithm (algorithms define their own keys),
//! malformed values for recognized keys are configuration errors.

use crate::error::{PregelError, Result};
use crate::paths::{MASTER_MARKER, READY_MARKER};
use std::collections::HashMap;
use std::time::Duration;

pub const JOB_ID: &str = "job.id";
pub const WORKER_ID: &str = "worker.id";
pub const MAX_ITERATIONS: &str = "max.iterations";
pub const NUM_PARTITIONS: &str = "num.partitions";
pub const GROUP_SIZE: &str = "group.size";
pub const COORDINATION_CONNECT: &str = "coordination.connect";
pub const COMBINER_ENABLED: &str = "combiner.enabled";
pub const COMPUTE_THREADS: &str = "compute.threads";
pub const COORDINATION_RETRIES: &str = "coordination.retries";
pub const COORDINATION_BACKOFF_MS: &str = "coordination.backoff.ms";

/// Typed configuration for one worker of a job.
#[derive(Debug, Clone)]
pub struct PregelConfig {
    /// Job identity; becomes the `pregel-<jobId>` subtree name.
    pub job_id: String,
    /// This worker's identity; becomes its marker name in barriers.
    pub worker_id: String,
    /// P in `hash(vid) mod P`.
    pub num_partitions: usize,
    /// Expected worker count G.
    pub group_size: usize,
    /// Forced halt once the superstep counter would reach this bound.
    pub max_iterations: Option<i32>,
    /// Whether the algorithm-provided combiner is applied on inbound bags.
    pub combiner_enabled: bool,
    /// Coordination service endpoints; empty selects an in-process store.
    pub coordination_connect: String,
    /// Vertex-shard parallelism T in `hash(vid) mod T`.
    pub compute_threads: usize,
    /// Retry budget for transient coordination errors.
    pub coordination_retries: u32,
    /// Backoff base for coordination retries.
    pub coordination_backoff: Duration,
    /// Pass-through of the full map for algorithm-defined keys.
    pub properties: HashMap<String, String>,
}

impl PregelConfig {
    /// Parse a properties map. `num.partitions` and `group.size` are
    /// required; everything else has a default.
    pub fn from_properties(properties: HashMap<String, String>) -> Result<Self> {
        let job_id = properties
            .get(JOB_ID)
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let worker_id = properties
            .get(WORKER_ID)
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if worker_id == READY_MARKER || worker_id == MASTER_MARKER {
            return Err(PregelError::Configuration(format!(
                "{} must not be the reserved name '{}'",
                WORKER_ID, worker_id
            )));
        }

        let num_partitions = required_usize(&properties, NUM_PARTITIONS)?;
        let group_size = required_usize(&properties, GROUP_SIZE)?;
        let max_iterations = match properties.get(MAX_ITERATIONS) {
            None => None,
            Some(raw) => {
                let n = parse::<i32>(MAX_ITERATIONS, raw)?;
                if n < 1 {
                    return Err(PregelError::Configuration(format!(
                        "{} must be positive, got {}",
                        MAX_ITERATIONS, n
                    )));
                }
                Some(n)
            }
        };
        let combiner_enabled = match properties.get(COMBINER_ENABLED) {
            None => false,
            Some(raw) => parse::<bool>(COMBINER_ENABLED, raw)?,
        };
        let compute_threads = match properties.get(COMPUTE_THREADS) {
            None => num_cpus::get().max(1),
            Some(raw) => parse::<usize>(COMPUTE_THREADS, raw)?.max(1),
        };
        let coordination_retries = match properties.get(COORDINATION_RETRIES) {
            None => 3,
            Some(raw) => parse::<u32>(COORDINATION_RETRIES, raw)?.max(1),
        };
        let coordination_backoff = match properties.get(COORDINATION_BACKOFF_MS) {
            None => Duration::from_secs(1),
            Some(raw) => Duration::from_millis(parse::<u64>(COORDINATION_BACKOFF_MS, raw)?),
        };
        let coordination_connect = properties
            .get(COORDINATION_CONNECT)
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            job_id,
            worker_id,
            num_partitions,
            group_size,
            max_iterations,
            combiner_enabled,
            coordination_connect,
            compute_threads,
            coordination_retries,
            coordination_backoff,
            properties,
        })
    }

    /// Algorithm-defined property lookup.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

fn required_usize(properties: &HashMap<String, String>, key: &str) -> Result<usize> {
    let raw = properties
        .get(key)
        .ok_or_else(|| PregelError::Configuration(format!("missing required key {}", key)))?;
    let value = parse::<usize>(key, raw)?;
    if value == 0 {
        return Err(PregelError::Configuration(format!(
            "{} must be positive",
            key
        )));
    }
    Ok(value)
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse().map_err(|_| {
        PregelError::Configuration(format!("invalid value '{}' for key {}", raw, key))
    })
}

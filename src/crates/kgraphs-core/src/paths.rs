//! Coordination-tree layout for a job.
//!
//! The path scheme is part of the external interface and interoperates with
//! other clients of the same tree, so it is fixed byte for byte:
//!
//! ```text
//! /kafka-graphs/pregel-<jobId>/
//!     group/                    ephemeral child per live worker, plus `ready`
//!     leader/                   sequential-ephemeral election entries
//!     barriers/snd-<N>/         send-phase markers for superstep N, plus `ready`
//!     barriers/rcv-<N>/         receive-phase markers, plus `ready`
//!     aggregates/<N>/<wid>      per-worker aggregator contributions
//!     aggregates/<N>/master     merged values written by the leader
//! ```

use crate::state::Stage;

/// Root of everything this engine keeps in the coordination tree.
pub const TREE_ROOT: &str = "/kafka-graphs";

/// Name of the per-phase entry marker.
pub const READY_MARKER: &str = "ready";

/// Name of the leader-written merged-aggregates node.
pub const MASTER_MARKER: &str = "master";

/// Prefix of leader-election candidate nodes.
pub const CANDIDATE_PREFIX: &str = "n-";

/// Path factory for one job's subtree.
#[derive(Debug, Clone)]
pub struct JobPaths {
    job_root: String,
}

impl JobPaths {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_root: format!("{}/pregel-{}", TREE_ROOT, job_id),
        }
    }

    /// `/kafka-graphs/pregel-<jobId>`
    pub fn job_root(&self) -> &str {
        &self.job_root
    }

    pub fn group(&self) -> String {
        format!("{}/group", self.job_root)
    }

    pub fn group_ready(&self) -> String {
        format!("{}/group/{}", self.job_root, READY_MARKER)
    }

    pub fn group_member(&self, worker_id: &str) -> String {
        format!("{}/group/{}", self.job_root, worker_id)
    }

    pub fn leader(&self) -> String {
        format!("{}/leader", self.job_root)
    }

    /// Prefix handed to the sequential-ephemeral create for election.
    pub fn leader_candidate(&self) -> String {
        format!("{}/leader/{}", self.job_root, CANDIDATE_PREFIX)
    }

    pub fn barriers(&self) -> String {
        format!("{}/barriers", self.job_root)
    }

    /// `barriers/snd-<N>` or `barriers/rcv-<N>`
    pub fn barrier(&self, stage: Stage, superstep: i32) -> String {
        format!(
            "{}/barriers/{}-{}",
            self.job_root,
            stage.path_tag(),
            superstep
        )
    }

    pub fn barrier_marker(&self, stage: Stage, superstep: i32, worker_id: &str) -> String {
        format!("{}/{}", self.barrier(stage, superstep), worker_id)
    }

    pub fn barrier_ready(&self, stage: Stage, superstep: i32) -> String {
        format!("{}/{}", self.barrier(stage, superstep), READY_MARKER)
    }

    pub fn aggregates(&self) -> String {
        format!("{}/aggregates", self.job_root)
    }

    pub fn aggregates_step(&self, superstep: i32) -> String {
        format!("{}/aggregates/{}", self.job_root, superstep)
    }

    pub fn aggregate_contribution(&self, superstep: i32, worker_id: &str) -> String {
        format!("{}/{}", self.aggregates_step(superstep), worker_id)
    }

    pub fn aggregate_master(&self, superstep: i32) -> String {
        format!("{}/{}", self.aggregates_step(superstep), MASTER_MARKER)
    }
}

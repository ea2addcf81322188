//! Worker lifecycle and the per-superstep compute driver.
//!
//! One [`PregelWorker`] runs per process. The lifecycle is:
//!
//! 1. **Join**: ensure the job subtree, subscribe to it, register an
//!    ephemeral group member and a leader-election candidate, wait for
//!    `group/ready`, snapshot the membership into a rank and a partition
//!    assignment.
//! 2. **Superstep loop**: alternate SEND (compute all active vertices,
//!    apply staged effects, flush messages, publish the aggregator
//!    contribution, mark the barrier) and RECEIVE (drain owned partitions
//!    to sentinel-completeness, announce next-step work, mark the
//!    barrier), crossing phases through [`BarrierProtocol`].
//! 3. **Exit**: when a crossing decides COMPLETED, adopt the final merged
//!    aggregates and return the [`JobResult`].
//!
//! The elected leader additionally merges aggregator contributions and
//! runs the master program between supersteps, and garbage-collects
//! barrier/aggregate subtrees two steps behind the frontier.
//!
//! Any user-callback failure aborts the job and tears the coordination
//! subtree down, which every peer observes as group shrinkage.

use crate::aggregate::{AggregatorRegistry, AggregatorView, GlobalAggregates};
use crate::barrier::BarrierProtocol;
use crate::compute::{
    Combiner, ComputeContext, ComputeFunction, EffectBatch, InitContext, VertexView,
};
use crate::config::PregelConfig;
use crate::error::{PregelError, Result};
use crate::message::{InboundBags, MessageEnvelope, OutboundBuffer, TransportRecord};
use crate::paths::{JobPaths, MASTER_MARKER, READY_MARKER};
use crate::state::{PregelState, Stage, Status};
use crate::transport::MessageTransport;
use crate::vertex::{partition_for, Edge, VertexEntry, VertexId, VertexStore};
use futures::future::join_all;
use kgraphs_coordination::{
    CoordinationClient, CoordinationStore, CreateMode, EventStream,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_stream::StreamExt;

/// Final state of a worker's computation, reported to the controller.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub status: Status,
    pub last_superstep: i32,
    pub aggregators: AggregatorView,
}

/// Partitions owned by the worker at `rank`: `{p : p mod G == rank}`.
fn assigned_partitions(num_partitions: usize, group_size: usize, rank: usize) -> Vec<usize> {
    (0..num_partitions)
        .filter(|partition| partition % group_size == rank)
        .collect()
}

/// One worker of a bulk-synchronous graph computation.
pub struct PregelWorker {
    config: PregelConfig,
    paths: JobPaths,
    client: CoordinationClient,
    protocol: BarrierProtocol,
    transport: Arc<dyn MessageTransport>,
    algorithm: Arc<dyn ComputeFunction>,
    store: VertexStore,
    registry: AggregatorRegistry,
    inbound: InboundBags,
    combiner: Option<Arc<dyn Combiner>>,
    events: Option<EventStream>,
    rank: usize,
    owned_partitions: Vec<usize>,
    is_leader: bool,
}

impl PregelWorker {
    /// Construct a worker. Runs the algorithm's `init` (registering its
    /// aggregators) but touches neither the tree nor the transport.
    pub fn new(
        config: PregelConfig,
        coordination: Arc<dyn CoordinationStore>,
        transport: Arc<dyn MessageTransport>,
        algorithm: Arc<dyn ComputeFunction>,
    ) -> Result<Self> {
        if transport.num_partitions() != config.num_partitions {
            return Err(PregelError::Configuration(format!(
                "transport has {} partitions but num.partitions is {}",
                transport.num_partitions(),
                config.num_partitions
            )));
        }
        let client = CoordinationClient::new(coordination)
            .with_retry_policy(config.coordination_retries, config.coordination_backoff);
        let paths = JobPaths::new(&config.job_id);
        let protocol = BarrierProtocol::new(
            client.clone(),
            paths.clone(),
            config.group_size,
            config.max_iterations,
        );

        let mut registry = AggregatorRegistry::new();
        let mut init_ctx = InitContext::new();
        algorithm
            .init(&config, &mut init_ctx)
            .map_err(|e| PregelError::user_function(-1, "<init>", e.to_string()))?;
        for spec in init_ctx.take_specs() {
            registry.register(spec);
        }
        let combiner = if config.combiner_enabled {
            algorithm.combiner()
        } else {
            None
        };
        let store = VertexStore::new(config.compute_threads);

        Ok(Self {
            config,
            paths,
            client,
            protocol,
            transport,
            algorithm,
            store,
            registry,
            inbound: InboundBags::new(),
            combiner,
            events: None,
            rank: 0,
            owned_partitions: Vec::new(),
            is_leader: false,
        })
    }

    /// Install this worker's partition of the input graph. Ownership is
    /// validated against the partition assignment during join.
    pub fn load_vertices<I>(&mut self, vertices: I)
    where
        I: IntoIterator<Item = (VertexId, Value, Vec<Edge>)>,
    {
        for (vid, value, edges) in vertices {
            self.store.insert(vid, value, edges);
        }
    }

    /// Run the computation to completion.
    pub async fn run(mut self) -> Result<JobResult> {
        let result = self.run_inner().await;
        if let Err(PregelError::UserFunction { .. }) = &result {
            // a failed user callback kills the whole job: tear the
            // coordination subtree down so peers abort via group shrinkage
            if let Err(teardown) = self.client.delete_recursive(self.paths.job_root()).await {
                tracing::error!(error = %teardown, "job teardown after user failure also failed");
            }
        }
        result
    }

    async fn run_inner(&mut self) -> Result<JobResult> {
        self.join().await?;
        let mut state = PregelState::initial().running();
        loop {
            state = match state.stage {
                Stage::Send => self.send_phase(state).await?,
                Stage::Receive => self.receive_phase(state).await?,
            };
            if state.status == Status::Completed {
                tracing::info!(
                    worker = %self.config.worker_id,
                    last_superstep = state.superstep,
                    "computation completed"
                );
                return Ok(JobResult {
                    status: state.status,
                    last_superstep: state.superstep,
                    aggregators: self.registry.view(),
                });
            }
        }
    }

    // ---- join -----------------------------------------------------------

    async fn join(&mut self) -> Result<()> {
        self.client.ensure_path(&self.paths.group()).await?;
        self.client.ensure_path(&self.paths.leader()).await?;
        self.client.ensure_path(&self.paths.barriers()).await?;
        self.client.ensure_path(&self.paths.aggregates()).await?;

        // subscribe before writing our own markers: every later mutation of
        // the job subtree is then observable through this stream
        let events = self.client.subscribe(self.paths.job_root()).await?;
        self.events = Some(events);

        let member_path = self.paths.group_member(&self.config.worker_id);
        match self
            .client
            .create(&member_path, Vec::new(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_node_exists() => {
                return Err(PregelError::job_aborted(format!(
                    "worker id '{}' is already a group member",
                    self.config.worker_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let candidate = self
            .client
            .create(
                &self.paths.leader_candidate(),
                self.config.worker_id.clone().into_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        tracing::debug!(worker = %self.config.worker_id, candidate = %candidate, "registered leader candidate");

        // group/ready appears once the whole group is present; the first
        // worker to observe the full group creates it
        loop {
            if self.client.exists(&self.paths.group_ready()).await? {
                break;
            }
            if self.member_ids().await?.len() >= self.config.group_size {
                self.client
                    .ensure(&self.paths.group_ready(), Vec::new(), CreateMode::Persistent)
                    .await?;
                break;
            }
            self.wait_for_tree_event().await?;
        }

        let members = self.member_ids().await?;
        if members.len() != self.config.group_size {
            return Err(PregelError::job_aborted(format!(
                "group has {} members at snapshot, expected {}",
                members.len(),
                self.config.group_size
            )));
        }
        let rank = members
            .iter()
            .position(|member| member == &self.config.worker_id)
            .ok_or_else(|| {
                PregelError::job_aborted("own group marker missing at membership snapshot")
            })?;
        self.rank = rank;
        self.owned_partitions =
            assigned_partitions(self.config.num_partitions, self.config.group_size, rank);

        // leader: smallest election sequence once every candidate is in
        loop {
            let candidates = self.client.children_or_empty(&self.paths.leader()).await?;
            if candidates.len() >= self.config.group_size {
                let smallest = candidates
                    .first()
                    .cloned()
                    .ok_or_else(|| PregelError::job_aborted("leader subtree empty"))?;
                let leader_path = format!("{}/{}", self.paths.leader(), smallest);
                let leader_id =
                    String::from_utf8_lossy(&self.client.get_data(&leader_path).await?)
                        .to_string();
                self.is_leader = leader_id == self.config.worker_id;
                break;
            }
            self.wait_for_tree_event().await?;
        }

        for (vid, _) in self.store.iter() {
            let partition = partition_for(vid, self.config.num_partitions);
            if !self.owned_partitions.contains(&partition) {
                return Err(PregelError::invariant(
                    vid.to_string(),
                    format!(
                        "vertex belongs to partition {} which rank {} does not own",
                        partition, rank
                    ),
                ));
            }
        }

        tracing::info!(
            worker = %self.config.worker_id,
            rank,
            leader = self.is_leader,
            partitions = ?self.owned_partitions,
            vertices = self.store.len(),
            "joined group"
        );
        Ok(())
    }

    async fn member_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .client
            .children_or_empty(&self.paths.group())
            .await?
            .into_iter()
            .filter(|member| member != READY_MARKER)
            .collect())
    }

    // ---- send phase -----------------------------------------------------

    async fn send_phase(&mut self, state: PregelState) -> Result<PregelState> {
        let superstep = state.superstep;
        self.run_superstep(superstep).await?;
        self.protocol
            .write_phase_marker(Stage::Send, superstep, &self.config.worker_id)
            .await?;
        self.await_receive_ready(state).await
    }

    /// Compute all active vertices, apply staged effects, flush messages,
    /// and publish this worker's aggregator contribution.
    async fn run_superstep(&mut self, superstep: i32) -> Result<()> {
        let aggregators = self.registry.view();
        self.algorithm.pre_superstep(superstep, &aggregators);

        // messages drained in the previous receive phase
        let mut bags = self.inbound.take_all();

        // an inbound message materializes its destination if unknown, and
        // wins over any earlier halt vote
        let default_value = self.algorithm.default_vertex_value();
        for vid in bags.keys() {
            self.store.ensure(vid, &default_value);
            self.store.wake(vid);
        }

        let shard_count = self.store.shard_count();
        let mut shard_bags: Vec<HashMap<VertexId, Vec<Value>>> =
            (0..shard_count).map(|_| HashMap::new()).collect();
        for (vid, bag) in bags.drain() {
            let shard = self.store.shard_index(&vid);
            shard_bags[shard].insert(vid, bag);
        }

        let shards = self.store.take_shards();
        let handles: Vec<_> = shards
            .into_iter()
            .zip(shard_bags)
            .map(|(shard, bags)| {
                let algorithm = self.algorithm.clone();
                let aggregators = aggregators.clone();
                tokio::spawn(compute_shard(shard, bags, superstep, algorithm, aggregators))
            })
            .collect();

        let mut effects = EffectBatch::new();
        let mut restored = Vec::with_capacity(shard_count);
        for joined in join_all(handles).await {
            let (shard, batch) = joined
                .map_err(|e| PregelError::job_aborted(format!("compute task failed: {}", e)))??;
            restored.push(shard);
            effects.merge(batch);
        }
        self.store.restore_shards(restored);

        // staged effects apply atomically at the phase boundary
        let EffectBatch {
            value_updates,
            messages,
            mutations,
            aggregate_deltas,
            halt_votes,
        } = effects;
        for (vid, value) in value_updates {
            self.store.set_value(&vid, value);
        }
        self.store.apply_mutations(mutations);
        for vid in halt_votes {
            self.store.vote_halt(&vid);
        }
        for (name, delta) in aggregate_deltas {
            self.registry.aggregate(&name, &delta)?;
        }

        // flush, then close the epoch on every partition so receivers can
        // drain to completeness independent of barrier timing
        let mut outbound = OutboundBuffer::new(self.config.num_partitions);
        let sent = messages.len();
        for (dest, payload) in messages {
            outbound.push(superstep, dest, payload);
        }
        for (partition, batch) in outbound.take_batches().into_iter().enumerate() {
            if !batch.is_empty() {
                self.transport
                    .publish(
                        partition,
                        batch.into_iter().map(TransportRecord::Message).collect(),
                    )
                    .await?;
            }
        }
        for partition in 0..self.config.num_partitions {
            self.transport
                .publish(
                    partition,
                    vec![TransportRecord::EndOfStep {
                        superstep,
                        sender: self.config.worker_id.clone(),
                    }],
                )
                .await?;
        }

        let contributions = self.registry.take_contributions();
        let payload = serde_json::to_vec(&contributions)?;
        self.client
            .ensure_path(&self.paths.aggregates_step(superstep))
            .await?;
        self.client
            .ensure(
                &self
                    .paths
                    .aggregate_contribution(superstep, &self.config.worker_id),
                payload,
                CreateMode::Persistent,
            )
            .await?;

        self.algorithm.post_superstep(superstep, &self.registry.view());
        tracing::debug!(
            worker = %self.config.worker_id,
            superstep,
            sent,
            vertices = self.store.len(),
            "send phase finished"
        );
        Ok(())
    }

    async fn await_receive_ready(&mut self, state: PregelState) -> Result<PregelState> {
        loop {
            self.check_group().await?;
            let next = self.protocol.maybe_ready_to_receive(state).await?;
            if next.phase() != state.phase() || next.status == Status::Completed {
                return Ok(next);
            }
            self.wait_for_tree_event().await?;
        }
    }

    // ---- receive phase --------------------------------------------------

    async fn receive_phase(&mut self, state: PregelState) -> Result<PregelState> {
        let superstep = state.superstep;
        if superstep >= 0 {
            self.drain_inbound(superstep).await?;
            // announce queued work for the next send phase before our own
            // receive marker, so the completion check cannot miss it
            if self.inbound.has_any() || self.store.any_active() {
                self.protocol
                    .write_phase_marker(Stage::Send, superstep + 1, &self.config.worker_id)
                    .await?;
            }
            self.protocol
                .write_phase_marker(Stage::Receive, superstep, &self.config.worker_id)
                .await?;
        }
        self.await_send_ready(state).await
    }

    /// Drain every owned partition until all group members' end-of-step
    /// sentinels for this superstep have been seen.
    async fn drain_inbound(&mut self, superstep: i32) -> Result<()> {
        let combiner = self.combiner.clone();
        let partitions = self.owned_partitions.clone();
        let mut delivered = 0usize;
        for partition in partitions {
            let mut sentinels = 0usize;
            while sentinels < self.config.group_size {
                for record in self.transport.poll(partition).await? {
                    match record {
                        TransportRecord::Message(MessageEnvelope {
                            superstep: epoch,
                            dest,
                            payload,
                        }) => {
                            if epoch != superstep {
                                return Err(PregelError::invariant(
                                    format!("partition {}", partition),
                                    format!(
                                        "message emitted in superstep {} drained in superstep {}",
                                        epoch, superstep
                                    ),
                                ));
                            }
                            let owner = partition_for(&dest, self.config.num_partitions);
                            if owner != partition {
                                return Err(PregelError::invariant(
                                    dest.to_string(),
                                    format!(
                                        "routed to partition {} but owned by partition {}",
                                        partition, owner
                                    ),
                                ));
                            }
                            self.inbound.deliver(dest, payload, combiner.as_deref());
                            delivered += 1;
                        }
                        TransportRecord::EndOfStep {
                            superstep: epoch,
                            sender,
                        } => {
                            if epoch != superstep {
                                return Err(PregelError::invariant(
                                    format!("partition {}", partition),
                                    format!(
                                        "end-of-step for superstep {} from '{}' drained in superstep {}",
                                        epoch, sender, superstep
                                    ),
                                ));
                            }
                            sentinels += 1;
                        }
                    }
                }
            }
        }
        tracing::debug!(
            worker = %self.config.worker_id,
            rank = self.rank,
            superstep,
            delivered,
            "receive phase drained"
        );
        Ok(())
    }

    async fn await_send_ready(&mut self, state: PregelState) -> Result<PregelState> {
        loop {
            self.check_group().await?;
            if state.superstep >= 0 && self.is_leader {
                self.maybe_master_merge(state.superstep).await?;
            }
            let next = self.protocol.maybe_ready_to_send(state).await?;
            if next.phase() != state.phase() || next.status == Status::Completed {
                if state.superstep >= 0 {
                    if let Some(master) = self.protocol.read_master(state.superstep).await? {
                        self.registry.adopt_previous(&master.values);
                    }
                }
                if next.status != Status::Completed && self.is_leader {
                    self.cleanup_step(state.superstep - 1).await?;
                }
                return Ok(next);
            }
            self.wait_for_tree_event().await?;
        }
    }

    /// Leader duty: once the receive barrier for `superstep` is complete,
    /// reduce all workers' contributions, run the master program, and
    /// publish the result (with the halt flag) exactly once.
    async fn maybe_master_merge(&mut self, superstep: i32) -> Result<()> {
        if !self
            .protocol
            .phase_complete(Stage::Receive, superstep)
            .await?
        {
            return Ok(());
        }
        let master_path = self.paths.aggregate_master(superstep);
        if self.client.exists(&master_path).await? {
            return Ok(());
        }

        let step_dir = self.paths.aggregates_step(superstep);
        let children = self.client.children_or_empty(&step_dir).await?;
        let mut contributions = Vec::new();
        for child in &children {
            if child == MASTER_MARKER {
                continue;
            }
            let bytes = self
                .client
                .get_data(&format!("{}/{}", step_dir, child))
                .await?;
            contributions.push(serde_json::from_slice(&bytes)?);
        }
        if contributions.len() < self.config.group_size {
            return Err(PregelError::invariant(
                step_dir,
                format!(
                    "receive barrier complete but only {} of {} aggregate contributions present",
                    contributions.len(),
                    self.config.group_size
                ),
            ));
        }

        let merged = self.registry.merge_global(&contributions);
        let mut ctx = crate::compute::MasterContext::new(merged);
        self.algorithm
            .master_compute(superstep, &mut ctx)
            .map_err(|e| PregelError::user_function(superstep, "<master>", e.to_string()))?;
        let (values, halted) = ctx.into_parts();
        if halted {
            tracing::info!(superstep, "master signalled halt");
        }
        let payload = serde_json::to_vec(&GlobalAggregates { values, halted })?;
        self.client
            .ensure(&master_path, payload, CreateMode::Persistent)
            .await?;
        Ok(())
    }

    /// Leader duty: drop superstep `step`'s barrier and aggregate subtrees
    /// once no worker can read them anymore (everyone is past step+1's
    /// receive barrier).
    async fn cleanup_step(&self, step: i32) -> Result<()> {
        if step < 0 {
            return Ok(());
        }
        self.client
            .delete_recursive(&self.paths.barrier(Stage::Send, step))
            .await?;
        self.client
            .delete_recursive(&self.paths.barrier(Stage::Receive, step))
            .await?;
        self.client
            .delete_recursive(&self.paths.aggregates_step(step))
            .await?;
        Ok(())
    }

    // ---- shared ---------------------------------------------------------

    /// Group shrinkage below the expected size is fatal. A torn-down job
    /// root reads as zero members.
    async fn check_group(&self) -> Result<()> {
        let members = self.member_ids().await?.len();
        if members < self.config.group_size {
            return Err(PregelError::job_aborted(format!(
                "group shrank to {} members, expected {}",
                members, self.config.group_size
            )));
        }
        Ok(())
    }

    /// Block until anything under the job subtree changes.
    async fn wait_for_tree_event(&mut self) -> Result<()> {
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| PregelError::job_aborted("not subscribed to the job subtree"))?;
        match events.next().await {
            Some(_) => Ok(()),
            None => Err(PregelError::job_aborted(
                "coordination event stream closed",
            )),
        }
    }
}

/// Compute every active vertex of one shard, collecting effects.
///
/// A vertex is active when this is superstep 0, it has inbound messages,
/// or it has not voted to halt.
async fn compute_shard(
    shard: HashMap<VertexId, VertexEntry>,
    mut bags: HashMap<VertexId, Vec<Value>>,
    superstep: i32,
    algorithm: Arc<dyn ComputeFunction>,
    aggregators: AggregatorView,
) -> Result<(HashMap<VertexId, VertexEntry>, EffectBatch)> {
    let mut effects = EffectBatch::new();
    for (vid, entry) in shard.iter() {
        let messages = bags.remove(vid).unwrap_or_default();
        if superstep != 0 && messages.is_empty() && entry.halted {
            continue;
        }
        let vertex = VertexView {
            id: vid,
            value: &entry.value,
            halted: entry.halted,
        };
        let mut ctx = ComputeContext::new(superstep, vid.clone(), &aggregators, &mut effects);
        algorithm
            .compute(superstep, &vertex, &messages, &entry.edges, &mut ctx)
            .map_err(|e| PregelError::user_function(superstep, vid.to_string(), e.to_string()))?;
    }
    Ok((shard, effects))
}

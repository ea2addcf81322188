//! The superstep barrier protocol.
//!
//! Workers agree that a phase is globally complete by counting marker
//! nodes in the coordination tree. The decision logic is two pure
//! functions over a tree snapshot - [`decide_ready_to_send`] and
//! [`decide_ready_to_receive`] - wrapped by [`BarrierProtocol`], which
//! assembles snapshots from the tree and performs the idempotent `ready`
//! creation when a crossing is decided.
//!
//! Invariants:
//!
//! - **Entry**: a worker enters phase `(stage, N)` only once
//!   `barriers/<stage>-<N>/ready` exists. Every worker that decides a
//!   crossing creates the marker itself, idempotently, so the first
//!   observer creates it and the rest find it in place.
//! - **Completion**: a phase is complete exactly when its barrier holds
//!   one marker per group member besides `ready`.
//! - **Monotonicity**: for any snapshot, the returned state is the input
//!   state, its successor, or the input marked completed - never anything
//!   earlier. Re-evaluation on spurious watch fires is therefore safe.
//!
//! Work for superstep `N+1` is announced from the receive side: a worker
//! that drains RECEIVE `N` and still has pending messages or awake
//! vertices writes its marker into `barriers/snd-(N+1)` *before* writing
//! its `rcv-N` marker. If `snd-(N+1)` is absent or empty once `rcv-N` is
//! complete, no worker anywhere has work and the computation is done.

use crate::aggregate::GlobalAggregates;
use crate::error::Result;
use crate::paths::{JobPaths, READY_MARKER};
use crate::state::{PregelState, Stage, Status};
use kgraphs_coordination::{CoordinationClient, CreateMode};

/// Outcome of evaluating a barrier crossing against a tree snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierDecision {
    /// The phase is not globally complete; keep the current state.
    Wait,
    /// Cross into the next phase.
    Advance,
    /// The computation is finished; no further phase begins.
    Complete,
}

/// Snapshot for the RECEIVE `N` -> SEND `N+1` crossing.
#[derive(Debug, Clone, Default)]
pub struct ReceiveCrossingView {
    /// Markers under `barriers/rcv-N`, excluding `ready`.
    pub receive_markers: usize,
    /// Whether `barriers/snd-(N+1)` exists at all.
    pub next_send_exists: bool,
    /// Markers under `barriers/snd-(N+1)`, excluding `ready`.
    pub next_send_markers: usize,
    /// The leader-written merge for superstep `N`, once present.
    pub master: Option<GlobalAggregates>,
}

/// Snapshot for the SEND `N` -> RECEIVE `N` crossing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendCrossingView {
    /// Markers under `barriers/snd-N`, excluding `ready`.
    pub send_markers: usize,
}

/// Decide the RECEIVE -> SEND crossing for `state.superstep = N`.
///
/// Bootstrap (`N < 0`) advances unconditionally. Otherwise the crossing
/// requires all group members' `rcv-N` markers and the leader's merged
/// aggregates; it completes instead of advancing when the master signalled
/// halt, the iteration bound is reached, or no worker announced work for
/// `N+1`.
pub fn decide_ready_to_send(
    state: &PregelState,
    view: &ReceiveCrossingView,
    group_size: usize,
    max_iterations: Option<i32>,
) -> BarrierDecision {
    if state.status == Status::Completed {
        return BarrierDecision::Complete;
    }
    if state.superstep < 0 {
        return BarrierDecision::Advance;
    }
    if view.receive_markers < group_size {
        return BarrierDecision::Wait;
    }
    let Some(master) = &view.master else {
        // the leader has not merged this superstep's aggregates yet
        return BarrierDecision::Wait;
    };
    if master.halted {
        return BarrierDecision::Complete;
    }
    if let Some(max) = max_iterations {
        if state.superstep + 1 >= max {
            return BarrierDecision::Complete;
        }
    }
    if !view.next_send_exists || view.next_send_markers == 0 {
        // nobody queued work for the next send phase
        return BarrierDecision::Complete;
    }
    BarrierDecision::Advance
}

/// Decide the SEND -> RECEIVE crossing for `state.superstep = N`.
///
/// Requires all group members' `snd-N` markers. The iteration bound is
/// honored at this crossing too, so a halt lands at the next barrier
/// regardless of phase.
pub fn decide_ready_to_receive(
    state: &PregelState,
    view: &SendCrossingView,
    group_size: usize,
    max_iterations: Option<i32>,
) -> BarrierDecision {
    if state.status == Status::Completed {
        return BarrierDecision::Complete;
    }
    if let Some(max) = max_iterations {
        if state.superstep >= max {
            return BarrierDecision::Complete;
        }
    }
    if view.send_markers < group_size {
        return BarrierDecision::Wait;
    }
    BarrierDecision::Advance
}

/// Tree-backed barrier evaluation for one worker.
pub struct BarrierProtocol {
    client: CoordinationClient,
    paths: JobPaths,
    group_size: usize,
    max_iterations: Option<i32>,
}

impl BarrierProtocol {
    pub fn new(
        client: CoordinationClient,
        paths: JobPaths,
        group_size: usize,
        max_iterations: Option<i32>,
    ) -> Self {
        Self {
            client,
            paths,
            group_size,
            max_iterations,
        }
    }

    /// Evaluate the RECEIVE -> SEND crossing and, when decided, perform the
    /// idempotent `ready` creation for the next send phase. Monotonic under
    /// repeated invocation.
    pub async fn maybe_ready_to_send(&self, state: PregelState) -> Result<PregelState> {
        let decision = if state.superstep < 0 {
            decide_ready_to_send(
                &state,
                &ReceiveCrossingView::default(),
                self.group_size,
                self.max_iterations,
            )
        } else {
            let view = self.receive_crossing_view(&state).await?;
            decide_ready_to_send(&state, &view, self.group_size, self.max_iterations)
        };
        match decision {
            BarrierDecision::Wait => Ok(state),
            BarrierDecision::Complete => Ok(state.completed()),
            BarrierDecision::Advance => {
                let next = state.superstep + 1;
                self.client
                    .ensure_path(&self.paths.barrier(Stage::Send, next))
                    .await?;
                self.client
                    .ensure(
                        &self.paths.barrier_ready(Stage::Send, next),
                        Vec::new(),
                        CreateMode::Persistent,
                    )
                    .await?;
                Ok(state.next())
            }
        }
    }

    /// Evaluate the SEND -> RECEIVE crossing and, when decided, perform the
    /// idempotent `ready` creation for the receive phase.
    pub async fn maybe_ready_to_receive(&self, state: PregelState) -> Result<PregelState> {
        let view = SendCrossingView {
            send_markers: self
                .non_ready_count(&self.paths.barrier(Stage::Send, state.superstep))
                .await?,
        };
        let decision =
            decide_ready_to_receive(&state, &view, self.group_size, self.max_iterations);
        match decision {
            BarrierDecision::Wait => Ok(state),
            BarrierDecision::Complete => Ok(state.completed()),
            BarrierDecision::Advance => {
                self.client
                    .ensure_path(&self.paths.barrier(Stage::Receive, state.superstep))
                    .await?;
                self.client
                    .ensure(
                        &self.paths.barrier_ready(Stage::Receive, state.superstep),
                        Vec::new(),
                        CreateMode::Persistent,
                    )
                    .await?;
                Ok(state.next())
            }
        }
    }

    /// Write this worker's marker for a phase. Idempotent: a marker that is
    /// already present (a work announcement, or a crash-replayed write)
    /// leaves the global state unchanged.
    pub async fn write_phase_marker(
        &self,
        stage: Stage,
        superstep: i32,
        worker_id: &str,
    ) -> Result<()> {
        self.client
            .ensure_path(&self.paths.barrier(stage, superstep))
            .await?;
        self.client
            .ensure(
                &self.paths.barrier_marker(stage, superstep, worker_id),
                Vec::new(),
                CreateMode::Persistent,
            )
            .await?;
        Ok(())
    }

    /// Whether all group members have written their marker for a phase.
    pub async fn phase_complete(&self, stage: Stage, superstep: i32) -> Result<bool> {
        Ok(self
            .non_ready_count(&self.paths.barrier(stage, superstep))
            .await?
            >= self.group_size)
    }

    /// Read the leader's merged aggregates for a superstep, if written.
    pub async fn read_master(&self, superstep: i32) -> Result<Option<GlobalAggregates>> {
        match self
            .client
            .get_data(&self.paths.aggregate_master(superstep))
            .await
        {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn receive_crossing_view(&self, state: &PregelState) -> Result<ReceiveCrossingView> {
        let receive_markers = self
            .non_ready_count(&self.paths.barrier(Stage::Receive, state.superstep))
            .await?;
        let next_send_path = self.paths.barrier(Stage::Send, state.superstep + 1);
        let next_send_exists = self.client.exists(&next_send_path).await?;
        let next_send_markers = if next_send_exists {
            self.non_ready_count(&next_send_path).await?
        } else {
            0
        };
        let master = self.read_master(state.superstep).await?;
        Ok(ReceiveCrossingView {
            receive_markers,
            next_send_exists,
            next_send_markers,
            master,
        })
    }

    async fn non_ready_count(&self, path: &str) -> Result<usize> {
        Ok(self
            .client
            .children_or_empty(path)
            .await?
            .iter()
            .filter(|child| child.as_str() != READY_MARKER)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn running_at(superstep: i32, stage: Stage) -> PregelState {
        PregelState {
            superstep,
            stage,
            status: Status::Running,
        }
    }

    fn master(halted: bool) -> Option<GlobalAggregates> {
        Some(GlobalAggregates {
            values: BTreeMap::new(),
            halted,
        })
    }

    #[test]
    fn test_bootstrap_advances_unconditionally() {
        let state = PregelState::initial().running();
        let decision =
            decide_ready_to_send(&state, &ReceiveCrossingView::default(), 4, Some(1));
        assert_eq!(decision, BarrierDecision::Advance);
    }

    #[test]
    fn test_send_crossing_waits_below_group_size() {
        let state = running_at(2, Stage::Receive);
        let view = ReceiveCrossingView {
            receive_markers: 2,
            next_send_exists: true,
            next_send_markers: 3,
            master: master(false),
        };
        assert_eq!(
            decide_ready_to_send(&state, &view, 3, None),
            BarrierDecision::Wait
        );
    }

    #[test]
    fn test_send_crossing_waits_for_master_merge() {
        let state = running_at(1, Stage::Receive);
        let view = ReceiveCrossingView {
            receive_markers: 3,
            next_send_exists: true,
            next_send_markers: 3,
            master: None,
        };
        assert_eq!(
            decide_ready_to_send(&state, &view, 3, None),
            BarrierDecision::Wait
        );
    }

    #[test]
    fn test_send_crossing_completes_without_queued_work() {
        let state = running_at(0, Stage::Receive);
        for view in [
            ReceiveCrossingView {
                receive_markers: 2,
                next_send_exists: false,
                next_send_markers: 0,
                master: master(false),
            },
            ReceiveCrossingView {
                receive_markers: 2,
                next_send_exists: true,
                next_send_markers: 0,
                master: master(false),
            },
        ] {
            assert_eq!(
                decide_ready_to_send(&state, &view, 2, None),
                BarrierDecision::Complete
            );
        }
    }

    #[test]
    fn test_send_crossing_completes_on_master_halt() {
        let state = running_at(2, Stage::Receive);
        let view = ReceiveCrossingView {
            receive_markers: 2,
            next_send_exists: true,
            next_send_markers: 2,
            master: master(true),
        };
        assert_eq!(
            decide_ready_to_send(&state, &view, 2, None),
            BarrierDecision::Complete
        );
    }

    #[test]
    fn test_send_crossing_completes_at_iteration_bound() {
        let state = running_at(3, Stage::Receive);
        let view = ReceiveCrossingView {
            receive_markers: 2,
            next_send_exists: true,
            next_send_markers: 2,
            master: master(false),
        };
        assert_eq!(
            decide_ready_to_send(&state, &view, 2, Some(4)),
            BarrierDecision::Complete
        );
        assert_eq!(
            decide_ready_to_send(&state, &view, 2, Some(5)),
            BarrierDecision::Advance
        );
    }

    #[test]
    fn test_receive_crossing_counts_markers() {
        let state = running_at(1, Stage::Send);
        assert_eq!(
            decide_ready_to_receive(&state, &SendCrossingView { send_markers: 1 }, 2, None),
            BarrierDecision::Wait
        );
        assert_eq!(
            decide_ready_to_receive(&state, &SendCrossingView { send_markers: 2 }, 2, None),
            BarrierDecision::Advance
        );
    }

    #[test]
    fn test_receive_crossing_honors_iteration_bound() {
        let state = running_at(4, Stage::Send);
        assert_eq!(
            decide_ready_to_receive(&state, &SendCrossingView { send_markers: 2 }, 2, Some(4)),
            BarrierDecision::Complete
        );
    }

    fn apply_send(state: PregelState, decision: BarrierDecision) -> PregelState {
        match decision {
            BarrierDecision::Wait => state,
            BarrierDecision::Advance => state.next(),
            BarrierDecision::Complete => state.completed(),
        }
    }

    proptest! {
        /// P1: the crossing never moves the state backwards.
        #[test]
        fn prop_send_crossing_is_monotonic(
            superstep in -1i32..20,
            receive_markers in 0usize..9,
            next_send_exists in any::<bool>(),
            next_send_markers in 0usize..9,
            has_master in any::<bool>(),
            halted in any::<bool>(),
            group_size in 1usize..9,
            max_iterations in prop::option::of(1i32..20),
        ) {
            let state = running_at(superstep, Stage::Receive);
            let view = ReceiveCrossingView {
                receive_markers,
                next_send_exists,
                next_send_markers,
                master: if has_master { master(halted) } else { None },
            };
            let decision = decide_ready_to_send(&state, &view, group_size, max_iterations);
            let out = apply_send(state, decision);
            prop_assert!(out.phase() >= state.phase());
        }

        /// Re-evaluating an unchanged snapshot is a no-op: same decision,
        /// and a completed state stays completed.
        #[test]
        fn prop_send_crossing_is_idempotent(
            superstep in -1i32..20,
            receive_markers in 0usize..9,
            next_send_exists in any::<bool>(),
            next_send_markers in 0usize..9,
            halted in any::<bool>(),
            group_size in 1usize..9,
        ) {
            let state = running_at(superstep, Stage::Receive);
            let view = ReceiveCrossingView {
                receive_markers,
                next_send_exists,
                next_send_markers,
                master: master(halted),
            };
            let first = decide_ready_to_send(&state, &view, group_size, None);
            let second = decide_ready_to_send(&state, &view, group_size, None);
            prop_assert_eq!(first, second);

            let completed = state.completed();
            prop_assert_eq!(
                decide_ready_to_send(&completed, &view, group_size, None),
                BarrierDecision::Complete
            );
        }

        /// P1 for the SEND -> RECEIVE crossing.
        #[test]
        fn prop_receive_crossing_is_monotonic(
            superstep in 0i32..20,
            send_markers in 0usize..9,
            group_size in 1usize..9,
            max_iterations in prop::option::of(1i32..20),
        ) {
            let state = running_at(superstep, Stage::Send);
            let view = SendCrossingView { send_markers };
            let decision =
                decide_ready_to_receive(&state, &view, group_size, max_iterations);
            let out = apply_send(state, decision);
            prop_assert!(out.phase() >= state.phase());
        }

        /// A crossing only advances once every member has marked the phase.
        #[test]
        fn prop_no_advance_below_group_size(
            superstep in 0i32..20,
            markers in 0usize..9,
            group_size in 1usize..9,
        ) {
            prop_assume!(markers < group_size);
            let send_state = running_at(superstep, Stage::Receive);
            let view = ReceiveCrossingView {
                receive_markers: markers,
                next_send_exists: true,
                next_send_markers: 1,
                master: master(false),
            };
            prop_assert_eq!(
                decide_ready_to_send(&send_state, &view, group_size, None),
                BarrierDecision::Wait
            );

            let receive_state = running_at(superstep, Stage::Send);
            prop_assert_eq!(
                decide_ready_to_receive(
                    &receive_state,
                    &SendCrossingView { send_markers: markers },
                    group_size,
                    None
                ),
                BarrierDecision::Wait
            );
        }
    }
}

//! Superstep state machine.
//!
//! A worker's position in the computation is the triple
//! `(superstep, stage, status)`. The barrier protocol only ever moves this
//! value forward in lexicographic `(superstep, stage)` order, which is what
//! makes re-evaluation on spurious watch fires safe.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The two sub-phases of a superstep. `Send` (compute + emit) precedes
/// `Receive` (drain + deliver) within the same superstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Send,
    Receive,
}

impl Stage {
    /// Path component used in barrier node names (`snd-<N>` / `rcv-<N>`).
    pub fn path_tag(&self) -> &'static str {
        match self {
            Stage::Send => "snd",
            Stage::Receive => "rcv",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_tag())
    }
}

/// Lifecycle status of the computation as seen by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Constructed, not yet joined to the group.
    Created,
    /// Participating in supersteps.
    Running,
    /// Terminated; no further phases will run.
    Completed,
}

/// Position of a worker in the global superstep sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PregelState {
    pub superstep: i32,
    pub stage: Stage,
    pub status: Status,
}

impl PregelState {
    /// The initial state: `(-1, Receive, Created)`. The bootstrap barrier
    /// crossing advances it to `(0, Send)`.
    pub fn initial() -> Self {
        Self {
            superstep: -1,
            stage: Stage::Receive,
            status: Status::Created,
        }
    }

    /// The same position with `status = Running`.
    pub fn running(self) -> Self {
        Self {
            status: Status::Running,
            ..self
        }
    }

    /// The same position with `status = Completed`.
    pub fn completed(self) -> Self {
        Self {
            status: Status::Completed,
            ..self
        }
    }

    /// Advance one phase: `(N, Send) -> (N, Receive)`,
    /// `(N, Receive) -> (N+1, Send)`.
    pub fn next(self) -> Self {
        match self.stage {
            Stage::Send => Self {
                stage: Stage::Receive,
                ..self
            },
            Stage::Receive => Self {
                superstep: self.superstep + 1,
                stage: Stage::Send,
                ..self
            },
        }
    }

    /// Position key for monotonicity comparisons.
    pub fn phase(&self) -> (i32, Stage) {
        (self.superstep, self.stage)
    }

    fn status_rank(&self) -> u8 {
        match self.status {
            Status::Created => 0,
            Status::Running => 1,
            Status::Completed => 2,
        }
    }
}

impl PartialOrd for PregelState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PregelState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.phase()
            .cmp(&other.phase())
            .then_with(|| self.status_rank().cmp(&other.status_rank()))
    }
}

impl fmt::Display for PregelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} ({:?})",
            self.stage, self.superstep, self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = PregelState::initial();
        assert_eq!(state.superstep, -1);
        assert_eq!(state.stage, Stage::Receive);
        assert_eq!(state.status, Status::Created);
    }

    #[test]
    fn test_next_toggles_and_increments() {
        let state = PregelState::initial().running();
        let send0 = state.next();
        assert_eq!(send0.phase(), (0, Stage::Send));
        let recv0 = send0.next();
        assert_eq!(recv0.phase(), (0, Stage::Receive));
        let send1 = recv0.next();
        assert_eq!(send1.phase(), (1, Stage::Send));
    }

    #[test]
    fn test_lexicographic_order() {
        let initial = PregelState::initial();
        let send0 = initial.next();
        let recv0 = send0.next();
        assert!(initial < send0);
        assert!(send0 < recv0);
        assert!(recv0 < recv0.next());
        // at equal position, completion sorts after running
        assert!(recv0.running() < recv0.completed());
    }

    #[test]
    fn test_status_transitions_keep_position() {
        let state = PregelState::initial().running();
        let done = state.completed();
        assert_eq!(done.phase(), state.phase());
        assert_eq!(done.status, Status::Completed);
    }

    #[test]
    fn test_stage_path_tags() {
        assert_eq!(Stage::Send.path_tag(), "snd");
        assert_eq!(Stage::Receive.path_tag(), "rcv");
    }
}

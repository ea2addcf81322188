//! Error types for the engine.
//!
//! All fallible engine operations return [`Result`]. Coordination and
//! serialization failures convert via `#[from]`; the remaining variants
//! carry the context a job controller needs to distinguish an aborted job
//! from a user-algorithm failure or a broken protocol invariant.

use kgraphs_coordination::CoordinationError;
use thiserror::Error;

/// Convenience result type using [`PregelError`]
pub type Result<T> = std::result::Result<T, PregelError>;

/// Errors raised while running a bulk-synchronous graph computation.
#[derive(Error, Debug)]
pub enum PregelError {
    /// Coordination-tree access failed beyond the retry budget, or the
    /// session expired.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// The message transport rejected or lost a publish/poll.
    #[error("transport error: {0}")]
    Transport(String),

    /// A vertex value, message, or aggregator payload failed to serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration key is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The job was aborted: group shrinkage, lost session, or a peer tore
    /// the job tree down.
    #[error("job aborted: {reason}")]
    JobAborted {
        /// Why the job cannot continue
        reason: String,
    },

    /// A user compute or master callback failed.
    #[error("user function failed at superstep {superstep} on vertex '{vertex}': {error}")]
    UserFunction {
        /// Superstep in which the callback ran
        superstep: i32,
        /// Vertex being computed, or `<master>` for the master program
        vertex: String,
        /// Error reported by the callback
        error: String,
    },

    /// A barrier or ownership invariant broke; carries the tree path or
    /// vertex involved.
    #[error("protocol invariant violated at {path}: {detail}")]
    InvariantViolation {
        /// Coordination path or vertex id involved
        path: String,
        /// What was observed
        detail: String,
    },

    /// An aggregator was used without being registered in `init`.
    #[error("unknown aggregator: {0}")]
    UnknownAggregator(String),
}

impl PregelError {
    /// Create a job-abort error.
    pub fn job_aborted(reason: impl Into<String>) -> Self {
        Self::JobAborted {
            reason: reason.into(),
        }
    }

    /// Create a user-callback error with superstep and vertex context.
    pub fn user_function(
        superstep: i32,
        vertex: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::UserFunction {
            superstep,
            vertex: vertex.into(),
            error: error.into(),
        }
    }

    /// Create an invariant-violation error with path context.
    pub fn invariant(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

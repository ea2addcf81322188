//! Distributed bulk-synchronous-parallel (Pregel-style) graph computation.
//!
//! A directed graph is partitioned across worker processes; a user-supplied
//! vertex program runs in globally synchronized **supersteps**. In each
//! superstep every active vertex consumes the messages sent to it in the
//! previous superstep, may update its value, mutate its out-edges, send
//! messages to arbitrary vertices, contribute to named aggregators, and
//! vote to halt. The computation ends when every vertex has halted and no
//! messages are in flight, when the master program signals halt, or when
//! the configured iteration bound is reached.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── one worker ────────────────────────────┐
//! │ inbound bags ─> compute driver ─> effects (messages, aggregates,   │
//! │      ▲            (sharded)         mutations, values, halt votes) │
//! │      │                                   │                         │
//! │  transport <────── message router <──────┘                         │
//! │      │                                                             │
//! │  barrier protocol <────────> coordination tree <──────> peers      │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each superstep is two phases. In SEND, a worker computes its active
//! vertices and flushes partitioned message batches; in RECEIVE, it drains
//! its partitions into per-vertex bags. Workers agree that a phase is
//! globally complete through marker nodes in the coordination tree
//! ([`barrier`]); the elected leader merges aggregator contributions and
//! runs the master program between supersteps.
//!
//! # Key types
//!
//! - [`PregelWorker`] - lifecycle and superstep loop of one worker
//! - [`ComputeFunction`] - the vertex-program contract
//! - [`PregelConfig`] - typed view of the driver's properties map
//! - [`BarrierProtocol`] - phase-crossing evaluation over the tree
//! - [`AggregatorRegistry`] - named reducers with previous/current cells
//! - [`MessageTransport`] / [`InMemoryMessageTransport`] - the partitioned
//!   log seam and its in-process backend
//!
//! The coordination-tree seam lives in the `kgraphs-coordination` crate;
//! any backend implementing its `CoordinationStore` trait can drive a job.

pub mod aggregate;
pub mod barrier;
pub mod compute;
pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod state;
pub mod transport;
pub mod vertex;
pub mod worker;

pub use aggregate::{
    AggregatorHandle, AggregatorReducer, AggregatorRegistry, AggregatorSpec, AggregatorView,
    GlobalAggregates, MaxAggregator, MinAggregator, SumAggregator,
};
pub use barrier::{
    decide_ready_to_receive, decide_ready_to_send, BarrierDecision, BarrierProtocol,
    ReceiveCrossingView, SendCrossingView,
};
pub use compute::{
    Combiner, ComputeContext, ComputeFunction, EffectBatch, InitContext, MasterContext,
    VertexView,
};
pub use config::PregelConfig;
pub use error::{PregelError, Result};
pub use message::{InboundBags, MessageEnvelope, OutboundBuffer, TransportRecord};
pub use paths::JobPaths;
pub use state::{PregelState, Stage, Status};
pub use transport::{InMemoryMessageTransport, MessageTransport};
pub use vertex::{partition_for, Edge, EdgeMutation, VertexEntry, VertexId, VertexStore};
pub use worker::{JobResult, PregelWorker};

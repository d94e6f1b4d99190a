//! The sluice engine: the query-graph compiler and runtime.
//!
//! Users declare a directed graph of named operators in an SQL-like
//! language. This crate parses the language, runs the bidirectional
//! fixed-point type inference over the graph, and hosts the per-node
//! runtimes: the windowing/aggregation state machine, the source
//! operators, the shared-memory ring-buffer transport between workers,
//! the novelty filter behind `REMEMBER`, and the tuple-export retention
//! used by time-series queries.
//!
//! The control plane (graph ownership, HTTP surface, worker lifecycle)
//! lives in the `sluice-manager` crate; the shared data model in
//! `sluice-types`.

pub mod error;
pub mod eval;
pub mod export;
pub mod lang;
pub mod novelty;
pub mod ringbuf;
pub mod runtime;
pub mod signature;
pub mod typing;
pub mod wire;

pub use error::Error;

/// A runtime tuple: one value per field, in schema wire order.
pub type Tuple = Vec<sluice_types::scalar::ScalarValue>;

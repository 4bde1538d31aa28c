//! Directed graph primitives for the converge resource engine.
//!
//! This crate provides the plain data structure underneath the engine: a
//! directed graph with deterministic iteration order, topological sorting,
//! and reachability queries. It knows nothing about resources, workers, or
//! scheduling; the engine layers those on top.
//!
//! Mutating operations are only called while the engine is paused or under
//! the commit lock, so the structure itself carries no interior locking.
//! Read-only snapshots handed to running workers are shared behind an `Arc`
//! by the caller and stay valid until the next swap.

pub mod graph;

pub use graph::{reverse, Graph, GraphError};

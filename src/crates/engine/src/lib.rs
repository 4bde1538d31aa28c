//! Resource-graph reconciliation engine.
//!
//! This crate continuously reconciles a user-declared DAG of *resources*
//! against observed system state. Each vertex is a self-contained resource
//! with a watch loop, a check-and-apply operation, and metadata controlling
//! retries, rate limits, refresh propagation, grouping, and cross-resource
//! value passing.
//!
//! # Architecture
//!
//! ```text
//!   user graph ──> AutoGroup ──> AutoEdge ──> Commit ──┐
//!                                                      ▼
//!                                             ┌─ running graph ─┐
//!                                             │   one Worker    │
//!                                             │   per vertex    │
//!                                             └─────────────────┘
//!                                                      │
//!              Watch events / pokes ──> Process ──> poke successors
//! ```
//!
//! - Every live vertex is driven by exactly one [`worker`] task, which owns
//!   the vertex's watch loop, retry/delay policy, rate limiting, and
//!   pause/resume handshake.
//! - [`process`] is one reconciliation attempt: back-poke lagging
//!   predecessors, acquire semaphores, transfer send/recv values, compute
//!   refresh, check-and-apply, then poke ready successors.
//! - [`autoedge`] infers dependency edges from the unique identifiers each
//!   resource declares, with transitive reduction and a fingerprint cache.
//! - [`commit`] diffs the running graph against the next one, stopping
//!   removed workers and starting added ones without ever running two
//!   workers for the same vertex.
//!
//! Ordering between vertices is supplied by per-vertex logical timestamps:
//! a vertex never applies before every predecessor carries a strictly
//! greater timestamp. There is no global scheduler queue.

pub mod autoedge;
pub mod autogroup;
pub mod commit;
pub mod config;
pub mod converger;
pub mod engine;
pub mod error;
pub mod events;
pub mod process;
pub mod refresh;
pub mod res;
pub mod semaphore;
pub mod sendrecv;
pub mod state;
pub mod uid;
pub mod worker;
pub mod world;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::Config;
pub use converger::{Converger, ConvergerUID};
pub use engine::{Engine, EngineGraph};
pub use error::{Error, Result};
pub use events::EngineEvent;
pub use process::ProcessOutcome;
pub use res::{
    AutoEdgeMeta, AutoGroupMeta, Edge, EdgeableRes, ExportableRes, GroupableRes, MetaParams,
    RecvableRes, RefreshableRes, ResInit, Resource, ReversibleRes, SendRecvLink, SendableRes,
    Vertex, WatchContext, WatchEvent,
};
pub use uid::{AutoEdgeIter, BaseUID, FirstMatchIter, ResUID};
pub use world::{NoopWorld, ResDelete, ResExport, World};

//! Error types for engine operations.
//!
//! All variants carry `String` payloads so errors are `Clone`: the last
//! terminal error of a worker is stored on its vertex state and read back
//! later by the commit diff (the `rewatch` replacement predicate) and by
//! callers inspecting [`crate::engine::Engine::worker_errors`].
//!
//! Deliberately absent: a back-poke variant. A correctly deferred run is
//! not an error here; it is [`crate::process::ProcessOutcome::Deferred`].

use thiserror::Error;

/// Errors produced by the engine and by resources it drives.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A resource or graph failed validation before running.
    #[error("validation error: {0}")]
    Validation(String),

    /// A resource `init` failed, or its meta params are unusable.
    #[error("init error: {0}")]
    Init(String),

    /// A resource watch failed terminally (retries exhausted).
    #[error("watch error: {0}")]
    Watch(String),

    /// A resource check-apply failed. Counted against the retry budget.
    #[error("resource error: {0}")]
    Resource(String),

    /// Value transfer between resources failed.
    #[error("send/recv error: {0}")]
    SendRecv(String),

    /// Graph-structure error (cycle, missing vertex).
    #[error("graph error: {0}")]
    Graph(String),

    /// Engine lifecycle misuse (commit while running, load after close, ...).
    #[error("engine error: {0}")]
    Engine(String),

    /// Filesystem error while managing per-resource state directories.
    #[error("io error: {0}")]
    Io(String),

    /// The operation was interrupted by shutdown. Treated as a clean exit,
    /// never surfaced as a worker failure.
    #[error("shutdown in progress")]
    ShuttingDown,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<converge_graph::GraphError> for Error {
    fn from(err: converge_graph::GraphError) -> Self {
        Error::Graph(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SendRecv(err.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Engine lifecycle events for observability
//!
//! The engine publishes coarse lifecycle transitions on a broadcast
//! channel: worker start/stop, pause/resume, commits, convergence. Slow
//! subscribers lag rather than block the engine.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Engine lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A vertex worker was spawned
    WorkerStarted { res: String, timestamp: i64 },

    /// A vertex worker finished, cleanly or with a terminal error
    WorkerExited {
        res: String,
        error: Option<String>,
        timestamp: i64,
    },

    /// The engine finished pausing every vertex
    Paused { timestamp: i64 },

    /// The engine resumed every vertex
    Resumed { timestamp: i64 },

    /// A graph swap completed
    Committed {
        added: usize,
        removed: usize,
        kept: usize,
        timestamp: i64,
    },

    /// The cluster-wide converged signal flipped
    Converged { converged: bool, timestamp: i64 },

    /// The engine shut down
    Closed { timestamp: i64 },
}

impl EngineEvent {
    pub fn worker_started(res: impl Into<String>) -> Self {
        Self::WorkerStarted {
            res: res.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn worker_exited(res: impl Into<String>, error: Option<String>) -> Self {
        Self::WorkerExited {
            res: res.into(),
            error,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn paused() -> Self {
        Self::Paused {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn resumed() -> Self {
        Self::Resumed {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn committed(added: usize, removed: usize, kept: usize) -> Self {
        Self::Committed {
            added,
            removed,
            kept,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn converged(converged: bool) -> Self {
        Self::Converged {
            converged,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn closed() -> Self {
        Self::Closed {
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Create the engine's event channel.
pub(crate) fn channel() -> broadcast::Sender<EngineEvent> {
    let (tx, _) = broadcast::channel(128);
    tx
}

//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for persisted per-resource state
    /// (`<prefix>/state/<res-dir>/`).
    pub prefix: PathBuf,

    /// Hostname the engine presents to resources and the world layer.
    pub hostname: String,

    /// Milliseconds of cluster-wide inactivity before the engine reports
    /// converged.
    pub converged_timeout_ms: u64,

    /// Verbose diagnostics passed through to resources.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("/var/lib/converge"),
            hostname: "localhost".to_string(),
            converged_timeout_ms: 5_000,
            debug: false,
        }
    }
}

impl Config {
    pub fn converged_timeout(&self) -> Duration {
        Duration::from_millis(self.converged_timeout_ms)
    }

    /// Directory holding every resource's private state.
    pub fn state_dir(&self) -> PathBuf {
        self.prefix.join("state")
    }
}

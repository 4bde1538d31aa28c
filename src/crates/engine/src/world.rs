//! Interface to the distributed layer.
//!
//! The engine itself is single-host; exported resources are published
//! through whatever [`World`] implementation the embedder wires in. Only
//! the three calls the scheduler needs are declared here.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// One exported resource, addressed to one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResExport {
    pub kind: String,
    pub name: String,
    /// Destination hostname; `"*"` means every host.
    pub host: String,
    /// Encoded resource payload, when the resource supports export.
    pub data: Option<Vec<u8>>,
}

/// Deletion of a previously exported resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResDelete {
    pub kind: String,
    pub name: String,
    pub host: String,
}

/// The distributed backend the scheduler publishes through.
#[async_trait]
pub trait World: Send + Sync + fmt::Debug {
    async fn res_export(&self, exports: Vec<ResExport>) -> Result<()>;

    async fn res_delete(&self, deletes: Vec<ResDelete>) -> Result<()>;

    /// Subscribe to changes of exported resources of one kind. Each message
    /// is a change notification; an `Err` reports a backend problem.
    async fn res_watch(&self, kind: &str) -> Result<mpsc::Receiver<Result<()>>>;
}

/// A world that swallows everything. Used in tests and single-host runs.
#[derive(Debug, Default)]
pub struct NoopWorld;

#[async_trait]
impl World for NoopWorld {
    async fn res_export(&self, _exports: Vec<ResExport>) -> Result<()> {
        Ok(())
    }

    async fn res_delete(&self, _deletes: Vec<ResDelete>) -> Result<()> {
        Ok(())
    }

    async fn res_watch(&self, _kind: &str) -> Result<mpsc::Receiver<Result<()>>> {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_world_accepts_everything() {
        let w = NoopWorld;
        w.res_export(vec![ResExport {
            kind: "file".into(),
            name: "/tmp/x".into(),
            host: "*".into(),
            data: None,
        }])
        .await
        .unwrap();
        w.res_delete(vec![]).await.unwrap();
        let mut rx = w.res_watch("file").await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}

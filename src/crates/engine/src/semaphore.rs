//! Named counting semaphores shared across workers.
//!
//! A resource's `sema` meta param lists semaphore ids; each id names a
//! process-wide counting semaphore sized by the id itself (`"db:3"` admits
//! three holders, `"db"` one). The full list is acquired in lexicographic
//! order and released in reverse at the end of the reconciliation attempt.
//! Acquisition order is deterministic and the vertices run under a DAG, so
//! no pair of semaphores can deadlock across resources.
//!
//! A zero-count semaphore (`"x:0"`) blocks unconditionally. That is the
//! documented trap, not an error.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};

/// Count encoded in a semaphore id: `"id:42"` is 42, `":13"` is 13 (no
/// namespace), a bare `"foo"` is 1. An unparseable suffix is part of the
/// name, not a count.
pub fn sema_size(id: &str) -> usize {
    match id.rsplit_once(':') {
        Some((_, count)) => count.parse().unwrap_or(1),
        None => 1,
    }
}

/// Process-wide pool of named semaphores.
///
/// Entries are created on first use and never removed; the map mutex only
/// guards creation, acquisition itself runs on the shared semaphore.
pub struct SemaphorePool {
    semas: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for SemaphorePool {
    fn default() -> Self {
        Self::new()
    }
}

impl SemaphorePool {
    pub fn new() -> Self {
        Self {
            semas: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, id: &str) -> Arc<Semaphore> {
        let mut semas = self.semas.lock();
        Arc::clone(
            semas
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(sema_size(id)))),
        )
    }

    /// Acquire every id in sorted order, deduplicated. The returned guard
    /// releases in reverse order on drop. Aborts with
    /// [`Error::ShuttingDown`] if `done` fires mid-acquisition.
    pub async fn acquire_all(&self, ids: &[String], done: &CancellationToken) -> Result<SemaGuard> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut permits = Vec::with_capacity(sorted.len());
        for id in sorted {
            let sema = self.get(id);
            trace!(sema = %id, "acquiring semaphore");
            let permit = tokio::select! {
                _ = done.cancelled() => return Err(Error::ShuttingDown),
                permit = sema.acquire_owned() => {
                    permit.map_err(|_| Error::ShuttingDown)?
                }
            };
            permits.push(permit);
        }
        Ok(SemaGuard { permits })
    }
}

/// Holds acquired permits; dropping releases them in reverse order.
pub struct SemaGuard {
    permits: Vec<OwnedSemaphorePermit>,
}

impl SemaGuard {
    pub fn len(&self) -> usize {
        self.permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }
}

impl Drop for SemaGuard {
    fn drop(&mut self) {
        while let Some(permit) = self.permits.pop() {
            drop(permit);
        }
    }
}

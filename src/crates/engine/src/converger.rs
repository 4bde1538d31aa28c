//! Cluster convergence detection.
//!
//! Every vertex state registers two handles: an *activity* handle reset on
//! each event or apply, and a *stale* handle armed once the vertex declares
//! its state OK. The global converged signal becomes true when every
//! registered handle has been stale continuously for the configured
//! timeout. Stopped handles count as stale: a worker that terminated (and
//! unregistered) or a vertex with nothing armed does not hold the cluster
//! hostage.
//!
//! The converger is a regular object threaded into the engine, not a
//! process-wide singleton.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct HandleState {
    /// Armed handles age toward staleness; disarmed ones are stale already.
    armed: bool,
    last: Instant,
}

struct Inner {
    next_id: u64,
    handles: HashMap<u64, HandleState>,
}

/// Folds per-vertex activity into one cluster-wide converged signal.
pub struct Converger {
    timeout: Duration,
    inner: Arc<Mutex<Inner>>,
    status_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Converger {
    pub fn new(timeout: Duration) -> Self {
        let (status_tx, _) = watch::channel(false);
        Self {
            timeout,
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                handles: HashMap::new(),
            })),
            status_tx,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Register a new handle. Handles start disarmed (stale).
    pub fn register(&self) -> ConvergerUID {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handles.insert(
            id,
            HandleState {
                armed: false,
                last: Instant::now(),
            },
        );
        ConvergerUID {
            id,
            inner: Arc::clone(&self.inner),
            status_tx: self.status_tx.clone(),
        }
    }

    /// Watch the converged signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.status_tx.subscribe()
    }

    /// Current converged state.
    pub fn converged(&self) -> bool {
        *self.status_tx.borrow()
    }

    /// Start the background fold task. Must run inside a tokio runtime.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let status_tx = self.status_tx.clone();
        let timeout = self.timeout;
        let shutdown = self.shutdown.clone();
        let tick = (timeout / 4).max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = Instant::now();
                let all_stale = {
                    let inner = inner.lock();
                    inner
                        .handles
                        .values()
                        .all(|h| !h.armed || now.duration_since(h.last) >= timeout)
                };
                let flipped = status_tx.send_if_modified(|v| {
                    if *v != all_stale {
                        *v = all_stale;
                        true
                    } else {
                        false
                    }
                });
                if flipped {
                    debug!(converged = all_stale, "convergence changed");
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop the fold task.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Converger {
    fn drop(&mut self) {
        self.close();
    }
}

/// One registered convergence handle.
///
/// Activity flows in through `reset_timer`; the fold task ages armed
/// handles toward staleness.
#[derive(Clone)]
pub struct ConvergerUID {
    id: u64,
    inner: Arc<Mutex<Inner>>,
    status_tx: watch::Sender<bool>,
}

impl ConvergerUID {
    /// Arm the handle and mark activity now.
    pub fn start_timer(&self) {
        self.touch(true);
    }

    /// Mark activity now, arming if needed.
    pub fn reset_timer(&self) {
        self.touch(true);
    }

    /// Disarm the handle; disarmed handles count as stale.
    pub fn stop_timer(&self) {
        let mut inner = self.inner.lock();
        if let Some(h) = inner.handles.get_mut(&self.id) {
            h.armed = false;
        }
    }

    /// Remove the handle entirely.
    pub fn unregister(&self) {
        let mut inner = self.inner.lock();
        inner.handles.remove(&self.id);
        trace!(id = self.id, "converger handle unregistered");
    }

    fn touch(&self, armed: bool) {
        {
            let mut inner = self.inner.lock();
            if let Some(h) = inner.handles.get_mut(&self.id) {
                h.armed = armed;
                h.last = Instant::now();
            }
        }
        // fresh activity immediately revokes a published converged signal
        self.status_tx.send_if_modified(|v| {
            if *v {
                *v = false;
                true
            } else {
                false
            }
        });
    }
}

//! Per-vertex runtime state.
//!
//! Exactly one [`State`] exists per live vertex: created by the commit
//! add path, destroyed by the remove path. It owns the channels between
//! the watch task, the worker, and the engine; the vertex's logical
//! timestamp; the `state OK` flag; the pause/resume handshake; and the
//! shutdown multiplexer that folds every termination producer into one
//! cancellation token.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use converge_tooling::safepath;

use crate::config::Config;
use crate::converger::{Converger, ConvergerUID};
use crate::error::{Error, Result};
use crate::res::{ResInit, Vertex, WatchEvent};
use crate::world::World;

/// Nanoseconds on a process-wide monotonic clock. Timestamps from
/// different vertices are comparable because they share the anchor.
pub(crate) fn monotonic_nanos() -> i64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_nanos() as i64
}

/// Why a worker is shutting down. The first producer wins; later causes
/// are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownReason {
    /// The watch failed terminally (retries exhausted).
    WatchError,

    /// The watch returned cleanly; nothing left to observe.
    WatchClosed,

    /// Check-apply retries were exhausted.
    ProcessExhausted,

    /// The vertex was removed by a graph swap or engine close.
    Removed,
}

pub(crate) struct State {
    vertex: Vertex,

    /// Last successful apply, monotonic nanoseconds. Strictly increasing
    /// across updates.
    timestamp: RwLock<i64>,

    /// True iff the last check-apply succeeded and no dirtying event has
    /// arrived since.
    is_state_ok: AtomicBool,

    /// The watch delivered its one-time startup signal.
    started: AtomicBool,

    events_tx: mpsc::Sender<WatchEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<WatchEvent>>>,

    /// Buffered capacity 1 with drop-on-full: duplicate pokes collapse.
    poke_tx: mpsc::Sender<()>,
    poke_rx: Mutex<Option<mpsc::Receiver<()>>>,

    /// Engine to worker: please pause (true) / run (false).
    pause_tx: watch::Sender<bool>,

    /// Worker to engine: parked (true) / running (false).
    paused_tx: watch::Sender<bool>,

    done: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,

    /// Last terminal error; read by the commit diff for the rewatch
    /// replacement predicate.
    worker_err: Mutex<Option<Error>>,

    worker_handle: Mutex<Option<JoinHandle<()>>>,
    watch_handle: Mutex<Option<JoinHandle<()>>>,

    /// Activity handle: reset on every event or unconverged check.
    cuid: ConvergerUID,

    /// Staleness handle: armed while the state is OK.
    tuid: ConvergerUID,

    dir: PathBuf,
    reverse_path: Mutex<Option<PathBuf>>,
}

impl State {
    /// Wire up a fresh vertex: channels, converger handles, the state
    /// directory, resource `init`, and the persisted reversal request.
    pub(crate) fn new(
        vertex: Vertex,
        converger: &Converger,
        config: &Config,
        world: Option<Arc<dyn World>>,
        start_paused: bool,
    ) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (poke_tx, poke_rx) = mpsc::channel(1);
        let (pause_tx, _) = watch::channel(start_paused);
        let (paused_tx, _) = watch::channel(false);

        let dir = config
            .state_dir()
            .join(safepath::res_dir_name(&vertex.kind(), &vertex.name()));
        std::fs::create_dir_all(&dir)?;

        let state = Arc::new(Self {
            vertex: vertex.clone(),
            timestamp: RwLock::new(0),
            is_state_ok: AtomicBool::new(false),
            started: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            poke_tx,
            poke_rx: Mutex::new(Some(poke_rx)),
            pause_tx,
            paused_tx,
            done: CancellationToken::new(),
            reason: Mutex::new(None),
            worker_err: Mutex::new(None),
            worker_handle: Mutex::new(None),
            watch_handle: Mutex::new(None),
            cuid: converger.register(),
            tuid: converger.register(),
            dir: dir.clone(),
            reverse_path: Mutex::new(None),
        });

        let init = ResInit {
            hostname: config.hostname.clone(),
            dir,
            debug: config.debug,
            world,
        };
        vertex
            .resource()
            .init(&init)
            .map_err(|e| Error::Init(format!("{vertex}: {e}")))?;

        state.write_reversal()?;
        // a fresh vertex is upcoming work: revoke any converged signal now,
        // before its worker has had a chance to run
        state.activity();
        Ok(state)
    }

    pub(crate) fn vertex(&self) -> &Vertex {
        &self.vertex
    }

    // --- timestamp ---

    pub(crate) fn timestamp(&self) -> i64 {
        *self.timestamp.read()
    }

    /// Advance to now, or by one tick if the clock has not moved. Never
    /// decreases.
    pub(crate) fn update_timestamp(&self) -> i64 {
        let mut ts = self.timestamp.write();
        *ts = monotonic_nanos().max(*ts + 1);
        *ts
    }

    // --- state OK flag / converger plumbing ---

    pub(crate) fn is_state_ok(&self) -> bool {
        self.is_state_ok.load(Ordering::SeqCst)
    }

    /// An event arrived or a recv value landed: state must be re-checked.
    pub(crate) fn set_dirty(&self) {
        self.is_state_ok.store(false, Ordering::SeqCst);
        self.tuid.stop_timer();
    }

    /// A check-apply succeeded with nothing left to do.
    pub(crate) fn mark_state_ok(&self) {
        self.is_state_ok.store(true, Ordering::SeqCst);
        self.tuid.start_timer();
    }

    /// Record vertex activity for convergence detection.
    pub(crate) fn activity(&self) {
        self.cuid.reset_timer();
    }

    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    // --- channels ---

    pub(crate) fn events_tx(&self) -> mpsc::Sender<WatchEvent> {
        self.events_tx.clone()
    }

    pub(crate) fn take_events_rx(&self) -> Option<mpsc::Receiver<WatchEvent>> {
        self.events_rx.lock().take()
    }

    pub(crate) fn take_poke_rx(&self) -> Option<mpsc::Receiver<()>> {
        self.poke_rx.lock().take()
    }

    /// Nonblocking re-check request. A full channel means a poke is
    /// already pending; dropping this one loses nothing.
    pub(crate) fn poke(&self) {
        match self.poke_tx.try_send(()) {
            Ok(()) => trace!(vertex = %self.vertex, "poked"),
            Err(_) => trace!(vertex = %self.vertex, "poke coalesced"),
        }
    }

    // --- pause / resume ---

    /// Ask the worker to pause and wait until it parks (or shuts down).
    pub(crate) async fn pause(&self) {
        let mut paused_rx = self.paused_tx.subscribe();
        self.pause_tx.send_replace(true);
        loop {
            if *paused_rx.borrow_and_update() {
                return;
            }
            tokio::select! {
                _ = self.done.cancelled() => return,
                changed = paused_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Release a paused worker. Does not wait for it to wake.
    pub(crate) fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    /// Worker-side view of the pause request.
    pub(crate) fn pause_rx(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    /// Worker acknowledgement that it parked / woke.
    pub(crate) fn ack_paused(&self, paused: bool) {
        self.paused_tx.send_replace(paused);
    }

    // --- shutdown multiplexer ---

    /// Fold a termination cause into the single done token. First cause
    /// wins.
    pub(crate) fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
                debug!(vertex = %self.vertex, ?reason, "shutdown requested");
            }
        }
        self.done.cancel();
    }

    pub(crate) fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock()
    }

    pub(crate) fn done(&self) -> &CancellationToken {
        &self.done
    }

    // --- worker bookkeeping ---

    pub(crate) fn record_worker_err(&self, err: Error) {
        *self.worker_err.lock() = Some(err);
    }

    pub(crate) fn worker_err(&self) -> Option<Error> {
        self.worker_err.lock().clone()
    }

    pub(crate) fn set_worker_handle(&self, handle: JoinHandle<()>) {
        *self.worker_handle.lock() = Some(handle);
    }

    pub(crate) fn set_watch_handle(&self, handle: JoinHandle<()>) {
        *self.watch_handle.lock() = Some(handle);
    }

    /// Stop everything and release the vertex: cancel, join both tasks,
    /// run resource cleanup, unregister converger handles, remove the
    /// persisted reversal request.
    pub(crate) async fn close(&self) -> Result<()> {
        self.shutdown(ShutdownReason::Removed);
        self.resume(); // unstick a parked worker

        let mut handles = Vec::new();
        if let Some(handle) = self.watch_handle.lock().take() {
            handles.push(handle);
        }
        if let Some(handle) = self.worker_handle.lock().take() {
            handles.push(handle);
        }
        for joined in futures::future::join_all(handles).await {
            let _ = joined;
        }

        self.cuid.unregister();
        self.tuid.unregister();

        let cleanup = self.vertex.resource().cleanup().await;
        self.remove_reversal()?;
        cleanup
    }

    // --- reversal persistence ---

    fn write_reversal(&self) -> Result<()> {
        let Some(rev) = self.vertex.resource().as_reversible() else {
            return Ok(());
        };
        if !rev.reversal_enabled() {
            return Ok(());
        }
        let Some(data) = rev.reversed()? else {
            return Ok(());
        };
        let path = self.dir.join("reverse");
        write_private(&path, data.as_bytes())?;
        *self.reverse_path.lock() = Some(path);
        Ok(())
    }

    fn remove_reversal(&self) -> Result<()> {
        if let Some(path) = self.reverse_path.lock().take() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Write a file readable by the owner only.
fn write_private(path: &std::path::Path, data: &[u8]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        f.write_all(data)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)?;
        Ok(())
    }
}

//! The engine: owns the running graph, the per-vertex states, and the
//! control surface (load, commit, pause, resume, close).
//!
//! Two graphs exist at all times: the *running* one (possibly empty) and
//! the pending *next* one. Graph structure is only mutated by commit while
//! every worker is paused; between a resume and the next pause, workers
//! read an immutable `Arc` snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use converge_graph::Graph;

use crate::autoedge::{self, AutoEdgeCache};
use crate::autogroup;
use crate::commit;
use crate::config::Config;
use crate::converger::Converger;
use crate::error::{Error, Result};
use crate::events::{self, EngineEvent};
use crate::res::{Edge, Vertex};
use crate::semaphore::SemaphorePool;
use crate::state::State;
use crate::world::World;

/// The graph type the engine runs: resource vertices, shared edges.
pub type EngineGraph = Graph<Vertex, Arc<Edge>>;

/// State shared between the engine front and every worker task.
pub(crate) struct EngineShared {
    pub(crate) config: Config,
    graph: RwLock<Arc<EngineGraph>>,
    states: RwLock<HashMap<Vertex, Arc<State>>>,
    pub(crate) semas: SemaphorePool,
    pub(crate) converger: Converger,
    fast_pause: AtomicBool,
    metas: Mutex<HashMap<String, Arc<Mutex<ResMetaState>>>>,
    world: RwLock<Option<Arc<dyn World>>>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
}

/// Per-resource meta state that survives graph swaps (unless `reset`).
pub(crate) struct ResMetaState {
    /// Remaining check-apply retries. Negative means infinite.
    pub(crate) retries: i32,
}

impl EngineShared {
    /// Immutable snapshot of the running graph.
    pub(crate) fn graph(&self) -> Arc<EngineGraph> {
        Arc::clone(&self.graph.read())
    }

    pub(crate) fn set_graph(&self, graph: Arc<EngineGraph>) {
        *self.graph.write() = graph;
    }

    pub(crate) fn world(&self) -> Option<Arc<dyn World>> {
        self.world.read().clone()
    }

    pub(crate) fn state_for(&self, v: &Vertex) -> Option<Arc<State>> {
        self.states.read().get(v).cloned()
    }

    pub(crate) fn insert_state(&self, v: Vertex, state: Arc<State>) {
        self.states.write().insert(v, state);
    }

    /// Remove a state entry, but only if it still holds this exact state.
    /// A replacement vertex shares the map key; its fresh state must
    /// survive the deferred free of the old one.
    pub(crate) fn remove_state_if_same(&self, v: &Vertex, state: &Arc<State>) {
        let mut states = self.states.write();
        if let Some(current) = states.get(v) {
            if Arc::ptr_eq(current, state) {
                states.remove(v);
            }
        }
    }

    /// Nonblocking re-check request for a vertex, if it is live.
    pub(crate) fn poke(&self, v: &Vertex) {
        if let Some(state) = self.state_for(v) {
            state.poke();
        }
    }

    pub(crate) fn fast_pause(&self) -> bool {
        self.fast_pause.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fast_pause(&self, fast: bool) {
        self.fast_pause.store(fast, Ordering::SeqCst);
    }

    /// The persisted retry counter for a vertex, created at its configured
    /// ceiling on first use.
    pub(crate) fn meta_state(&self, v: &Vertex) -> Arc<Mutex<ResMetaState>> {
        let retry = v.resource().meta_params().retry;
        let mut metas = self.metas.lock();
        Arc::clone(metas.entry(v.res_key()).or_insert_with(|| {
            Arc::new(Mutex::new(ResMetaState { retries: retry }))
        }))
    }

    /// Drop accumulated meta state for a vertex (the `reset` meta param).
    pub(crate) fn reset_meta_state(&self, v: &Vertex) {
        self.metas.lock().remove(&v.res_key());
    }

    pub(crate) fn worker_errors(&self) -> HashMap<String, Error> {
        self.states
            .read()
            .iter()
            .filter_map(|(v, s)| s.worker_err().map(|e| (v.res_key(), e)))
            .collect()
    }
}

/// The resource-graph execution engine.
///
/// Lifecycle: [`Engine::new`] then [`Engine::init`] once; per generation,
/// [`Engine::load`] a next graph, optionally [`Engine::auto_group`] /
/// [`Engine::auto_edges`] / [`Engine::apply`] / [`Engine::validate`],
/// [`Engine::commit`] it while paused, then [`Engine::resume`]. Swap by
/// pausing, loading, committing, resuming again. [`Engine::close`] stops
/// everything.
pub struct Engine {
    shared: Arc<EngineShared>,
    next: Option<EngineGraph>,
    autoedge_cache: AutoEdgeCache,
    paused: bool,
    initialized: bool,
    closed: bool,
    converged_task: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let converger = Converger::new(config.converged_timeout());
        let shared = Arc::new(EngineShared {
            config,
            graph: RwLock::new(Arc::new(EngineGraph::with_name("empty"))),
            states: RwLock::new(HashMap::new()),
            semas: SemaphorePool::new(),
            converger,
            fast_pause: AtomicBool::new(false),
            metas: Mutex::new(HashMap::new()),
            world: RwLock::new(None),
            events: events::channel(),
        });
        Self {
            shared,
            next: None,
            autoedge_cache: AutoEdgeCache::default(),
            paused: true,
            initialized: false,
            closed: false,
            converged_task: None,
        }
    }

    /// Wire in a distributed layer for exported resources.
    pub fn with_world(self, world: Arc<dyn World>) -> Self {
        *self.shared.world.write() = Some(world);
        self
    }

    /// One-time startup: create the state directory, start the converger.
    /// Must run inside a tokio runtime.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::Engine("engine already initialized".into()));
        }
        std::fs::create_dir_all(self.shared.config.state_dir())?;
        self.shared.converger.start();

        // forward convergence flips onto the event stream
        let mut rx = self.shared.converger.subscribe();
        let events = self.shared.events.clone();
        self.converged_task = Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let converged = *rx.borrow();
                let _ = events.send(EngineEvent::converged(converged));
            }
        }));

        self.initialized = true;
        info!(prefix = %self.shared.config.prefix.display(), "engine initialized");
        Ok(())
    }

    /// Stage the next graph, replacing any previously staged one.
    pub fn load(&mut self, graph: EngineGraph) {
        debug!(
            vertices = graph.num_vertices(),
            edges = graph.num_edges(),
            "next graph loaded"
        );
        self.next = Some(graph);
    }

    /// Discard the staged graph.
    pub fn abort(&mut self) {
        self.next = None;
    }

    /// Validate the staged graph: meta params, resource validation,
    /// acyclicity.
    pub fn validate(&self) -> Result<()> {
        let next = self
            .next
            .as_ref()
            .ok_or_else(|| Error::Engine("no graph loaded".into()))?;
        next.topological_sort()?;
        for v in next.vertices_sorted() {
            v.resource()
                .meta_params()
                .validate()
                .map_err(|e| Error::Validation(format!("{v}: {e}")))?;
            v.resource()
                .validate()
                .map_err(|e| Error::Validation(format!("{v}: {e}")))?;
        }
        Ok(())
    }

    /// Run an arbitrary transformation on the staged graph.
    pub fn apply<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EngineGraph) -> Result<()>,
    {
        let next = self
            .next
            .as_mut()
            .ok_or_else(|| Error::Engine("no graph loaded".into()))?;
        f(next)
    }

    /// Merge compatible vertices of the staged graph. Returns the number
    /// of merges performed.
    pub fn auto_group(&mut self) -> Result<usize> {
        let next = self
            .next
            .as_mut()
            .ok_or_else(|| Error::Engine("no graph loaded".into()))?;
        autogroup::auto_group(next)
    }

    /// Infer dependency edges on the staged graph from declared unique
    /// identifiers. Returns the number of edges added.
    pub fn auto_edges(&mut self) -> Result<usize> {
        let next = self
            .next
            .as_mut()
            .ok_or_else(|| Error::Engine("no graph loaded".into()))?;
        autoedge::auto_edge(next, &mut self.autoedge_cache)
    }

    /// Swap the staged graph in: stop removed vertices, start added ones,
    /// keep unchanged ones running undisturbed. Requires the engine to be
    /// paused; does not resume.
    pub async fn commit(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::Engine("engine not initialized".into()));
        }
        if self.closed {
            return Err(Error::Engine("engine closed".into()));
        }
        if !self.paused {
            return Err(Error::Engine("commit requires a paused engine".into()));
        }
        let next = self
            .next
            .take()
            .ok_or_else(|| Error::Engine("no graph loaded".into()))?;

        // on error the old graph stays primary
        let stats = commit::graph_sync(&self.shared, next).await?;
        info!(
            added = stats.added,
            removed = stats.removed,
            kept = stats.kept,
            "graph committed"
        );
        let _ = self.shared.events.send(EngineEvent::committed(
            stats.added,
            stats.removed,
            stats.kept,
        ));
        Ok(())
    }

    /// Pause every vertex, in topological order, waiting for each worker
    /// to park. With `fast`, successor pokes are suppressed so the graph
    /// quiesces quickly at the cost of a final propagation wave.
    pub async fn pause(&mut self, fast: bool) -> Result<()> {
        if self.paused {
            return Err(Error::Engine("engine already paused".into()));
        }
        if fast {
            self.shared.set_fast_pause(true);
        }
        let graph = self.shared.graph();
        let order = graph.topological_sort()?;
        for v in &order {
            if let Some(state) = self.shared.state_for(v) {
                state.pause().await;
            }
        }
        self.paused = true;
        let _ = self.shared.events.send(EngineEvent::paused());
        debug!(vertices = order.len(), "engine paused");
        Ok(())
    }

    /// Escalate an in-progress pause cycle to fast-pause. One-way: it
    /// cannot revert to slow-pause until the next resume.
    pub fn set_fast_pause(&self) {
        self.shared.set_fast_pause(true);
    }

    /// Wake every vertex, in reverse topological order.
    pub async fn resume(&mut self) -> Result<()> {
        if !self.paused {
            return Err(Error::Engine("engine not paused".into()));
        }
        self.shared.set_fast_pause(false);
        let graph = self.shared.graph();
        let order = converge_graph::reverse(&graph.topological_sort()?);
        for v in &order {
            if let Some(state) = self.shared.state_for(v) {
                state.resume();
                // resuming is activity: convergence restarts from here
                state.activity();
            }
        }
        self.paused = false;
        let _ = self.shared.events.send(EngineEvent::resumed());
        debug!(vertices = order.len(), "engine resumed");
        Ok(())
    }

    /// Stop everything: commit an empty graph (stopping every worker),
    /// then shut the converger down.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.paused {
            self.pause(false).await?;
        }
        self.next = None;
        let result = commit::graph_sync(&self.shared, EngineGraph::with_name("closed")).await;

        if let Some(task) = self.converged_task.take() {
            task.abort();
        }
        self.shared.converger.close();
        self.closed = true;
        let _ = self.shared.events.send(EngineEvent::closed());
        info!("engine closed");
        result.map(|_| ())
    }

    /// Snapshot of the running graph.
    pub fn graph(&self) -> Arc<EngineGraph> {
        self.shared.graph()
    }

    /// Watch the cluster-wide converged signal.
    pub fn converged(&self) -> watch::Receiver<bool> {
        self.shared.converger.subscribe()
    }

    /// Wait until the engine converges, up to `timeout`. Returns whether
    /// it did.
    pub async fn wait_converged(&self, timeout: std::time::Duration) -> bool {
        let mut rx = self.shared.converger.subscribe();
        if *rx.borrow_and_update() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if *rx.borrow_and_update() {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Subscribe to engine lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Terminal errors of failed workers, by `kind[name]`.
    pub fn worker_errors(&self) -> HashMap<String, Error> {
        self.shared.worker_errors()
    }

    /// Whether the engine is currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

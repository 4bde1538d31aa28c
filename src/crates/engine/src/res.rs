//! The resource interface set.
//!
//! A resource is any value implementing [`Resource`]: identity, meta
//! params, a long-running [`Resource::watch`] that emits events, and an
//! idempotent [`Resource::check_apply`]. Optional capabilities (refresh,
//! send/recv, grouping, edge inference, reversal, export) are separate
//! traits discovered through the `as_*` accessors, the trait-object
//! equivalent of a runtime capability query.
//!
//! The engine consumes only these surfaces; concrete resource
//! implementations live outside this crate.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::uid::{AutoEdgeIter, ResUID};
use crate::world::World;

/// Per-resource configuration controlling how the engine drives it.
///
/// Defaults are the permissive ones: no noop, no retries, no delay,
/// unlimited rate, no polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaParams {
    /// Skip mutations: check runs, apply never does.
    pub noop: bool,

    /// Allowed check-apply failures before the worker dies. Negative means
    /// infinite, zero means fail on the first error.
    pub retry: i32,

    /// Milliseconds to wait between retry attempts.
    pub delay: u64,

    /// Restore the retry counter to its ceiling after a success.
    pub retry_reset: bool,

    /// Maximum event rate in events per second. Infinite disables limiting.
    #[serde(with = "rate_serde")]
    pub limit: f64,

    /// Token bucket size for the rate limit.
    pub burst: usize,

    /// Seconds between synthetic events; nonzero replaces the watch with a
    /// timer.
    pub poll: u32,

    /// Named semaphores (`"name"`, `"name:3"`, `":3"`) held around each
    /// reconciliation attempt.
    pub sema: Vec<String>,

    /// Hostnames this resource is exported to.
    pub export: Vec<String>,

    /// On a graph swap, treat this vertex as changed if its previous worker
    /// errored, so it gets replaced and restarted.
    pub rewatch: bool,

    /// Drop accumulated meta state (persisted retry counters) on swap.
    pub reset: bool,
}

impl Default for MetaParams {
    fn default() -> Self {
        Self {
            noop: false,
            retry: 0,
            delay: 0,
            retry_reset: false,
            limit: f64::INFINITY,
            burst: 0,
            poll: 0,
            sema: Vec::new(),
            export: Vec::new(),
            rewatch: false,
            reset: false,
        }
    }
}

impl MetaParams {
    /// Check the params for combinations that can never run.
    pub fn validate(&self) -> Result<()> {
        if self.limit.is_nan() || self.limit < 0.0 {
            return Err(Error::Validation(format!(
                "invalid rate limit: {}",
                self.limit
            )));
        }
        if self.burst == 0 && self.limit.is_finite() {
            // zero burst with a finite rate admits no events, ever
            return Err(Error::Validation(
                "finite limit with zero burst permanently blocks the resource".into(),
            ));
        }
        Ok(())
    }
}

/// JSON has no Infinity; a missing or null limit round-trips as unlimited.
mod rate_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(limit: &f64, s: S) -> Result<S::Ok, S::Error> {
        if limit.is_infinite() {
            s.serialize_none()
        } else {
            s.serialize_some(limit)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let v: Option<f64> = Option::deserialize(d)?;
        Ok(v.unwrap_or(f64::INFINITY))
    }
}

/// Signals a watch sends to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// One-time startup signal: the watch is live and the initial state
    /// should be checked.
    Running,

    /// Something changed; re-check.
    Changed,
}

/// Handle given to [`Resource::watch`] for emitting events.
///
/// The watch must call [`WatchContext::running`] exactly once when its event
/// source is established, then [`WatchContext::event`] on every change, and
/// must return promptly once [`WatchContext::done`] fires.
#[derive(Debug, Clone)]
pub struct WatchContext {
    events: mpsc::Sender<WatchEvent>,
    done: CancellationToken,
}

impl WatchContext {
    pub(crate) fn new(events: mpsc::Sender<WatchEvent>, done: CancellationToken) -> Self {
        Self { events, done }
    }

    /// Send the one-time startup signal.
    pub async fn running(&self) -> Result<()> {
        self.send(WatchEvent::Running).await
    }

    /// Send a change event.
    pub async fn event(&self) -> Result<()> {
        self.send(WatchEvent::Changed).await
    }

    /// Cancellation signal the watch must honor at every suspension point.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    async fn send(&self, event: WatchEvent) -> Result<()> {
        tokio::select! {
            _ = self.done.cancelled() => Err(Error::ShuttingDown),
            sent = self.events.send(event) => sent.map_err(|_| Error::ShuttingDown),
        }
    }
}

/// Handles passed to [`Resource::init`] when a vertex is brought up.
#[derive(Debug, Clone)]
pub struct ResInit {
    /// Hostname the engine runs as.
    pub hostname: String,

    /// Private state directory for this resource, created before `init`.
    pub dir: PathBuf,

    /// Verbose-diagnostics flag from the engine config.
    pub debug: bool,

    /// Distributed layer, when one is wired in.
    pub world: Option<Arc<dyn World>>,
}

/// A managed piece of system state.
#[async_trait]
pub trait Resource: Send + Sync + fmt::Debug {
    /// Resource kind, e.g. `"file"`. Kinds namespace names: two resources
    /// are the same vertex identity iff kind and name both match.
    fn kind(&self) -> &str;

    /// Unique name within the kind.
    fn name(&self) -> String;

    fn meta_params(&self) -> MetaParams;

    /// Replace the meta params. Called before the engine runs (grouping
    /// unions semaphores onto the merge parent), never while live.
    fn set_meta_params(&self, params: MetaParams);

    /// Static validation; run before `init`, and re-run after a recv value
    /// lands a new field value.
    fn validate(&self) -> Result<()>;

    /// One-time setup with engine handles. Runs before the worker starts.
    fn init(&self, init: &ResInit) -> Result<()>;

    /// Teardown, after the worker has fully stopped.
    async fn cleanup(&self) -> Result<()>;

    /// Long-running event producer. Must emit `running` once, then `event`
    /// per change, and return when `ctx.done()` fires. An `Err` return is
    /// counted against the retry budget; `Ok` ends the worker cleanly.
    async fn watch(&self, ctx: WatchContext) -> Result<()>;

    /// One reconciliation: report whether observed state already matches
    /// desired state, applying the difference when `apply` is true. With
    /// `apply == false` it must never mutate. `Ok(true)` means converged.
    ///
    /// (The classic contract violation of reporting success *and* an error
    /// at once is unrepresentable here.)
    async fn check_apply(&self, done: &CancellationToken, apply: bool) -> Result<bool>;

    /// Value comparison against another resource of any kind. Used by the
    /// commit diff to detect changed vertices; `false` for foreign kinds.
    fn cmp(&self, other: &dyn Resource) -> bool;

    fn as_any(&self) -> &dyn Any;

    // capability discovery

    fn as_refreshable(&self) -> Option<&dyn RefreshableRes> {
        None
    }

    fn as_sendable(&self) -> Option<&dyn SendableRes> {
        None
    }

    fn as_recvable(&self) -> Option<&dyn RecvableRes> {
        None
    }

    fn as_groupable(&self) -> Option<&dyn GroupableRes> {
        None
    }

    fn as_edgeable(&self) -> Option<&dyn EdgeableRes> {
        None
    }

    fn as_reversible(&self) -> Option<&dyn ReversibleRes> {
        None
    }

    fn as_exportable(&self) -> Option<&dyn ExportableRes> {
        None
    }
}

/// Consumes the refresh signal carried on notify edges.
pub trait RefreshableRes: Send + Sync {
    /// Whether a refresh is currently flagged on this resource.
    fn refresh(&self) -> bool;

    /// Flag or clear the pending refresh.
    fn set_refresh(&self, refresh: bool);
}

/// Publishes a snapshot of output values other resources may receive.
pub trait SendableRes: Send + Sync {
    /// JSON object of published fields, or `None` before the first apply.
    fn sent(&self) -> Option<serde_json::Value>;
}

/// One receiver-field wiring: where the value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRecvLink {
    /// Sender vertex kind.
    pub kind: String,

    /// Sender vertex name.
    pub name: String,

    /// Field key in the sender's published snapshot.
    pub key: String,
}

/// Receives values published by other resources.
///
/// Fields are addressed by name; the engine compares the sender's published
/// value against the receiver's current one, copies on mismatch, flags the
/// change, and re-validates the receiver.
pub trait RecvableRes: Send + Sync {
    /// The receive wiring: receiver field name to source link.
    fn recv(&self) -> BTreeMap<String, SendRecvLink>;

    /// Current value of a receivable field.
    fn recv_value(&self, field: &str) -> Option<serde_json::Value>;

    /// Overwrite a receivable field with the sender's value.
    fn set_recv_value(&self, field: &str, value: serde_json::Value) -> Result<()>;

    /// Record that `field` changed in the last transfer, so check-apply can
    /// react to exactly the inputs that moved. Optional.
    fn set_changed(&self, _field: &str, _changed: bool) {}
}

/// Grouping hints for [`GroupableRes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoGroupMeta {
    /// Exclude this resource from grouping.
    pub disabled: bool,
}

/// May be merged with compatible peers before the engine runs.
pub trait GroupableRes: Send + Sync {
    fn auto_group_meta(&self) -> AutoGroupMeta;

    /// Whether this resource accepts being merged with `other`.
    fn group_cmp(&self, other: &dyn GroupableRes) -> bool;

    /// Whether this resource has been merged into a parent.
    fn is_grouped(&self) -> bool;

    fn set_grouped(&self, grouped: bool);

    /// Children merged into this resource.
    fn grouped(&self) -> Vec<Vertex>;

    fn add_grouped(&self, child: Vertex);
}

/// Edge-inference hints for [`EdgeableRes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoEdgeMeta {
    /// Exclude this resource from edge inference, as seeker and as target.
    pub disabled: bool,
}

/// Declares unique identifiers for automatic edge inference.
pub trait EdgeableRes: Send + Sync {
    fn auto_edge_meta(&self) -> AutoEdgeMeta;

    /// UIDs this resource presents to others.
    fn uids(&self) -> Vec<Box<dyn ResUID>>;

    /// Iterator over the UID batches this resource seeks, or `None` when it
    /// seeks nothing.
    fn auto_edges(&self) -> Result<Option<Box<dyn AutoEdgeIter>>>;
}

/// Produces an inverse operation to persist for later rollback.
pub trait ReversibleRes: Send + Sync {
    /// Whether reversal is requested for this resource.
    fn reversal_enabled(&self) -> bool;

    /// Serialized reversal request, or `None` when there is nothing to
    /// undo yet.
    fn reversed(&self) -> Result<Option<String>>;
}

/// Custom binary encoding for cross-host export.
pub trait ExportableRes: Send + Sync {
    fn export(&self) -> Result<Vec<u8>>;
}

/// A vertex handle: a cheap clone of the shared resource object.
///
/// Identity (equality, ordering, hashing) is `(kind, name)`; the graph, the
/// state map, and the commit diff all key on it. Two handles wrapping
/// different objects with the same identity compare equal — the commit diff
/// relies on this to map next-graph vertices onto running ones.
#[derive(Clone)]
pub struct Vertex {
    res: Arc<dyn Resource>,
}

impl Vertex {
    pub fn new(res: Arc<dyn Resource>) -> Self {
        Self { res }
    }

    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.res
    }

    pub fn kind(&self) -> String {
        self.res.kind().to_string()
    }

    pub fn name(&self) -> String {
        self.res.name()
    }

    /// Canonical `kind[name]` key used in logs, the state directory layout,
    /// and the edge-inference cache.
    pub fn res_key(&self) -> String {
        format!("{}[{}]", self.res.kind(), self.res.name())
    }

    /// Whether both handles wrap the same resource object.
    pub fn same_object(&self, other: &Vertex) -> bool {
        Arc::ptr_eq(&self.res, &other.res)
    }
}

impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.res.kind() == other.res.kind() && self.res.name() == other.res.name()
    }
}

impl Eq for Vertex {}

impl PartialOrd for Vertex {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vertex {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.res.kind(), self.res.name()).cmp(&(other.res.kind(), other.res.name()))
    }
}

impl Hash for Vertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.res.kind().hash(state);
        self.res.name().hash(state);
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.res_key())
    }
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vertex({})", self.res_key())
    }
}

/// A directed edge between two vertices.
///
/// `notify` is the static declaration that this edge carries refresh
/// signals; `refresh` is the live "a refresh is pending here" bit, toggled
/// by the process step. Edges are shared as `Arc<Edge>` so the live bit is
/// visible through every graph snapshot holding the edge.
#[derive(Debug)]
pub struct Edge {
    pub name: String,
    pub notify: bool,
    refresh: AtomicBool,
}

impl Edge {
    pub fn new(name: impl Into<String>, notify: bool) -> Self {
        Self {
            name: name.into(),
            notify,
            refresh: AtomicBool::new(false),
        }
    }

    pub fn refresh(&self) -> bool {
        self.refresh.load(Ordering::SeqCst)
    }

    pub fn set_refresh(&self, refresh: bool) {
        self.refresh.store(refresh, Ordering::SeqCst);
    }
}

impl PartialEq for Edge {
    /// Structural comparison for the commit diff: the live refresh bit is
    /// state, not identity, and is excluded.
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.notify == other.notify
    }
}

impl Eq for Edge {}

//! Common test resources and setup

// not every test binary exercises every helper
#![allow(dead_code)]

use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use converge_engine::{
    Config, Engine, Error, MetaParams, RefreshableRes, ResDelete, ResExport, ResInit, Resource,
    WatchContext, World,
};

/// Install a test-writer subscriber once, so `RUST_LOG`-style debugging of
/// a single test run works out of the box.
pub fn init_tracing() {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Engine with a short converged timeout and a private state prefix.
pub fn test_engine() -> (TempDir, Engine) {
    init_tracing();
    let tmp = TempDir::new().expect("temp dir");
    let config = Config {
        prefix: tmp.path().to_path_buf(),
        converged_timeout_ms: 150,
        ..Default::default()
    };
    let mut engine = Engine::new(config);
    engine.init().expect("engine init");
    (tmp, engine)
}

/// Milliseconds every convergence wait is bounded by.
pub const WAIT: Duration = Duration::from_secs(10);

/// A world that remembers everything published to it.
#[derive(Debug, Default)]
pub struct RecordingWorld {
    pub exports: Mutex<Vec<ResExport>>,
}

#[async_trait::async_trait]
impl World for RecordingWorld {
    async fn res_export(&self, exports: Vec<ResExport>) -> Result<(), Error> {
        self.exports.lock().extend(exports);
        Ok(())
    }

    async fn res_delete(&self, _deletes: Vec<ResDelete>) -> Result<(), Error> {
        Ok(())
    }

    async fn res_watch(&self, _kind: &str) -> Result<mpsc::Receiver<Result<(), Error>>, Error> {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        Ok(rx)
    }
}

/// Writes fixed content to a path. The watch is a pure startup signal;
/// changes arrive as graph swaps.
#[derive(Debug)]
pub struct FileRes {
    path: PathBuf,
    content: String,
    meta: RwLock<MetaParams>,
    writes: Arc<AtomicUsize>,
    apply_log: Option<Arc<Mutex<Vec<String>>>>,
}

impl FileRes {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            meta: RwLock::new(MetaParams::default()),
            writes: Arc::new(AtomicUsize::new(0)),
            apply_log: None,
        }
    }

    pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.apply_log = Some(log);
        self
    }

    pub fn writes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.writes)
    }
}

#[async_trait::async_trait]
impl Resource for FileRes {
    fn kind(&self) -> &str {
        "file"
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn meta_params(&self) -> MetaParams {
        self.meta.read().clone()
    }

    fn set_meta_params(&self, params: MetaParams) {
        *self.meta.write() = params;
    }

    fn validate(&self) -> Result<(), Error> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Validation("file path is empty".into()));
        }
        Ok(())
    }

    fn init(&self, _init: &ResInit) -> Result<(), Error> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn watch(&self, ctx: WatchContext) -> Result<(), Error> {
        ctx.running().await?;
        ctx.done().cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, _done: &CancellationToken, apply: bool) -> Result<bool, Error> {
        let current = std::fs::read_to_string(&self.path).ok();
        if current.as_deref() == Some(self.content.as_str()) {
            return Ok(true);
        }
        if !apply {
            return Ok(false);
        }
        std::fs::write(&self.path, &self.content).map_err(|e| Error::Resource(e.to_string()))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.apply_log {
            log.lock().push(self.name());
        }
        Ok(false)
    }

    fn cmp(&self, other: &dyn Resource) -> bool {
        match other.as_any().downcast_ref::<FileRes>() {
            Some(o) => self.path == o.path && self.content == o.content,
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Emits one event per message pushed into its trigger channel. Check
/// results, delay, and an in-flight marker are all observable.
#[derive(Debug)]
pub struct TriggerRes {
    name: String,
    meta: RwLock<MetaParams>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    checks: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
    apply_delay: Duration,
    /// `false` reports "state was wrong, I fixed it" on every check.
    always_ok: bool,
}

impl TriggerRes {
    pub fn new(name: &str) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel(64);
        let res = Self {
            name: name.to_string(),
            meta: RwLock::new(MetaParams::default()),
            trigger_rx: Mutex::new(Some(rx)),
            checks: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicBool::new(false)),
            apply_delay: Duration::ZERO,
            always_ok: true,
        };
        (res, tx)
    }

    pub fn with_meta(self, meta: MetaParams) -> Self {
        *self.meta.write() = meta;
        self
    }

    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// Report work done on every check, so successors get poked each time.
    pub fn always_applying(mut self) -> Self {
        self.always_ok = false;
        self
    }

    pub fn checks(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.checks)
    }

    pub fn in_flight(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.in_flight)
    }
}

#[async_trait::async_trait]
impl Resource for TriggerRes {
    fn kind(&self) -> &str {
        "trigger"
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn meta_params(&self) -> MetaParams {
        self.meta.read().clone()
    }

    fn set_meta_params(&self, params: MetaParams) {
        *self.meta.write() = params;
    }

    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }

    fn init(&self, _init: &ResInit) -> Result<(), Error> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn watch(&self, ctx: WatchContext) -> Result<(), Error> {
        let mut rx = self
            .trigger_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Watch("trigger watch started twice".into()))?;
        ctx.running().await?;
        loop {
            tokio::select! {
                _ = ctx.done().cancelled() => return Ok(()),
                trigger = rx.recv() => {
                    match trigger {
                        Some(()) => ctx.event().await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn check_apply(&self, _done: &CancellationToken, _apply: bool) -> Result<bool, Error> {
        self.in_flight.store(true, Ordering::SeqCst);
        if self.apply_delay > Duration::ZERO {
            tokio::time::sleep(self.apply_delay).await;
        }
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
        Ok(self.always_ok)
    }

    fn cmp(&self, other: &dyn Resource) -> bool {
        match other.as_any().downcast_ref::<TriggerRes>() {
            Some(o) => self.name == o.name,
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A refresh-consuming service stand-in: every check records whether a
/// refresh was pending at that moment.
#[derive(Debug)]
pub struct NotifyRes {
    name: String,
    meta: RwLock<MetaParams>,
    refresh: AtomicBool,
    observations: Arc<Mutex<Vec<bool>>>,
    apply_delay: Duration,
}

impl NotifyRes {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            meta: RwLock::new(MetaParams::default()),
            refresh: AtomicBool::new(false),
            observations: Arc::new(Mutex::new(Vec::new())),
            apply_delay: Duration::ZERO,
        }
    }

    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    pub fn observations(&self) -> Arc<Mutex<Vec<bool>>> {
        Arc::clone(&self.observations)
    }
}

#[async_trait::async_trait]
impl Resource for NotifyRes {
    fn kind(&self) -> &str {
        "notify"
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn meta_params(&self) -> MetaParams {
        self.meta.read().clone()
    }

    fn set_meta_params(&self, params: MetaParams) {
        *self.meta.write() = params;
    }

    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }

    fn init(&self, _init: &ResInit) -> Result<(), Error> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn watch(&self, ctx: WatchContext) -> Result<(), Error> {
        ctx.running().await?;
        ctx.done().cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, _done: &CancellationToken, _apply: bool) -> Result<bool, Error> {
        if self.apply_delay > Duration::ZERO {
            tokio::time::sleep(self.apply_delay).await;
        }
        self.observations.lock().push(self.refresh());
        Ok(true)
    }

    fn cmp(&self, other: &dyn Resource) -> bool {
        match other.as_any().downcast_ref::<NotifyRes>() {
            Some(o) => self.name == o.name,
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_refreshable(&self) -> Option<&dyn RefreshableRes> {
        Some(self)
    }
}

impl RefreshableRes for NotifyRes {
    fn refresh(&self) -> bool {
        self.refresh.load(Ordering::SeqCst)
    }

    fn set_refresh(&self, refresh: bool) {
        self.refresh.store(refresh, Ordering::SeqCst);
    }
}

/// A resource whose watch fails immediately, or behaves when told not to.
#[derive(Debug)]
pub struct FailRes {
    name: String,
    meta: RwLock<MetaParams>,
    fail_watch: bool,
    watch_starts: Arc<AtomicUsize>,
}

impl FailRes {
    pub fn new(name: &str, fail_watch: bool) -> Self {
        Self {
            name: name.to_string(),
            meta: RwLock::new(MetaParams::default()),
            fail_watch,
            watch_starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_meta(self, meta: MetaParams) -> Self {
        *self.meta.write() = meta;
        self
    }

    pub fn watch_starts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.watch_starts)
    }
}

#[async_trait::async_trait]
impl Resource for FailRes {
    fn kind(&self) -> &str {
        "fail"
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn meta_params(&self) -> MetaParams {
        self.meta.read().clone()
    }

    fn set_meta_params(&self, params: MetaParams) {
        *self.meta.write() = params;
    }

    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }

    fn init(&self, _init: &ResInit) -> Result<(), Error> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn watch(&self, ctx: WatchContext) -> Result<(), Error> {
        self.watch_starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_watch {
            return Err(Error::Watch("event source unavailable".into()));
        }
        ctx.running().await?;
        ctx.done().cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, _done: &CancellationToken, _apply: bool) -> Result<bool, Error> {
        Ok(true)
    }

    fn cmp(&self, other: &dyn Resource) -> bool {
        match other.as_any().downcast_ref::<FailRes>() {
            Some(o) => self.name == o.name,
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

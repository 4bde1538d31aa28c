//! Minimal configurable resource used by unit tests across the crate.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::res::{
    AutoEdgeMeta, AutoGroupMeta, EdgeableRes, GroupableRes, MetaParams, ResInit, Resource,
    ReversibleRes, Vertex, WatchContext,
};
use crate::uid::{AutoEdgeIter, BaseUID, FirstMatchIter, ResUID};

type UidSpec = (String, String, bool);

/// A do-nothing resource with pluggable identity, uids, and grouping.
pub(crate) struct TestRes {
    kind: String,
    name: String,
    meta: RwLock<MetaParams>,
    edgeable: bool,
    edge_disabled: bool,
    uids: Vec<UidSpec>,
    seeks: Vec<Vec<UidSpec>>,
    groupable: bool,
    group_disabled: bool,
    grouped: AtomicBool,
    children: Mutex<Vec<Vertex>>,
    reversal: Option<String>,
}

impl std::fmt::Debug for TestRes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestRes({}[{}])", self.kind, self.name)
    }
}

impl TestRes {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            meta: RwLock::new(MetaParams::default()),
            edgeable: false,
            edge_disabled: false,
            uids: Vec::new(),
            seeks: Vec::new(),
            groupable: false,
            group_disabled: false,
            grouped: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            reversal: None,
        }
    }

    pub fn with_meta(self, meta: MetaParams) -> Self {
        *self.meta.write() = meta;
        self
    }

    /// Present one UID under this resource's own kind.
    pub fn presenting(mut self, name: &str) -> Self {
        self.uids.push((self.kind.clone(), name.to_string(), false));
        self.edgeable = true;
        self
    }

    /// Seek one UID per batch, in order, stopping at the first match.
    pub fn seeking(mut self, uids: &[(&str, &str, bool)]) -> Self {
        for (kind, name, reversed) in uids {
            self.seeks
                .push(vec![(kind.to_string(), name.to_string(), *reversed)]);
        }
        self.edgeable = true;
        self
    }

    /// Seek several UIDs in a single batch.
    pub fn seeking_batch(mut self, uids: &[(&str, &str, bool)]) -> Self {
        self.seeks.push(
            uids.iter()
                .map(|(kind, name, reversed)| (kind.to_string(), name.to_string(), *reversed))
                .collect(),
        );
        self.edgeable = true;
        self
    }

    pub fn edge_disabled(mut self) -> Self {
        self.edge_disabled = true;
        self.edgeable = true;
        self
    }

    pub fn groupable(mut self) -> Self {
        self.groupable = true;
        self
    }

    pub fn group_disabled(mut self) -> Self {
        self.groupable = true;
        self.group_disabled = true;
        self
    }

    pub fn reversible(mut self, payload: &str) -> Self {
        self.reversal = Some(payload.to_string());
        self
    }

    pub fn vertex(self) -> Vertex {
        Vertex::new(Arc::new(self))
    }
}

#[async_trait::async_trait]
impl Resource for TestRes {
    fn kind(&self) -> &str {
        &self.kind
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

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn init(&self, _init: &ResInit) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn watch(&self, ctx: WatchContext) -> Result<()> {
        ctx.running().await?;
        ctx.done().cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, _done: &CancellationToken, _apply: bool) -> Result<bool> {
        Ok(true)
    }

    fn cmp(&self, other: &dyn Resource) -> bool {
        self.kind() == other.kind() && self.name() == other.name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_edgeable(&self) -> Option<&dyn EdgeableRes> {
        if self.edgeable {
            Some(self)
        } else {
            None
        }
    }

    fn as_groupable(&self) -> Option<&dyn GroupableRes> {
        if self.groupable {
            Some(self)
        } else {
            None
        }
    }

    fn as_reversible(&self) -> Option<&dyn ReversibleRes> {
        if self.reversal.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl ReversibleRes for TestRes {
    fn reversal_enabled(&self) -> bool {
        true
    }

    fn reversed(&self) -> Result<Option<String>> {
        Ok(self.reversal.clone())
    }
}

impl EdgeableRes for TestRes {
    fn auto_edge_meta(&self) -> AutoEdgeMeta {
        AutoEdgeMeta {
            disabled: self.edge_disabled,
        }
    }

    fn uids(&self) -> Vec<Box<dyn ResUID>> {
        self.uids
            .iter()
            .map(|(kind, name, reversed)| {
                let uid = BaseUID {
                    kind: kind.clone(),
                    name: name.clone(),
                    reversed: *reversed,
                };
                Box::new(uid) as Box<dyn ResUID>
            })
            .collect()
    }

    fn auto_edges(&self) -> Result<Option<Box<dyn AutoEdgeIter>>> {
        if self.seeks.is_empty() {
            return Ok(None);
        }
        let batches = self
            .seeks
            .iter()
            .map(|batch| {
                batch
                    .iter()
                    .map(|(kind, name, reversed)| {
                        let uid = BaseUID {
                            kind: kind.clone(),
                            name: name.clone(),
                            reversed: *reversed,
                        };
                        Box::new(uid) as Box<dyn ResUID>
                    })
                    .collect()
            })
            .collect();
        Ok(Some(Box::new(FirstMatchIter::new(batches))))
    }
}

impl GroupableRes for TestRes {
    fn auto_group_meta(&self) -> AutoGroupMeta {
        AutoGroupMeta {
            disabled: self.group_disabled,
        }
    }

    fn group_cmp(&self, _other: &dyn GroupableRes) -> bool {
        true
    }

    fn is_grouped(&self) -> bool {
        self.grouped.load(Ordering::SeqCst)
    }

    fn set_grouped(&self, grouped: bool) {
        self.grouped.store(grouped, Ordering::SeqCst);
    }

    fn grouped(&self) -> Vec<Vertex> {
        self.children.lock().clone()
    }

    fn add_grouped(&self, child: Vertex) {
        self.children.lock().push(child);
    }
}

/// Shorthand: a plain vertex with no capabilities.
pub(crate) fn vertex(kind: &str, name: &str) -> Vertex {
    TestRes::new(kind, name).vertex()
}

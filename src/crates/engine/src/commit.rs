//! The graph-swap protocol.
//!
//! `graph_sync` diffs the running graph against the next one and applies
//! the difference: removed vertices get their workers stopped and their
//! states closed; added vertices are validated, initialized, and their
//! worker starts deferred until the whole diff succeeded; unchanged
//! vertices keep their running worker, state, and edge refresh bits. At no
//! point do two workers exist for the same vertex identity.
//!
//! Vertex comparison is by value (`Resource::cmp`), augmented with one
//! rule: if the previous worker errored and the new vertex carries
//! `rewatch`, the pair compares unequal so the vertex is replaced and
//! restarted.
//!
//! On error the swap is abandoned and the old graph stays primary; workers
//! already stopped by the remove phase stay stopped, exactly like a failed
//! half of any external reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::{EngineGraph, EngineShared};
use crate::error::{Error, Result};
use crate::res::Vertex;
use crate::state::State;
use crate::worker;

/// What a completed sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SyncStats {
    pub(crate) added: usize,
    pub(crate) removed: usize,
    pub(crate) kept: usize,
}

/// Diff the running graph against `next` and swap it in. The engine must
/// be paused (the caller enforces it).
pub(crate) async fn graph_sync(
    shared: &Arc<EngineShared>,
    next: EngineGraph,
) -> Result<SyncStats> {
    let old = shared.graph();

    // the running graph must stay a DAG; reject cycles before any mutation
    next.topological_sort()?;

    // match next vertices onto running ones
    let mut kept: BTreeMap<Vertex, Vertex> = BTreeMap::new(); // next -> old handle
    let mut adds: Vec<Vertex> = Vec::new();
    for nv in next.vertices_sorted() {
        match old.vertex_match_fn(|ov| ov == &nv) {
            Some(ov) if vertex_cmp(shared, &ov, &nv) => {
                kept.insert(nv, ov);
            }
            _ => adds.push(nv),
        }
    }
    let removes: Vec<Vertex> = old
        .vertices_sorted()
        .into_iter()
        .filter(|ov| !kept.contains_key(ov))
        .collect();

    // stop removed workers; free their state entries only at the end
    let mut deferred_frees: Vec<(Vertex, Arc<State>)> = Vec::new();
    for ov in &removes {
        if let Some(state) = shared.state_for(ov) {
            info!(vertex = %ov, "stopping removed worker");
            state.close().await?;
            deferred_frees.push((ov.clone(), state));
        }
    }

    // bring up added vertices; worker starts are deferred until the whole
    // batch succeeded
    let mut deferred_starts: Vec<(Vertex, Arc<State>)> = Vec::new();
    for nv in &adds {
        match add_vertex_state(shared, nv) {
            Ok(state) => deferred_starts.push((nv.clone(), state)),
            Err(e) => {
                // unwind this batch; the old graph stays primary
                for (_, state) in &deferred_starts {
                    let _ = state.close().await;
                }
                return Err(e);
            }
        }
    }

    // assemble the new running graph: kept vertices keep their old handle
    // (the running resource object), kept edges keep their live refresh bit
    let mut out = EngineGraph::with_name(next.name().to_string());
    for nv in next.vertices_sorted() {
        let v = kept.get(&nv).cloned().unwrap_or(nv);
        out.add_vertex(v);
    }
    for (a, b, edge) in next.edges() {
        let fa = kept.get(&a).cloned().unwrap_or(a);
        let fb = kept.get(&b).cloned().unwrap_or(b);
        let edge = match old.find_edge(&fa, &fb) {
            Some(oe) if **oe == *edge => Arc::clone(oe),
            _ => edge,
        };
        out.add_edge(fa, fb, edge);
    }

    // register the new states, then swap the graph pointer so freshly
    // started workers only ever observe the new adjacency
    for (v, state) in &deferred_starts {
        shared.insert_state(v.clone(), Arc::clone(state));
    }
    shared.set_graph(Arc::new(out));

    for (v, state) in &deferred_starts {
        worker::start_worker(shared, v, state);
    }

    for (v, state) in &deferred_frees {
        shared.remove_state_if_same(v, state);
    }

    let stats = SyncStats {
        added: adds.len(),
        removed: removes.len(),
        kept: kept.len(),
    };
    debug!(?stats, "graph sync complete");
    Ok(stats)
}

/// Value comparison between a running vertex and its next-graph twin.
fn vertex_cmp(shared: &EngineShared, ov: &Vertex, nv: &Vertex) -> bool {
    if !ov.resource().cmp(nv.resource().as_ref()) {
        return false;
    }
    // a dead worker plus rewatch means "replace me even though I look equal"
    if nv.resource().meta_params().rewatch {
        if let Some(state) = shared.state_for(ov) {
            if state.worker_err().is_some() {
                debug!(vertex = %nv, "rewatch: replacing errored worker");
                return false;
            }
        }
    }
    true
}

/// The add callback: validate the resource, set up its state, handle the
/// `reset` meta param. Workers start parked; the engine resume wakes them.
fn add_vertex_state(shared: &Arc<EngineShared>, nv: &Vertex) -> Result<Arc<State>> {
    let meta = nv.resource().meta_params();
    meta.validate()
        .map_err(|e| Error::Validation(format!("{nv}: {e}")))?;
    nv.resource()
        .validate()
        .map_err(|e| Error::Validation(format!("{nv}: {e}")))?;
    if meta.reset {
        shared.reset_meta_state(nv);
    }
    info!(vertex = %nv, "starting added vertex");
    State::new(
        nv.clone(),
        &shared.converger,
        &shared.config,
        shared.world(),
        true,
    )
}

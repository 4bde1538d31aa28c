//! One reconciliation attempt for a single vertex.
//!
//! Ordering across the graph comes from two local rules applied here:
//!
//! 1. **Backpoke.** A vertex refuses to run while any predecessor's
//!    timestamp is not strictly greater than its own; it pokes the laggards
//!    and defers. Equal timestamps (including the initial all-zeros state)
//!    count as "not yet", which breaks start-up races in favor of
//!    topological order without a global barrier.
//! 2. **Forward poke.** After a successful step the vertex advances its own
//!    timestamp — before poking — then pokes every successor whose
//!    predecessors are all ahead of it.
//!
//! Between the two sit the semaphores, the send/recv value transfer, the
//! refresh computation, and the check-apply itself.

use tracing::{debug, trace};

use crate::engine::EngineShared;
use crate::error::{Error, Result};
use crate::refresh;
use crate::res::Vertex;
use crate::sendrecv;
use crate::state::State;
use crate::world::ResExport;

/// How a process step concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Check-apply ran and performed real work.
    Applied,

    /// Nothing to do: state was already OK, or noop withheld the apply.
    Skipped,

    /// Deferred behind lagging predecessors; they have been poked and
    /// their completions will poke this vertex back. Not a failure: it
    /// never consumes a retry.
    Deferred,
}

/// Run one reconciliation attempt for `vertex`.
pub(crate) async fn process(
    shared: &EngineShared,
    vertex: &Vertex,
    state: &State,
) -> Result<ProcessOutcome> {
    let graph = shared.graph();
    let res = vertex.resource();
    let meta = res.meta_params();

    // 1. backpoke lagging predecessors and defer
    let lagging = bad_timestamps(shared, &graph, vertex, state.timestamp());
    if !lagging.is_empty() {
        debug!(vertex = %vertex, lagging = lagging.len(), "backpoking predecessors");
        for u in &lagging {
            shared.poke(u);
        }
        return Ok(ProcessOutcome::Deferred);
    }

    // 2. semaphores: sorted acquire, reverse release when the guard drops
    let _sema = shared.semas.acquire_all(&meta.sema, state.done()).await?;

    // 3. send/recv value transfer; a landed value dirties this vertex
    let updates = sendrecv::update_values(&graph, vertex)?;
    if updates.iter().any(|u| u.changed) {
        state.set_dirty();
    }

    // 4. refresh: pending iff any incoming notify edge carries the bit
    let refresh = refresh::refresh_pending(&graph, vertex);
    if let Some(r) = res.as_refreshable() {
        r.set_refresh(refresh);
    }
    let pending = refresh && res.as_refreshable().is_some();

    // 5. skip decision
    let mut ran = false;
    let check_ok = if !pending && state.is_state_ok() {
        // nothing changed since the last good check
        true
    } else if meta.noop && pending {
        // we cannot service the refresh without mutating, so report the
        // state as wrong and leave the bit pending
        false
    } else {
        ran = true;
        match res.check_apply(state.done(), !meta.noop).await {
            Ok(ok) => ok,
            Err(e) => {
                state.activity();
                return Err(e);
            }
        }
    };

    // 6. bookkeeping
    if !check_ok {
        state.activity();
    }
    let applied = ran && !meta.noop && !check_ok;
    if !meta.noop {
        // the step succeeded, so observed state now matches desired state
        state.mark_state_ok();
        if pending && ran {
            // the refresh was serviced: consume it exactly once
            refresh::set_upstream_refresh(&graph, vertex, false);
            if let Some(r) = res.as_refreshable() {
                r.set_refresh(false);
            }
        }
    }

    // 7. forward propagation
    if applied {
        refresh::set_downstream_refresh(&graph, vertex, true);
        if !meta.export.is_empty() {
            publish_exports(shared, vertex).await?;
        }
    }

    // the timestamp must move before poking, or successors would reject
    // this vertex as lagging
    let ts = state.update_timestamp();
    trace!(vertex = %vertex, ts, applied, "process complete");

    if !shared.fast_pause() {
        for w in graph.outgoing_graph_vertices(vertex) {
            if ok_timestamp(shared, &graph, &w) {
                shared.poke(&w);
            }
        }
    }

    Ok(if applied {
        ProcessOutcome::Applied
    } else {
        ProcessOutcome::Skipped
    })
}

/// Predecessors whose timestamps are not strictly ahead of `ts_v`.
fn bad_timestamps(
    shared: &EngineShared,
    graph: &crate::engine::EngineGraph,
    v: &Vertex,
    ts_v: i64,
) -> Vec<Vertex> {
    graph
        .incoming_graph_vertices(v)
        .into_iter()
        .filter(|u| {
            shared
                .state_for(u)
                .map(|su| ts_v >= su.timestamp())
                .unwrap_or(false)
        })
        .collect()
}

/// Whether every predecessor of `w` is strictly ahead of it.
fn ok_timestamp(
    shared: &EngineShared,
    graph: &crate::engine::EngineGraph,
    w: &Vertex,
) -> bool {
    let Some(sw) = shared.state_for(w) else {
        return false;
    };
    let ts_w = sw.timestamp();
    graph.incoming_graph_vertices(w).iter().all(|u| {
        shared
            .state_for(u)
            .map(|su| su.timestamp() > ts_w)
            .unwrap_or(true)
    })
}

/// Publish this vertex to the distributed layer, one record per export
/// host.
async fn publish_exports(shared: &EngineShared, vertex: &Vertex) -> Result<()> {
    let Some(world) = shared.world() else {
        return Ok(());
    };
    let res = vertex.resource();
    let data = match res.as_exportable() {
        Some(e) => Some(e.export().map_err(|e| {
            Error::Resource(format!("{vertex}: export encoding failed: {e}"))
        })?),
        None => None,
    };
    let exports = res
        .meta_params()
        .export
        .iter()
        .map(|host| ResExport {
            kind: vertex.kind(),
            name: vertex.name(),
            host: host.clone(),
            data: data.clone(),
        })
        .collect();
    world.res_export(exports).await
}

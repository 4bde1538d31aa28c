//! Refresh propagation along notify edges.
//!
//! Edges declared with `notify` carry a live refresh bit. The process step
//! sets the bit on outgoing notify edges when a vertex performs real work,
//! and consumes the incoming bits when the successor's check-apply actually
//! runs and succeeds. A successor that skips its check-apply leaves the bit
//! pending for its next real run.

use crate::engine::EngineGraph;
use crate::res::Vertex;

/// Whether any incoming notify edge of `v` has a refresh pending.
pub fn refresh_pending(graph: &EngineGraph, v: &Vertex) -> bool {
    graph.incoming_graph_vertices(v).iter().any(|u| {
        graph
            .find_edge(u, v)
            .map(|e| e.notify && e.refresh())
            .unwrap_or(false)
    })
}

/// Write the refresh bit onto every incoming notify edge of `v`.
pub fn set_upstream_refresh(graph: &EngineGraph, v: &Vertex, refresh: bool) {
    for u in graph.incoming_graph_vertices(v) {
        if let Some(e) = graph.find_edge(&u, v) {
            if e.notify {
                e.set_refresh(refresh);
            }
        }
    }
}

/// Write the refresh bit onto every outgoing notify edge of `v`.
pub fn set_downstream_refresh(graph: &EngineGraph, v: &Vertex, refresh: bool) {
    for w in graph.outgoing_graph_vertices(v) {
        if let Some(e) = graph.find_edge(v, &w) {
            if e.notify {
                e.set_refresh(refresh);
            }
        }
    }
}

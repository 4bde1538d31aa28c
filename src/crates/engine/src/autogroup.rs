//! Vertex grouping ahead of execution.
//!
//! Compatible peers are merged so one worker drives them as a unit: the
//! child is removed from the graph, recorded on the parent, its semaphores
//! are unioned onto the parent, and its edges are collapsed onto the
//! parent (notify and refresh bits OR-merged with any existing parallel
//! edge). Eligibility: both groupable, neither excluded, the parent not
//! itself merged away, the child carrying no merged children of its own,
//! and the resource-specific compatibility check accepting the pair.

use std::sync::Arc;

use tracing::debug;

use crate::engine::EngineGraph;
use crate::error::Result;
use crate::res::{Edge, Vertex};

/// Merge until no compatible pair remains. Returns the number of merges.
pub fn auto_group(graph: &mut EngineGraph) -> Result<usize> {
    let mut merges = 0;
    while let Some((parent, child)) = find_mergeable(graph) {
        debug!(parent = %parent, child = %child, "grouping");
        merge(graph, &parent, &child);
        merges += 1;
    }
    Ok(merges)
}

/// First eligible (parent, child) pair in deterministic order.
fn find_mergeable(graph: &EngineGraph) -> Option<(Vertex, Vertex)> {
    let vertices = graph.vertices_sorted();
    for p in &vertices {
        let Some(pg) = p.resource().as_groupable() else {
            continue;
        };
        if pg.auto_group_meta().disabled || pg.is_grouped() {
            continue;
        }
        for c in &vertices {
            if c == p {
                continue;
            }
            let Some(cg) = c.resource().as_groupable() else {
                continue;
            };
            if cg.auto_group_meta().disabled || cg.is_grouped() {
                continue;
            }
            if !cg.grouped().is_empty() {
                // only leaves may be merged into a parent
                continue;
            }
            if !pg.group_cmp(cg) {
                continue;
            }
            return Some((p.clone(), c.clone()));
        }
    }
    None
}

fn merge(graph: &mut EngineGraph, parent: &Vertex, child: &Vertex) {
    // union the child's semaphores onto the parent, deduplicated
    let mut meta = parent.resource().meta_params();
    for sema in child.resource().meta_params().sema {
        if !meta.sema.contains(&sema) {
            meta.sema.push(sema);
        }
    }
    meta.sema.sort();
    parent.resource().set_meta_params(meta);

    // collapse the child's edges onto the parent
    for u in graph.incoming_graph_vertices(child) {
        if &u == parent {
            continue; // the parent-child edge dissolves into the merge
        }
        if let Some(edge) = graph.find_edge(&u, child).cloned() {
            let combined = combine(graph.find_edge(&u, parent), &edge);
            graph.add_edge(u.clone(), parent.clone(), combined);
        }
    }
    for w in graph.outgoing_graph_vertices(child) {
        if &w == parent {
            continue;
        }
        if let Some(edge) = graph.find_edge(child, &w).cloned() {
            let combined = combine(graph.find_edge(parent, &w), &edge);
            graph.add_edge(parent.clone(), w.clone(), combined);
        }
    }

    graph.delete_vertex(child);
    if let Some(pg) = parent.resource().as_groupable() {
        pg.add_grouped(child.clone());
    }
    if let Some(cg) = child.resource().as_groupable() {
        cg.set_grouped(true);
    }
}

/// OR-merge an edge with any existing parallel edge on the parent.
fn combine(existing: Option<&Arc<Edge>>, edge: &Arc<Edge>) -> Arc<Edge> {
    let name = existing
        .map(|e| e.name.clone())
        .unwrap_or_else(|| edge.name.clone());
    let notify = edge.notify || existing.map(|e| e.notify).unwrap_or(false);
    let combined = Edge::new(name, notify);
    combined.set_refresh(edge.refresh() || existing.map(|e| e.refresh()).unwrap_or(false));
    Arc::new(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestRes;

    #[test]
    fn compatible_pair_merges_onto_sorted_parent() {
        let mut g = EngineGraph::new();
        let a = TestRes::new("pkg", "a").groupable().vertex();
        let b = TestRes::new("pkg", "b").groupable().vertex();
        g.add_vertex(a.clone());
        g.add_vertex(b.clone());

        let merges = auto_group(&mut g).unwrap();
        assert_eq!(merges, 1);
        assert_eq!(g.num_vertices(), 1);
        assert!(g.has_vertex(&a));

        let pg = a.resource().as_groupable().unwrap();
        assert_eq!(pg.grouped(), vec![b.clone()]);
        assert!(b.resource().as_groupable().unwrap().is_grouped());
    }

    #[test]
    fn semaphores_union_onto_parent() {
        let mut g = EngineGraph::new();
        let mut ma = crate::res::MetaParams::default();
        ma.sema = vec!["db:2".into(), "shared".into()];
        let mut mb = crate::res::MetaParams::default();
        mb.sema = vec!["net".into(), "shared".into()];
        let a = TestRes::new("pkg", "a").groupable().with_meta(ma).vertex();
        let b = TestRes::new("pkg", "b").groupable().with_meta(mb).vertex();
        g.add_vertex(a.clone());
        g.add_vertex(b);

        auto_group(&mut g).unwrap();
        assert_eq!(
            a.resource().meta_params().sema,
            vec!["db:2".to_string(), "net".to_string(), "shared".to_string()]
        );
    }

    #[test]
    fn child_edges_collapse_with_notify_or() {
        let mut g = EngineGraph::new();
        let a = TestRes::new("pkg", "a").groupable().vertex();
        let b = TestRes::new("pkg", "b").groupable().vertex();
        let x = TestRes::new("svc", "x").vertex(); // not groupable
        g.add_vertex(a.clone());
        g.add_vertex(b.clone());
        g.add_edge(x.clone(), a.clone(), Arc::new(Edge::new("x -> a", false)));
        g.add_edge(x.clone(), b.clone(), Arc::new(Edge::new("x -> b", true)));

        auto_group(&mut g).unwrap();
        assert_eq!(g.num_vertices(), 2);
        let edge = g.find_edge(&x, &a).expect("collapsed edge");
        assert!(edge.notify, "notify must survive the collapse");
        assert!(g.find_edge(&x, &b).is_none());
    }

    #[test]
    fn disabled_and_foreign_vertices_stay() {
        let mut g = EngineGraph::new();
        g.add_vertex(TestRes::new("pkg", "a").groupable().vertex());
        g.add_vertex(TestRes::new("pkg", "b").group_disabled().vertex());
        g.add_vertex(TestRes::new("svc", "x").vertex());

        let merges = auto_group(&mut g).unwrap();
        assert_eq!(merges, 0);
        assert_eq!(g.num_vertices(), 3);
    }

    #[test]
    fn vertex_with_children_can_only_be_the_parent() {
        let mut g = EngineGraph::new();
        let a = TestRes::new("pkg", "a").groupable().vertex();
        let b = TestRes::new("pkg", "b").groupable().vertex();
        // b already carries a merged child from an earlier pass
        b.resource()
            .as_groupable()
            .unwrap()
            .add_grouped(TestRes::new("pkg", "z").groupable().vertex());
        g.add_vertex(a.clone());
        g.add_vertex(b.clone());

        let merges = auto_group(&mut g).unwrap();
        assert_eq!(merges, 1);
        assert!(g.has_vertex(&b), "b absorbs a, never the other way around");
        assert_eq!(g.num_vertices(), 1);
        let children = b.resource().as_groupable().unwrap().grouped();
        assert_eq!(children.len(), 2);
        assert!(children.contains(&a));
    }
}

//! Automatic edge inference.
//!
//! Each edgeable resource presents a set of unique identifiers and may seek
//! batches of identifiers it depends on. For every sought identifier the
//! first presenting vertex (in deterministic order) becomes an edge
//! endpoint, unless a path already exists in that direction — the
//! transitive-reduction pre-check. The seek iterator is consulted after
//! every batch and may stop early, which is how "nearest dependency wins"
//! lookups terminate.
//!
//! A full run is fingerprinted over everything that influences it: vertex
//! identities, their sorted UID strings, their disabled flags, and the
//! pre-existing edge set. The next run with an identical fingerprint
//! replays the recorded edges instead of recomputing, after validating
//! that every endpoint still resolves; a stale cache falls through to the
//! full algorithm without touching the graph first.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::engine::EngineGraph;
use crate::error::Result;
use crate::res::{Edge, Vertex};
use crate::uid::ResUID;

/// One inferred edge, recorded for replay by endpoint key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEdge {
    pub from: String,
    pub to: String,
    pub name: String,
}

/// Fingerprinted result of the last inference run. Owned by the engine and
/// carried across graph swaps.
#[derive(Debug, Clone, Default)]
pub struct AutoEdgeCache {
    pub(crate) fingerprint: Option<String>,
    pub(crate) edges: Vec<CachedEdge>,
}

/// Infer edges on `graph`, consulting and updating `cache`. Returns the
/// number of edges added.
pub fn auto_edge(graph: &mut EngineGraph, cache: &mut AutoEdgeCache) -> Result<usize> {
    let fingerprint = fingerprint(graph);

    if cache.fingerprint.as_deref() == Some(fingerprint.as_str()) {
        if let Some(added) = replay(graph, &cache.edges) {
            debug!(edges = added, "edge inference replayed from cache");
            return Ok(added);
        }
        trace!("stale edge cache, recomputing");
    }

    let added = infer(graph)?;
    cache.fingerprint = Some(fingerprint);
    cache.edges = added.clone();
    debug!(edges = added.len(), "edge inference complete");
    Ok(added.len())
}

/// Replay cached edges. Returns `None` without modifying the graph when
/// any endpoint no longer resolves.
fn replay(graph: &mut EngineGraph, edges: &[CachedEdge]) -> Option<usize> {
    let by_key: HashMap<String, Vertex> = graph
        .vertices_sorted()
        .into_iter()
        .map(|v| (v.res_key(), v))
        .collect();

    // validate every endpoint before the first mutation
    let mut resolved = Vec::with_capacity(edges.len());
    for e in edges {
        let from = by_key.get(&e.from)?;
        let to = by_key.get(&e.to)?;
        resolved.push((from.clone(), to.clone(), e.name.clone()));
    }
    let count = resolved.len();
    for (from, to, name) in resolved {
        graph.add_edge(from, to, Arc::new(Edge::new(name, false)));
    }
    Some(count)
}

/// The full inference sweep.
fn infer(graph: &mut EngineGraph) -> Result<Vec<CachedEdge>> {
    // index presented UIDs by concrete type for near-constant lookup;
    // insertion follows the sorted vertex sweep, so bucket order is
    // deterministic
    let mut index: HashMap<TypeId, Vec<Vertex>> = HashMap::new();
    let mut enabled: Vec<Vertex> = Vec::new();
    for v in graph.vertices_sorted() {
        let Some(edg) = v.resource().as_edgeable() else {
            continue;
        };
        if edg.auto_edge_meta().disabled {
            continue;
        }
        enabled.push(v.clone());
        for uid in edg.uids() {
            let bucket = index.entry(uid.as_any().type_id()).or_default();
            if !bucket.contains(&v) {
                bucket.push(v.clone());
            }
        }
    }

    let mut added = Vec::new();
    for v in graph.vertices_sorted() {
        let Some(edg) = v.resource().as_edgeable() else {
            continue;
        };
        if edg.auto_edge_meta().disabled {
            continue;
        }
        let Some(mut iter) = edg.auto_edges()? else {
            continue;
        };

        while let Some(batch) = iter.next_batch() {
            let mut matches = vec![false; batch.len()];
            for (i, seek) in batch.iter().enumerate() {
                let candidates = index
                    .get(&seek.as_any().type_id())
                    .cloned()
                    .unwrap_or_else(|| enabled.clone());
                let Some(target) = find_target(seek.as_ref(), &v, &candidates) else {
                    continue;
                };
                matches[i] = true;

                let (from, to) = if seek.reversed() {
                    (target, v.clone())
                } else {
                    (v.clone(), target)
                };
                if graph.reachable(&from, &to) {
                    // an equivalent path already exists in this direction
                    trace!(from = %from, to = %to, "edge elided as transitive");
                    continue;
                }
                let name = format!("{} -> {}", from.res_key(), to.res_key());
                trace!(edge = %name, "edge inferred");
                graph.add_edge(
                    from.clone(),
                    to.clone(),
                    Arc::new(Edge::new(name.clone(), false)),
                );
                added.push(CachedEdge {
                    from: from.res_key(),
                    to: to.res_key(),
                    name,
                });
            }
            if !iter.test(&matches) {
                break;
            }
        }
    }
    Ok(added)
}

/// First candidate (never the seeker itself) presenting a UID the sought
/// one accepts.
fn find_target(seek: &dyn ResUID, seeker: &Vertex, candidates: &[Vertex]) -> Option<Vertex> {
    for t in candidates {
        if t == seeker {
            continue;
        }
        let Some(edg) = t.resource().as_edgeable() else {
            continue;
        };
        if edg.auto_edge_meta().disabled {
            continue;
        }
        if edg.uids().iter().any(|uid| seek.iff(uid.as_ref())) {
            return Some(t.clone());
        }
    }
    None
}

/// Digest of every input the inference depends on. A missed input here
/// would let stale edges survive a graph change.
fn fingerprint(graph: &EngineGraph) -> String {
    let mut hasher = Sha256::new();
    for v in graph.vertices_sorted() {
        hasher.update(b"v ");
        hasher.update(v.res_key().as_bytes());
        match v.resource().as_edgeable() {
            Some(edg) => {
                hasher.update(if edg.auto_edge_meta().disabled {
                    b" disabled\n".as_slice()
                } else {
                    b" enabled\n".as_slice()
                });
                let mut uids: Vec<String> = edg.uids().iter().map(|u| u.uid_str()).collect();
                uids.sort();
                for uid in uids {
                    hasher.update(b"u ");
                    hasher.update(uid.as_bytes());
                    hasher.update(b"\n");
                }
            }
            None => hasher.update(b" inert\n"),
        }
    }
    for (a, b, e) in graph.edges() {
        hasher.update(
            format!("e {} -> {} [{},{}]\n", a.res_key(), b.res_key(), e.name, e.notify).as_bytes(),
        );
    }
    format!("{:x}", hasher.finalize())
}

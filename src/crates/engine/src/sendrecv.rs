//! Cross-resource value passing.
//!
//! A receiving resource declares, per field, which sender and which key in
//! the sender's published snapshot feeds it. During the process step the
//! engine compares the sender's current value against the receiver's, copies
//! on mismatch, records the change on the receiver, and re-validates it.
//! The DAG plus the timestamp invariant guarantee the sender applied before
//! the receiver runs, so a wired sender with nothing published is a
//! wiring error, not a race.

use std::sync::Arc;

use tracing::debug;

use crate::engine::EngineGraph;
use crate::error::{Error, Result};
use crate::res::{Resource, SendRecvLink, Vertex};

/// Outcome of one field transfer, reported to the caller of the process
/// step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvUpdate {
    /// Receiver `kind[name]`.
    pub receiver: String,

    /// Receiver field that was wired.
    pub field: String,

    /// Whether the value actually moved.
    pub changed: bool,
}

/// Run every receive wiring of `v` (and of every resource grouped into it).
/// Returns one update record per wired field.
pub(crate) fn update_values(graph: &EngineGraph, v: &Vertex) -> Result<Vec<RecvUpdate>> {
    let mut updates = Vec::new();
    for receiver in receivers_of(v.resource()) {
        transfer_into(graph, &receiver, &mut updates)?;
    }
    Ok(updates)
}

/// The resource itself plus, recursively, everything grouped into it.
fn receivers_of(res: &Arc<dyn Resource>) -> Vec<Arc<dyn Resource>> {
    let mut out = vec![Arc::clone(res)];
    if let Some(g) = res.as_groupable() {
        for child in g.grouped() {
            out.extend(receivers_of(child.resource()));
        }
    }
    out
}

fn transfer_into(
    graph: &EngineGraph,
    receiver: &Arc<dyn Resource>,
    updates: &mut Vec<RecvUpdate>,
) -> Result<()> {
    let Some(recv) = receiver.as_recvable() else {
        return Ok(());
    };
    let receiver_key = format!("{}[{}]", receiver.kind(), receiver.name());

    for (field, link) in recv.recv() {
        let sender = find_sender(graph, &link).ok_or_else(|| {
            Error::SendRecv(format!(
                "{receiver_key}.{field}: sender {}[{}] not in graph",
                link.kind, link.name
            ))
        })?;
        let sendable = sender.as_sendable().ok_or_else(|| {
            Error::SendRecv(format!(
                "{receiver_key}.{field}: {}[{}] does not send",
                link.kind, link.name
            ))
        })?;
        let sent = sendable.sent().ok_or_else(|| {
            Error::SendRecv(format!(
                "{receiver_key}.{field}: {}[{}] has not published yet",
                link.kind, link.name
            ))
        })?;
        let value = sent.get(&link.key).ok_or_else(|| {
            Error::SendRecv(format!(
                "{receiver_key}.{field}: {}[{}] publishes no key {:?}",
                link.kind, link.name, link.key
            ))
        })?;

        let changed = recv.recv_value(&field).as_ref() != Some(value);
        if changed {
            recv.set_recv_value(&field, value.clone())?;
            recv.set_changed(&field, true);
            receiver.validate()?;
            debug!(receiver = %receiver_key, field = %field, "recv value updated");
        }
        updates.push(RecvUpdate {
            receiver: receiver_key.clone(),
            field,
            changed,
        });
    }
    Ok(())
}

/// Locate the sender resource, looking through grouped children as well.
fn find_sender(graph: &EngineGraph, link: &SendRecvLink) -> Option<Arc<dyn Resource>> {
    for v in graph.vertices_sorted() {
        if let Some(found) = search(v.resource(), link) {
            return Some(found);
        }
    }
    None
}

fn search(res: &Arc<dyn Resource>, link: &SendRecvLink) -> Option<Arc<dyn Resource>> {
    if res.kind() == link.kind && res.name() == link.name {
        return Some(Arc::clone(res));
    }
    if let Some(g) = res.as_groupable() {
        for child in g.grouped() {
            if let Some(found) = search(child.resource(), link) {
                return Some(found);
            }
        }
    }
    None
}

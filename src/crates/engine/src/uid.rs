//! Unique identifiers for automatic edge inference.
//!
//! Each edgeable resource *presents* a set of [`ResUID`]s describing what it
//! provides (a file path, a user name, a service unit) and may *seek* UIDs
//! describing what it depends on. Two UIDs match iff [`ResUID::iff`] accepts
//! the pair; matching presented/sought UIDs become inferred graph edges.

use std::any::Any;
use std::fmt;

/// A unique identifier presented or sought by a resource.
///
/// `iff` is asymmetric only by convention; real implementations honor
/// symmetry on match. The concrete type matters: the edge-inference index
/// buckets presented UIDs by `TypeId` so a seek UID first probes the bucket
/// of its own concrete type and only falls back to a linear scan when no
/// such bucket exists (the base/abstract UID case).
pub trait ResUID: Send + Sync + fmt::Debug {
    /// Resource kind this UID belongs to.
    fn kind(&self) -> &str;

    /// Resource name this UID belongs to.
    fn name(&self) -> String;

    /// Edge direction on match: `true` means the matched target becomes the
    /// predecessor (`target -> seeker`), `false` the successor.
    fn reversed(&self) -> bool;

    /// Whether `other` satisfies this UID.
    fn iff(&self, other: &dyn ResUID) -> bool;

    fn as_any(&self) -> &dyn Any;

    /// Canonical string form, used in the edge-inference cache fingerprint.
    fn uid_str(&self) -> String {
        format!(
            "{}[{}]{}",
            self.kind(),
            self.name(),
            if self.reversed() { "<" } else { ">" }
        )
    }
}

/// The common UID: two base UIDs match when kind and name are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUID {
    pub kind: String,
    pub name: String,
    pub reversed: bool,
}

impl BaseUID {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            reversed: false,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }
}

impl ResUID for BaseUID {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn reversed(&self) -> bool {
        self.reversed
    }

    fn iff(&self, other: &dyn ResUID) -> bool {
        self.kind == other.kind() && self.name == other.name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Iterator over the batches of UIDs a resource seeks.
///
/// `next_batch` returns `None` when exhausted. After each batch the engine
/// reports back one bool per UID (`true` iff a matching target vertex was
/// found, even when the edge was elided as transitive); `test` returns
/// `false` to stop iteration early.
pub trait AutoEdgeIter: Send {
    fn next_batch(&mut self) -> Option<Vec<Box<dyn ResUID>>>;

    fn test(&mut self, matches: &[bool]) -> bool;
}

/// A fixed sequence of single-UID batches that stops as soon as one batch
/// matched. Covers the common "nearest dependency wins" pattern, e.g. a
/// file seeking its closest existing parent directory.
pub struct FirstMatchIter {
    batches: std::vec::IntoIter<Vec<Box<dyn ResUID>>>,
}

impl FirstMatchIter {
    pub fn new(batches: Vec<Vec<Box<dyn ResUID>>>) -> Self {
        Self {
            batches: batches.into_iter(),
        }
    }
}

impl AutoEdgeIter for FirstMatchIter {
    fn next_batch(&mut self) -> Option<Vec<Box<dyn ResUID>>> {
        self.batches.next()
    }

    fn test(&mut self, matches: &[bool]) -> bool {
        // keep going only while nothing matched
        !matches.iter().any(|m| *m)
    }
}

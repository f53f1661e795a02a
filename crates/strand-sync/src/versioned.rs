//! Versioned values and the sibling reconciliation rule.
//!
//! Every stored value carries the vector clock of the write that produced
//! it. When two versions of the same key meet — on a local write or on
//! receipt of remote values — the dominating one displaces the dominated
//! one, concurrent ones coexist as siblings, and equal ones dedup. This
//! single rule is the merge primitive of the whole subsystem.

use serde::{Deserialize, Serialize};

use crate::version::{now_ms, Occurred, VectorClock};

/// A value stamped with the vector clock of the write that produced it.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<V> {
    /// The stored value.
    pub value: V,
    /// Causal version of the write.
    pub version: VectorClock,
}

impl<V> Versioned<V> {
    /// Create a versioned value.
    pub fn new(value: V, version: VectorClock) -> Self {
        Self { value, version }
    }
}

/// A retained entry in a store's per-key sibling set.
///
/// A `None` value is a tombstone: the key was deleted at this version.
/// Tombstones carry their local arrival stamp so the garbage collector can
/// retire them after the grace period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Causal version of the write or deletion.
    pub version: VectorClock,
    /// Stored bytes; `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
    /// When a tombstone was written or first observed locally.
    pub tombstoned_at_ms: Option<u64>,
}

impl VersionedValue {
    /// A live value entry.
    pub fn live(value: Vec<u8>, version: VectorClock) -> Self {
        Self {
            version,
            value: Some(value),
            tombstoned_at_ms: None,
        }
    }

    /// A tombstone entry stamped now.
    pub fn tombstone(version: VectorClock) -> Self {
        Self {
            version,
            value: None,
            tombstoned_at_ms: Some(now_ms()),
        }
    }

    /// True when this entry marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Apply the reconciliation rule: fold `candidate` into the sibling set.
///
/// Returns true when the set changed. A candidate dominated by (or equal
/// to) any retained sibling is dropped; a candidate that dominates
/// siblings displaces them; a concurrent candidate is added alongside.
pub fn reconcile(siblings: &mut Vec<VersionedValue>, candidate: VersionedValue) -> bool {
    for existing in siblings.iter() {
        match candidate.version.compare(&existing.version) {
            Occurred::Before | Occurred::Equal => return false,
            Occurred::After | Occurred::Concurrent => {}
        }
    }
    siblings.retain(|existing| {
        !matches!(existing.version.compare(&candidate.version), Occurred::Before)
    });
    siblings.push(candidate);
    true
}

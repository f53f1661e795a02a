//! Vector clocks: causal version stamps for replicated store entries.
//!
//! A clock maps node ids to update counters. Two clocks are comparable
//! when one dominates the other pointwise; otherwise the writes they stamp
//! happened concurrently and both survive as siblings. The wall-clock
//! timestamp rides along for human-readable conflict display and
//! participates in no causal decision.

use serde::{Deserialize, Serialize};

/// Unique identifier of a cluster member.
pub type NodeId = u16;

/// Identifier of a leader-election domain.
pub type DomainId = u16;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurred {
    /// Every entry of the left clock is <= the right, at least one strictly.
    Before,
    /// Symmetric case of [`Occurred::Before`].
    After,
    /// All entries match.
    Equal,
    /// Neither clock dominates; the writes are concurrent.
    Concurrent,
}

/// One node's counter within a vector clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    /// Node that performed the updates.
    pub node_id: NodeId,
    /// Number of updates stamped by that node.
    pub counter: u64,
}

/// A vector clock: per-node counters plus an advisory wall-clock stamp.
///
/// Entries are kept sorted by node id and unique per node id. A missing
/// entry is counter 0.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VectorClock {
    entries: Vec<ClockEntry>,
    /// Wall-clock time of the last stamped update (advisory only).
    pub timestamp_ms: u64,
}

impl VectorClock {
    /// The empty clock (all counters zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// The entries of this clock, sorted by node id.
    pub fn entries(&self) -> &[ClockEntry] {
        &self.entries
    }

    /// True when no node has stamped this clock.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The counter for a node; 0 when absent.
    pub fn counter(&self, node_id: NodeId) -> u64 {
        self.entries
            .binary_search_by_key(&node_id, |e| e.node_id)
            .map(|i| self.entries[i].counter)
            .unwrap_or(0)
    }

    /// A new clock with `node_id`'s counter one greater than in this
    /// clock, all other entries copied, and the timestamp set to now.
    pub fn incremented(&self, node_id: NodeId) -> Self {
        let mut entries = self.entries.clone();
        match entries.binary_search_by_key(&node_id, |e| e.node_id) {
            Ok(i) => entries[i].counter += 1,
            Err(i) => entries.insert(i, ClockEntry { node_id, counter: 1 }),
        }
        Self {
            entries,
            timestamp_ms: now_ms(),
        }
    }

    /// Pointwise comparison over the union of node ids (absent = 0).
    pub fn compare(&self, other: &Self) -> Occurred {
        let mut self_less = false;
        let mut other_less = false;

        let mut a = self.entries.iter().peekable();
        let mut b = other.entries.iter().peekable();
        loop {
            let (ac, bc) = match (a.peek(), b.peek()) {
                (None, None) => break,
                (Some(ae), None) => {
                    let c = ae.counter;
                    a.next();
                    (c, 0)
                }
                (None, Some(be)) => {
                    let c = be.counter;
                    b.next();
                    (0, c)
                }
                (Some(ae), Some(be)) => {
                    if ae.node_id < be.node_id {
                        let c = ae.counter;
                        a.next();
                        (c, 0)
                    } else if ae.node_id > be.node_id {
                        let c = be.counter;
                        b.next();
                        (0, c)
                    } else {
                        let pair = (ae.counter, be.counter);
                        a.next();
                        b.next();
                        pair
                    }
                }
            };
            if ac < bc {
                self_less = true;
            } else if ac > bc {
                other_less = true;
            }
        }

        match (self_less, other_less) {
            (false, false) => Occurred::Equal,
            (true, false) => Occurred::Before,
            (false, true) => Occurred::After,
            (true, true) => Occurred::Concurrent,
        }
    }

    /// Pointwise maximum of two clocks; timestamp is the max of the two.
    pub fn merge(&self, other: &Self) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len().max(other.entries.len()));
        let mut a = self.entries.iter().peekable();
        let mut b = other.entries.iter().peekable();
        loop {
            match (a.peek(), b.peek()) {
                (None, None) => break,
                (Some(&&e), None) => {
                    entries.push(e);
                    a.next();
                }
                (None, Some(&&e)) => {
                    entries.push(e);
                    b.next();
                }
                (Some(&&ae), Some(&&be)) => {
                    if ae.node_id < be.node_id {
                        entries.push(ae);
                        a.next();
                    } else if ae.node_id > be.node_id {
                        entries.push(be);
                        b.next();
                    } else {
                        entries.push(ClockEntry {
                            node_id: ae.node_id,
                            counter: ae.counter.max(be.counter),
                        });
                        a.next();
                        b.next();
                    }
                }
            }
        }
        Self {
            entries,
            timestamp_ms: self.timestamp_ms.max(other.timestamp_ms),
        }
    }

    /// True when this clock is dominated by (or equal to) any clock in
    /// `held`. Used to decide whether an offered version is news.
    pub fn dominated_by_any(&self, held: &[VectorClock]) -> bool {
        held.iter()
            .any(|h| matches!(self.compare(h), Occurred::Before | Occurred::Equal))
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", e.node_id, e.counter)?;
        }
        write!(f, "}}")
    }
}

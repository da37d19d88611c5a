//! Vector clocks for causal ordering across replicas.
//!
//! Each replica (a shard, an agent, a session participant) owns one counter
//! in the clock. `increment` advances a replica's own counter; `merge` takes
//! the pointwise maximum of two clocks; `update` does both at once, the
//! pattern used whenever a replica applies an operation it received from a
//! peer. `compare` resolves the four possible causal relationships between
//! two clocks.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;

/// Identifier for a clock participant (shard id, agent id, participant id).
pub type NodeId = String;

/// The four possible causal relationships between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

/// A vector clock mapping node id to logical counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    clock: HashMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            clock: HashMap::new(),
        }
    }

    /// Read a single node's counter, 0 if the node has never been observed.
    pub fn get(&self, node_id: &str) -> u64 {
        self.clock.get(node_id).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.clock.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Advance `node_id`'s own counter by one.
    pub fn increment(&mut self, node_id: &str) {
        *self.clock.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Pointwise maximum of two clocks, the join operation in the clock's
    /// lattice. Commutative, associative and idempotent.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &count) in &other.clock {
            let entry = self.clock.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Merge then increment `node_id`'s own counter. The usual shape for
    /// "I received this clock from a peer and am about to apply an op".
    pub fn update(&mut self, node_id: &str, other: &VectorClock) {
        self.merge(other);
        self.increment(node_id);
    }

    /// Resolve the causal relationship of `self` to `other`.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        let mut nodes: std::collections::HashSet<&str> =
            self.clock.keys().map(|s| s.as_str()).collect();
        nodes.extend(other.clock.keys().map(|s| s.as_str()));

        for node in nodes {
            match self.get(node).cmp(&other.get(node)) {
                CmpOrdering::Greater => self_ahead = true,
                CmpOrdering::Less => other_ahead = true,
                CmpOrdering::Equal => {}
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn happens_before(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::Before)
    }

    pub fn happens_after(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::After)
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::Concurrent)
    }

    /// True if every entry in this clock is already reflected (>=) in all of
    /// `known_clocks` except the entry owned by that observer itself. Used
    /// to decide whether an operation can be safely garbage collected: once
    /// every peer has causally observed it, no future gossip round needs it.
    pub fn is_causally_stable<'a, I>(&self, known_clocks: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a VectorClock)>,
    {
        for (observer, observed) in known_clocks {
            for (node, ts) in self.entries() {
                if node != observer && observed.get(node) < ts {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_advances_own_counter_only() {
        let mut vc = VectorClock::new();
        vc.increment("a");
        vc.increment("a");
        assert_eq!(vc.get("a"), 2);
        assert_eq!(vc.get("b"), 0);
    }

    #[test]
    fn merge_takes_pointwise_max() {
        let mut a = VectorClock::new();
        a.increment("a");
        a.increment("a");
        let mut b = VectorClock::new();
        b.increment("b");
        b.increment("b");
        b.increment("b");

        a.merge(&b);
        assert_eq!(a.get("a"), 2);
        assert_eq!(a.get("b"), 3);
    }

    #[test]
    fn compare_is_total_over_four_states() {
        let mut a = VectorClock::new();
        a.increment("a");
        let equal = a.clone();
        assert_eq!(a.compare(&equal), ClockOrdering::Equal);

        let mut ahead = a.clone();
        ahead.increment("a");
        assert_eq!(ahead.compare(&a), ClockOrdering::After);
        assert_eq!(a.compare(&ahead), ClockOrdering::Before);

        let mut concurrent = VectorClock::new();
        concurrent.increment("b");
        assert_eq!(a.compare(&concurrent), ClockOrdering::Concurrent);
    }

    #[test]
    fn update_merges_then_increments_self() {
        let mut mine = VectorClock::new();
        mine.increment("mine");
        let mut theirs = VectorClock::new();
        theirs.increment("theirs");

        mine.update("mine", &theirs);
        assert_eq!(mine.get("mine"), 2);
        assert_eq!(mine.get("theirs"), 1);
    }

    #[test]
    fn causal_stability_requires_all_observers_caught_up() {
        let mut op_clock = VectorClock::new();
        op_clock.increment("shard-a");

        let mut caught_up = VectorClock::new();
        caught_up.increment("shard-a");
        let mut behind = VectorClock::new();

        let known = [("shard-b", &caught_up), ("shard-c", &behind)];
        assert!(!op_clock.is_causally_stable(known));

        let known_all_caught_up = [("shard-b", &caught_up)];
        assert!(op_clock.is_causally_stable(known_all_caught_up));
    }
}

//! Conflict-free replicated data types for local-first collaboration state.
//!
//! - G-Counter (grow-only counter)
//! - PN-Counter (increment/decrement counter)
//! - LWW-Register (last-writer-wins register)
//! - OR-Set (observed-remove set)
//! - RGA (replicated growable array, used for text/sequence collaboration)
//!
//! Every type implements `merge` as its join in the CRDT lattice: the
//! operation must be commutative, associative and idempotent so that
//! replicas converge regardless of gossip ordering.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use waypoint_vclock::VectorClock;

/// Node identifier for CRDT operations.
pub type NodeId = String;

// ============================================
// G-Counter (Grow-Only Counter)
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GCounter {
    node_id: NodeId,
    counts: HashMap<NodeId, u64>,
}

impl GCounter {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            counts: HashMap::new(),
        }
    }

    pub fn increment(&mut self, amount: u64) {
        *self.counts.entry(self.node_id.clone()).or_insert(0) += amount;
    }

    pub fn value(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn merge(&mut self, other: &GCounter) {
        for (node, count) in &other.counts {
            let entry = self.counts.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }
}

// ============================================
// PN-Counter (Positive-Negative Counter)
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PNCounter {
    positive: GCounter,
    negative: GCounter,
}

impl PNCounter {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        let id: NodeId = node_id.into();
        Self {
            positive: GCounter::new(id.clone()),
            negative: GCounter::new(id),
        }
    }

    pub fn increment(&mut self, amount: u64) {
        self.positive.increment(amount);
    }

    pub fn decrement(&mut self, amount: u64) {
        self.negative.increment(amount);
    }

    pub fn value(&self) -> i64 {
        self.positive.value() as i64 - self.negative.value() as i64
    }

    pub fn merge(&mut self, other: &PNCounter) {
        self.positive.merge(&other.positive);
        self.negative.merge(&other.negative);
    }
}

// ============================================
// LWW-Register (Last-Writer-Wins Register)
// ============================================

/// Last-Writer-Wins Register. Ties on timestamp are broken by comparing
/// node ids, so merge stays deterministic regardless of arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LwwRegister<T: Clone> {
    value: Option<T>,
    timestamp: f64,
    writer: NodeId,
}

impl<T: Clone> LwwRegister<T> {
    pub fn new() -> Self {
        Self {
            value: None,
            timestamp: 0.0,
            writer: String::new(),
        }
    }

    pub fn set(&mut self, value: T, node_id: impl Into<NodeId>, timestamp: f64) {
        let writer = node_id.into();
        if self.wins(timestamp, &writer) {
            self.value = Some(value);
            self.timestamp = timestamp;
            self.writer = writer;
        }
    }

    fn wins(&self, timestamp: f64, writer: &str) -> bool {
        timestamp > self.timestamp || (timestamp == self.timestamp && writer > self.writer.as_str())
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn merge(&mut self, other: &LwwRegister<T>) {
        if other.timestamp > self.timestamp
            || (other.timestamp == self.timestamp && other.writer > self.writer)
        {
            self.value = other.value.clone();
            self.timestamp = other.timestamp;
            self.writer = other.writer.clone();
        }
    }
}

impl<T: Clone> Default for LwwRegister<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// OR-Set (Observed-Remove Set)
// ============================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct Tagged<T: Clone + Eq + std::hash::Hash> {
    value: T,
    tag: String,
}

/// Observed-Remove Set with add-wins semantics: a concurrent add and remove
/// of the same value resolves to present, because the add's tag was never
/// observed by the remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrSet<T: Clone + Eq + std::hash::Hash> {
    node_id: NodeId,
    counter: u64,
    elements: HashSet<Tagged<T>>,
    tombstones: HashSet<String>,
}

impl<T: Clone + Eq + std::hash::Hash> OrSet<T> {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            counter: 0,
            elements: HashSet::new(),
            tombstones: HashSet::new(),
        }
    }

    pub fn add(&mut self, value: T) {
        self.counter += 1;
        let tag = format!("{}:{}", self.node_id, self.counter);
        self.elements.insert(Tagged { value, tag });
    }

    pub fn remove(&mut self, value: &T) {
        let to_remove: Vec<_> = self
            .elements
            .iter()
            .filter(|e| e.value == *value)
            .cloned()
            .collect();
        for elem in to_remove {
            self.tombstones.insert(elem.tag.clone());
            self.elements.remove(&elem);
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.elements.iter().any(|e| e.value == *value)
    }

    pub fn values(&self) -> Vec<&T> {
        self.elements.iter().map(|e| &e.value).collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn merge(&mut self, other: &OrSet<T>) {
        for elem in &other.elements {
            if !self.tombstones.contains(&elem.tag) {
                self.elements.insert(elem.clone());
            }
        }
        self.tombstones.extend(other.tombstones.iter().cloned());
        self.elements.retain(|e| !self.tombstones.contains(&e.tag));
    }
}

// ============================================
// RGA (Replicated Growable Array)
// ============================================

/// One slot in an RGA. `value: None` marks a tombstone: the slot keeps its
/// place in sequence order but contributes nothing to `value()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RgaNode<T: Clone> {
    pub id: String,
    pub value: Option<T>,
    pub timestamp: f64,
    pub node_id: NodeId,
}

impl<T: Clone> RgaNode<T> {
    fn order_key(&self) -> (OrderedTimestamp, &str) {
        (OrderedTimestamp(self.timestamp), self.node_id.as_str())
    }
}

/// f64 wrapper giving a total order for sorting RGA nodes; timestamps in
/// this system are always finite wall-clock values.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
struct OrderedTimestamp(f64);
impl Eq for OrderedTimestamp {}
impl Ord for OrderedTimestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Replicated Growable Array: an ordered sequence CRDT used for
/// collaboratively edited text and lists. Inserts are anchored by a
/// (timestamp, node_id) key so concurrent inserts at the same position
/// converge to the same order on every replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rga<T: Clone> {
    node_id: NodeId,
    nodes: Vec<RgaNode<T>>,
    vector_clock: VectorClock,
}

impl<T: Clone> Rga<T> {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            nodes: Vec::new(),
            vector_clock: VectorClock::new(),
        }
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    fn visible_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.value.is_some())
            .map(|(i, _)| i)
    }

    /// Insert `value` at the given visible-position `index`, the same
    /// index space `value()` returns.
    pub fn insert(&mut self, index: usize, value: T, timestamp: f64) -> String {
        let physical = self.visible_indices().nth(index).unwrap_or(self.nodes.len());
        let id = format!("{timestamp}:{}", self.node_id);
        let node = RgaNode {
            id: id.clone(),
            value: Some(value),
            timestamp,
            node_id: self.node_id.clone(),
        };
        self.nodes.insert(physical, node);
        self.vector_clock.increment(&self.node_id);
        id
    }

    /// Tombstone the element currently at visible-position `index`.
    pub fn delete(&mut self, index: usize) -> Option<String> {
        let physical = self.visible_indices().nth(index)?;
        let node = &mut self.nodes[physical];
        node.value = None;
        self.vector_clock.increment(&self.node_id);
        Some(node.id.clone())
    }

    /// The materialized sequence: all non-tombstoned values, in order.
    pub fn value(&self) -> Vec<&T> {
        self.nodes.iter().filter_map(|n| n.value.as_ref()).collect()
    }

    /// Merge another replica's node set. Nodes are unioned by id; when the
    /// same id is a tombstone on either side, the merged result is a
    /// tombstone (deletes win over concurrent re-observation). The merged
    /// sequence is re-sorted by (timestamp, node_id) so all replicas land
    /// on the same order.
    pub fn merge(&mut self, other: &Rga<T>) {
        let mut by_id: HashMap<String, RgaNode<T>> = HashMap::new();
        for node in self.nodes.drain(..) {
            by_id.insert(node.id.clone(), node);
        }
        for node in &other.nodes {
            match by_id.get(&node.id) {
                Some(existing) if existing.value.is_none() || node.value.is_none() => {
                    by_id.insert(
                        node.id.clone(),
                        RgaNode {
                            id: node.id.clone(),
                            value: None,
                            timestamp: node.timestamp,
                            node_id: node.node_id.clone(),
                        },
                    );
                }
                Some(_) => {}
                None => {
                    by_id.insert(node.id.clone(), node.clone());
                }
            }
        }
        let mut merged: Vec<RgaNode<T>> = by_id.into_values().collect();
        merged.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        self.nodes = merged;
        self.vector_clock.merge(&other.vector_clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcounter_merge_takes_max_per_node() {
        let mut a = GCounter::new("a");
        a.increment(3);
        let mut b = GCounter::new("b");
        b.increment(5);
        a.merge(&b);
        assert_eq!(a.value(), 8);
    }

    #[test]
    fn pncounter_tracks_signed_value() {
        let mut c = PNCounter::new("a");
        c.increment(10);
        c.decrement(4);
        assert_eq!(c.value(), 6);
    }

    #[test]
    fn lww_register_merge_prefers_later_timestamp() {
        let mut a = LwwRegister::new();
        a.set("first", "node-a", 1.0);
        let mut b = LwwRegister::new();
        b.set("second", "node-b", 2.0);
        a.merge(&b);
        assert_eq!(a.get(), Some(&"second"));
    }

    #[test]
    fn lww_register_ties_broken_by_node_id() {
        let mut a = LwwRegister::new();
        a.set("from-a", "node-a", 5.0);
        let mut b = LwwRegister::new();
        b.set("from-b", "node-b", 5.0);
        a.merge(&b);
        assert_eq!(a.get(), Some(&"from-b"));
    }

    #[test]
    fn orset_add_wins_over_concurrent_remove() {
        let mut a = OrSet::new("a");
        a.add("x");
        let mut b = a.clone();
        b.remove(&"x");

        let mut c = a.clone();
        c.add("x");

        b.merge(&c);
        assert!(b.contains(&"x"));
    }

    #[test]
    fn rga_insert_and_value_order() {
        let mut rga = Rga::new("a");
        rga.insert(0, 'h', 1.0);
        rga.insert(1, 'i', 2.0);
        assert_eq!(rga.value(), vec![&'h', &'i']);
    }

    #[test]
    fn rga_delete_tombstones_without_shifting_ids() {
        let mut rga = Rga::new("a");
        rga.insert(0, 'h', 1.0);
        rga.insert(1, 'i', 2.0);
        rga.delete(0);
        assert_eq!(rga.value(), vec![&'i']);
    }

    #[test]
    fn rga_merge_converges_concurrent_inserts() {
        let mut a = Rga::new("node-a");
        a.insert(0, "base", 1.0);

        let mut b = a.clone();

        a.insert(1, "from-a", 2.0);
        b.insert(1, "from-b", 2.5);

        a.merge(&b);
        b.merge(&a);
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn rga_merge_delete_wins_over_concurrent_presence() {
        let mut a = Rga::new("node-a");
        a.insert(0, "shared", 1.0);
        let mut b = a.clone();

        a.delete(0);

        b.merge(&a);
        assert!(b.value().is_empty());
    }
}

//! Consistent-hash sharding for collaboration participants.
//!
//! A [`ConsistentHash`] ring maps arbitrary keys to shard ids using
//! virtual nodes, so adding or removing a shard only reshuffles a small
//! fraction of keys. [`ShardManager`] layers capacity and health tracking
//! on top: each [`Shard`] has a participant cap, and assignment falls
//! back through replica candidates and finally a least-loaded scan when
//! the primary shard is full.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

const DEFAULT_VIRTUAL_NODES: usize = 150;
const DEFAULT_SHARD_COUNT: usize = 30;
const DEFAULT_SHARD_CAPACITY: u32 = 1000;

fn ring_hash(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_be_bytes(digest[28..32].try_into().expect("sha256 digest is 32 bytes"))
}

/// SHA-256-based hash ring over a 2^32 key space, with `virtual_nodes`
/// points per shard to keep the distribution even.
#[derive(Debug, Clone)]
pub struct ConsistentHash {
    ring: std::collections::BTreeMap<u32, String>,
    virtual_nodes: usize,
    shards: HashSet<String>,
}

impl Default for ConsistentHash {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl ConsistentHash {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: std::collections::BTreeMap::new(),
            virtual_nodes,
            shards: HashSet::new(),
        }
    }

    pub fn add_shard(&mut self, shard_id: &str) {
        for i in 0..self.virtual_nodes {
            let key = ring_hash(&format!("{shard_id}:{i}"));
            self.ring.insert(key, shard_id.to_string());
        }
        self.shards.insert(shard_id.to_string());
    }

    pub fn remove_shard(&mut self, shard_id: &str) {
        self.ring.retain(|_, v| v != shard_id);
        self.shards.remove(shard_id);
    }

    /// The shard owning `key`: the first ring point at or after `hash(key)`,
    /// wrapping around to the smallest point if `key` hashes past the end.
    pub fn get_shard(&self, key: &str) -> Option<&str> {
        let h = ring_hash(key);
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, shard)| shard.as_str())
    }

    /// Walk the ring forward from `key`'s position collecting up to `n`
    /// distinct shard ids, for replica placement.
    pub fn get_n_shards(&self, key: &str, n: usize) -> Vec<String> {
        if self.shards.is_empty() || n == 0 {
            return Vec::new();
        }
        let h = ring_hash(key);
        let mut result = Vec::new();
        let forward = self.ring.range(h..).chain(self.ring.iter());
        for (_, shard) in forward {
            if !result.contains(shard) {
                result.push(shard.clone());
            }
            if result.len() == n {
                break;
            }
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Healthy,
    Degraded,
    Overloaded,
    Draining,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    pub capacity: u32,
    pub participants: HashSet<String>,
    pub peer_shards: HashSet<String>,
    pub status: ShardStatus,
}

impl Shard {
    pub fn new(id: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            capacity,
            participants: HashSet::new(),
            peer_shards: HashSet::new(),
            status: ShardStatus::Healthy,
        }
    }

    pub fn participant_count(&self) -> u32 {
        self.participants.len() as u32
    }

    pub fn load_percentage(&self) -> f64 {
        if self.capacity == 0 {
            return 100.0;
        }
        (self.participant_count() as f64 / self.capacity as f64) * 100.0
    }

    pub fn is_available(&self) -> bool {
        matches!(self.status, ShardStatus::Healthy | ShardStatus::Degraded)
            && self.participant_count() < self.capacity
    }

    fn refresh_status(&mut self) {
        if self.status == ShardStatus::Draining {
            return;
        }
        let load = self.load_percentage();
        self.status = if load >= 95.0 {
            ShardStatus::Overloaded
        } else if load >= 80.0 {
            ShardStatus::Degraded
        } else {
            ShardStatus::Healthy
        };
    }

    pub fn add_participant(&mut self, participant_id: &str) {
        self.participants.insert(participant_id.to_string());
        self.refresh_status();
    }

    pub fn remove_participant(&mut self, participant_id: &str) {
        self.participants.remove(participant_id);
        self.refresh_status();
    }

    /// Draining is sticky: once set, `refresh_status` leaves it alone
    /// until the shard is removed.
    pub fn start_draining(&mut self) {
        self.status = ShardStatus::Draining;
    }
}

pub struct ShardManager {
    shards: HashMap<String, Shard>,
    hash_ring: ConsistentHash,
    shard_capacity: u32,
}

impl Default for ShardManager {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT, DEFAULT_SHARD_CAPACITY)
    }
}

impl ShardManager {
    pub fn new(shard_count: usize, shard_capacity: u32) -> Self {
        let mut manager = Self {
            shards: HashMap::new(),
            hash_ring: ConsistentHash::default(),
            shard_capacity,
        };
        manager.initialize_shards(shard_count);
        manager
    }

    fn initialize_shards(&mut self, shard_count: usize) {
        let ids: Vec<String> = (0..shard_count).map(|i| format!("{i:03}")).collect();
        for id in &ids {
            self.shards.insert(id.clone(), Shard::new(id.clone(), self.shard_capacity));
            self.hash_ring.add_shard(id);
        }
        for (i, id) in ids.iter().enumerate() {
            let prev = &ids[(i + ids.len() - 1) % ids.len()];
            let next = &ids[(i + 1) % ids.len()];
            if let Some(shard) = self.shards.get_mut(id) {
                shard.peer_shards.insert(prev.clone());
                shard.peer_shards.insert(next.clone());
            }
        }
    }

    fn find_available_shard(&self, participant_id: &str) -> Option<String> {
        for candidate in self.hash_ring.get_n_shards(participant_id, 3) {
            if self.shards.get(&candidate).is_some_and(Shard::is_available) {
                return Some(candidate);
            }
        }
        self.shards
            .values()
            .filter(|s| s.is_available())
            .min_by(|a, b| a.load_percentage().partial_cmp(&b.load_percentage()).unwrap())
            .map(|s| s.id.clone())
    }

    pub fn assign_shard(&mut self, participant_id: &str) -> Option<String> {
        let primary = self.hash_ring.get_shard(participant_id).map(str::to_string);
        let target = match primary {
            Some(id) if self.shards.get(&id).is_some_and(Shard::is_available) => Some(id),
            _ => self.find_available_shard(participant_id),
        }?;

        self.shards.get_mut(&target)?.add_participant(participant_id);
        Some(target)
    }

    pub fn remove_participant(&mut self, participant_id: &str) {
        for shard in self.shards.values_mut() {
            if shard.participants.contains(participant_id) {
                shard.remove_participant(participant_id);
                break;
            }
        }
    }

    pub fn get_shard(&self, shard_id: &str) -> Option<&Shard> {
        self.shards.get(shard_id)
    }

    pub fn shard_ids(&self) -> Vec<String> {
        self.shards.keys().cloned().collect()
    }

    pub fn get_participant_shard(&self, participant_id: &str) -> Option<&str> {
        self.shards
            .values()
            .find(|s| s.participants.contains(participant_id))
            .map(|s| s.id.as_str())
    }

    /// Grow the ring by one shard, peered with the current last and first
    /// shard in insertion order.
    pub fn add_shard(&mut self) -> String {
        let new_id = format!("{:03}", self.shards.len());
        let mut shard = Shard::new(new_id.clone(), self.shard_capacity);
        if let Some(first) = self.shards.keys().min().cloned() {
            shard.peer_shards.insert(first);
        }
        self.shards.insert(new_id.clone(), shard);
        self.hash_ring.add_shard(&new_id);
        new_id
    }

    /// Mark a shard draining and return its participants for relocation.
    pub fn drain_shard(&mut self, shard_id: &str) -> Vec<String> {
        let Some(shard) = self.shards.get_mut(shard_id) else {
            return Vec::new();
        };
        shard.start_draining();
        shard.participants.iter().cloned().collect()
    }

    /// Move participants off shards over 80% load onto shards under 50%
    /// load, leaving each overloaded shard at roughly 70% capacity.
    pub fn rebalance(&mut self) {
        let overloaded: Vec<String> = self
            .shards
            .values()
            .filter(|s| s.load_percentage() > 80.0)
            .map(|s| s.id.clone())
            .collect();

        for shard_id in overloaded {
            let target_count = (self.shard_capacity as f64 * 0.7) as u32;
            let current = self.shards[&shard_id].participant_count();
            let to_move = current.saturating_sub(target_count);
            if to_move == 0 {
                continue;
            }

            let moving: Vec<String> = self.shards[&shard_id]
                .participants
                .iter()
                .take(to_move as usize)
                .cloned()
                .collect();

            for participant in moving {
                let destination = self
                    .shards
                    .values()
                    .filter(|s| s.id != shard_id && s.load_percentage() < 50.0)
                    .min_by(|a, b| a.load_percentage().partial_cmp(&b.load_percentage()).unwrap())
                    .map(|s| s.id.clone());

                let Some(destination) = destination else { break };
                self.shards.get_mut(&shard_id).unwrap().remove_participant(&participant);
                self.shards.get_mut(&destination).unwrap().add_participant(&participant);
            }
        }
    }

    pub fn total_participants(&self) -> usize {
        self.shards.values().map(|s| s.participants.len()).sum()
    }

    pub fn total_capacity(&self) -> u32 {
        self.shards.values().map(|s| s.capacity).sum()
    }

    pub fn healthy_shard_count(&self) -> usize {
        self.shards.values().filter(|s| s.status == ShardStatus::Healthy).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_assigns_deterministically() {
        let mut ring = ConsistentHash::default();
        ring.add_shard("a");
        ring.add_shard("b");
        let first = ring.get_shard("participant-42");
        let second = ring.get_shard("participant-42");
        assert_eq!(first, second);
    }

    #[test]
    fn removing_a_shard_reassigns_its_keys() {
        let mut ring = ConsistentHash::default();
        ring.add_shard("a");
        ring.add_shard("b");
        ring.add_shard("c");
        let owner = ring.get_shard("participant-42").unwrap().to_string();
        ring.remove_shard(&owner);
        let new_owner = ring.get_shard("participant-42").unwrap();
        assert_ne!(owner, new_owner);
    }

    #[test]
    fn status_escalates_with_load() {
        let mut shard = Shard::new("s", 10);
        for i in 0..9 {
            shard.add_participant(&format!("p{i}"));
        }
        assert_eq!(shard.status, ShardStatus::Degraded);
        shard.add_participant("p9");
        assert_eq!(shard.status, ShardStatus::Overloaded);
    }

    #[test]
    fn draining_is_sticky() {
        let mut shard = Shard::new("s", 10);
        shard.add_participant("p0");
        shard.start_draining();
        shard.remove_participant("p0");
        assert_eq!(shard.status, ShardStatus::Draining);
    }

    #[test]
    fn manager_assigns_and_tracks_participants() {
        let mut manager = ShardManager::new(4, 1000);
        let shard_id = manager.assign_shard("participant-1").unwrap();
        assert_eq!(manager.get_participant_shard("participant-1"), Some(shard_id.as_str()));
        manager.remove_participant("participant-1");
        assert_eq!(manager.get_participant_shard("participant-1"), None);
    }

    #[test]
    fn manager_falls_back_when_primary_shard_is_full() {
        let mut manager = ShardManager::new(1, 1);
        manager.assign_shard("first");
        let second = manager.assign_shard("second");
        assert!(second.is_none());
    }

    #[test]
    fn drain_shard_returns_its_participants() {
        let mut manager = ShardManager::new(2, 10);
        manager.assign_shard("p1");
        let shard_id = manager.get_participant_shard("p1").unwrap().to_string();
        let drained = manager.drain_shard(&shard_id);
        assert_eq!(drained, vec!["p1".to_string()]);
    }
}

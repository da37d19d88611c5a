//! Push-pull gossip protocol with anti-entropy.
//!
//! Each shard runs one [`GossipProtocol`] instance. On a timer it picks a
//! random subset of peers (`fanout`) and sends each the operations they
//! haven't causally observed yet (per the sender's view of `known_clocks`).
//! The receiver folds in anything new, replies with whatever the sender is
//! missing, and periodically requests a full-state snapshot to recover
//! from any gaps ordinary gossip rounds missed.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use waypoint_vclock::VectorClock;

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipOperation {
    pub id: String,
    pub clock: VectorClock,
    pub shard_id: String,
    pub payload: serde_json::Value,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub from_shard: String,
    pub to_shard: String,
    pub vector_clock: VectorClock,
    pub digest: String,
    pub operations: Vec<GossipOperation>,
    pub anti_entropy: bool,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipResponse {
    pub from_shard: String,
    pub vector_clock: VectorClock,
    pub missing_operations: Vec<GossipOperation>,
    pub in_sync: bool,
    pub full_state: Option<Vec<GossipOperation>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipStats {
    pub shard_id: String,
    pub peer_count: usize,
    pub pending_operation_count: usize,
    pub known_peer_count: usize,
}

/// Delivery of outbound gossip messages; `waypoint-server` implements this
/// over HTTP/websocket to peer shards, tests implement it in-memory.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn send(&self, message: GossipMessage);
}

/// Invoked whenever gossip delivers operations this replica had not yet
/// seen, so the owning session/CRDT can apply them.
#[async_trait]
pub trait OperationSink: Send + Sync {
    async fn on_receive(&self, operations: &[GossipOperation]);
}

pub struct GossipProtocol {
    shard_id: String,
    peers: RwLock<HashSet<String>>,
    vector_clock: RwLock<VectorClock>,
    pending_operations: RwLock<VecDeque<GossipOperation>>,
    known_clocks: RwLock<HashMap<String, VectorClock>>,
    last_anti_entropy: StdMutex<f64>,
    pub gossip_interval_ms: u64,
    pub fanout: usize,
    pub max_operations_per_message: usize,
    pub anti_entropy_interval_s: f64,
}

impl GossipProtocol {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            peers: RwLock::new(HashSet::new()),
            vector_clock: RwLock::new(VectorClock::new()),
            pending_operations: RwLock::new(VecDeque::new()),
            known_clocks: RwLock::new(HashMap::new()),
            last_anti_entropy: StdMutex::new(now_secs()),
            gossip_interval_ms: 100,
            fanout: 2,
            max_operations_per_message: 100,
            anti_entropy_interval_s: 60.0,
        }
    }

    pub async fn add_peer(&self, peer: &str) {
        self.peers.write().await.insert(peer.to_string());
    }

    pub async fn remove_peer(&self, peer: &str) {
        self.peers.write().await.remove(peer);
    }

    pub async fn add_operation(&self, payload: serde_json::Value) -> GossipOperation {
        let mut clock = self.vector_clock.write().await;
        clock.increment(&self.shard_id);
        let op = GossipOperation {
            id: uuid_like(),
            clock: clock.clone(),
            shard_id: self.shard_id.clone(),
            payload,
            timestamp: now_secs(),
        };
        self.pending_operations.write().await.push_back(op.clone());
        op
    }

    async fn select_peers(&self) -> Vec<String> {
        let peers: Vec<String> = self.peers.read().await.iter().cloned().collect();
        if peers.len() <= self.fanout {
            return peers;
        }
        let mut rng = rand::rng();
        peers
            .choose_multiple(&mut rng, self.fanout)
            .cloned()
            .collect()
    }

    async fn compute_digest(&self) -> String {
        let clock = self.vector_clock.read().await;
        let mut entries: Vec<(&str, u64)> = clock.entries().collect();
        entries.sort();
        let mut hasher = Sha256::new();
        hasher.update(format!("{entries:?}").as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }

    pub async fn create_gossip_message(&self, to_shard: &str) -> GossipMessage {
        let known = self.known_clocks.read().await;
        let peer_clock = known.get(to_shard).cloned().unwrap_or_default();
        drop(known);

        let pending = self.pending_operations.read().await;
        let operations: Vec<GossipOperation> = pending
            .iter()
            .rev()
            .take(self.max_operations_per_message)
            .rev()
            .filter(|op| !op.clock.happens_before(&peer_clock))
            .cloned()
            .collect();
        drop(pending);

        let anti_entropy = {
            let mut last = self.last_anti_entropy.lock().unwrap();
            let elapsed = now_secs() - *last;
            if elapsed >= self.anti_entropy_interval_s {
                *last = now_secs();
                true
            } else {
                false
            }
        };

        GossipMessage {
            from_shard: self.shard_id.clone(),
            to_shard: to_shard.to_string(),
            vector_clock: self.vector_clock.read().await.clone(),
            digest: self.compute_digest().await,
            operations,
            anti_entropy,
            timestamp: now_secs(),
        }
    }

    /// Fold in an incoming message: apply anything new, and report back
    /// what the sender is missing.
    pub async fn receive_gossip(
        &self,
        message: GossipMessage,
        sink: &dyn OperationSink,
    ) -> GossipResponse {
        self.known_clocks
            .write()
            .await
            .insert(message.from_shard.clone(), message.vector_clock.clone());

        let missing_operations: Vec<GossipOperation> = self
            .pending_operations
            .read()
            .await
            .iter()
            .filter(|op| !op.clock.happens_before(&message.vector_clock))
            .cloned()
            .collect();

        let self_clock_before = self.vector_clock.read().await.clone();
        let new_ops: Vec<GossipOperation> = message
            .operations
            .into_iter()
            .filter(|op| !op.clock.happens_before(&self_clock_before))
            .collect();

        if !new_ops.is_empty() {
            self.pending_operations.write().await.extend(new_ops.iter().cloned());
            sink.on_receive(&new_ops).await;
        }

        self.vector_clock.write().await.merge(&message.vector_clock);

        let in_sync = self.compute_digest().await == message.digest;
        let full_state = if message.anti_entropy {
            Some(self.full_state_snapshot().await)
        } else {
            None
        };

        GossipResponse {
            from_shard: self.shard_id.clone(),
            vector_clock: self.vector_clock.read().await.clone(),
            missing_operations,
            in_sync,
            full_state,
        }
    }

    /// Last 1000 pending operations, offered to a peer requesting
    /// anti-entropy recovery.
    async fn full_state_snapshot(&self) -> Vec<GossipOperation> {
        let pending = self.pending_operations.read().await;
        pending.iter().rev().take(1000).rev().cloned().collect()
    }

    /// Apply a peer's response to an earlier gossip message: adopt
    /// anything in `missing_operations` we don't already have, and merge
    /// any full-state snapshot offered for anti-entropy recovery.
    pub async fn apply_response(&self, response: GossipResponse, sink: &dyn OperationSink) {
        self.known_clocks
            .write()
            .await
            .insert(response.from_shard.clone(), response.vector_clock.clone());

        let self_clock = self.vector_clock.read().await.clone();
        let missing: Vec<GossipOperation> = response
            .missing_operations
            .into_iter()
            .filter(|op| !op.clock.happens_before(&self_clock))
            .collect();

        if !missing.is_empty() {
            self.pending_operations.write().await.extend(missing.iter().cloned());
            sink.on_receive(&missing).await;
        }

        self.vector_clock.write().await.merge(&response.vector_clock);

        if let Some(full_state) = response.full_state {
            let existing: HashSet<String> =
                self.pending_operations.read().await.iter().map(|op| op.id.clone()).collect();
            let fresh: Vec<GossipOperation> =
                full_state.into_iter().filter(|op| !existing.contains(&op.id)).collect();
            if !fresh.is_empty() {
                self.pending_operations.write().await.extend(fresh);
            }
        }
    }

    pub async fn gossip_round(&self, transport: &dyn GossipTransport) {
        for peer in self.select_peers().await {
            let message = self.create_gossip_message(&peer).await;
            transport.send(message).await;
        }
    }

    /// Drop pending operations older than `max_age_seconds`; gossip's
    /// `pending_operations` is a working set, not the durable log.
    pub async fn prune_old_operations(&self, max_age_seconds: f64) {
        let cutoff = now_secs() - max_age_seconds;
        self.pending_operations.write().await.retain(|op| op.timestamp >= cutoff);
    }

    pub async fn stats(&self) -> GossipStats {
        GossipStats {
            shard_id: self.shard_id.clone(),
            peer_count: self.peers.read().await.len(),
            pending_operation_count: self.pending_operations.read().await.len(),
            known_peer_count: self.known_clocks.read().await.len(),
        }
    }
}

/// In-process [`GossipTransport`] for shards that all live in the same
/// binary: routes a message straight to the target's [`GossipProtocol`]
/// and feeds the response back into the sender, completing the push-pull
/// round without a real network hop.
pub struct GossipHub {
    protocols: RwLock<HashMap<String, Arc<GossipProtocol>>>,
    sink: Arc<dyn OperationSink>,
}

impl GossipHub {
    pub fn new(sink: Arc<dyn OperationSink>) -> Self {
        Self { protocols: RwLock::new(HashMap::new()), sink }
    }

    pub async fn register_shard(&self, shard_id: &str, protocol: Arc<GossipProtocol>) {
        self.protocols.write().await.insert(shard_id.to_string(), protocol);
    }

    /// Run one gossip round for every registered shard.
    pub async fn run_round(&self) {
        let protocols: Vec<Arc<GossipProtocol>> = self.protocols.read().await.values().cloned().collect();
        for protocol in protocols {
            protocol.gossip_round(self).await;
        }
    }
}

#[async_trait]
impl GossipTransport for GossipHub {
    async fn send(&self, message: GossipMessage) {
        let target = self.protocols.read().await.get(&message.to_shard).cloned();
        let Some(target) = target else { return };

        let from_shard = message.from_shard.clone();
        let response = target.receive_gossip(message, self.sink.as_ref()).await;

        let sender = self.protocols.read().await.get(&from_shard).cloned();
        if let Some(sender) = sender {
            sender.apply_response(response, self.sink.as_ref()).await;
        }
    }
}

fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{seq:x}", now_secs().to_bits())
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        count: AtomicUsize,
    }

    #[async_trait]
    impl OperationSink for CountingSink {
        async fn on_receive(&self, operations: &[GossipOperation]) {
            self.count.fetch_add(operations.len(), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn add_operation_advances_own_clock() {
        let protocol = GossipProtocol::new("shard-a");
        let op = protocol.add_operation(serde_json::json!({"k": "v"})).await;
        assert_eq!(op.clock.get("shard-a"), 1);
    }

    #[tokio::test]
    async fn gossip_message_only_carries_ops_peer_has_not_seen() {
        let sender = GossipProtocol::new("shard-a");
        sender.add_operation(serde_json::json!({"k": 1})).await;
        let message = sender.create_gossip_message("shard-b").await;
        assert_eq!(message.operations.len(), 1);
    }

    #[tokio::test]
    async fn receive_gossip_applies_new_operations_and_merges_clock() {
        let sender = GossipProtocol::new("shard-a");
        sender.add_operation(serde_json::json!({"k": 1})).await;
        let message = sender.create_gossip_message("shard-b").await;

        let receiver = GossipProtocol::new("shard-b");
        let sink = Arc::new(CountingSink { count: AtomicUsize::new(0) });
        let response = receiver.receive_gossip(message, sink.as_ref()).await;

        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
        assert_eq!(response.vector_clock.get("shard-a"), 1);
    }

    #[tokio::test]
    async fn prune_drops_operations_past_max_age() {
        let protocol = GossipProtocol::new("shard-a");
        protocol.add_operation(serde_json::json!({"k": 1})).await;
        protocol.prune_old_operations(-1.0).await;
        assert_eq!(protocol.stats().await.pending_operation_count, 0);
    }
}

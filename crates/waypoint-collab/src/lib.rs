//! Collaboration sessions: participants, CRDT document state, and the
//! plumbing that ties them to sharding and gossip for cross-replica sync.
//!
//! A session owns one CRDT (an [`waypoint_crdt::Rga`] sequence, an
//! LWW-register, or an OR-set, selected at creation) plus a vector clock.
//! Every accepted operation increments the clock, is applied to the CRDT,
//! is appended to the operation log, and — if the session has a gossip
//! protocol attached — is handed to it for propagation to other shards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;
use waypoint_crdt::{LwwRegister, OrSet, Rga};
use waypoint_gossip::{GossipOperation, GossipProtocol, OperationSink};
use waypoint_shard::ShardManager;
use waypoint_vclock::VectorClock;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("session {0} is full")]
    SessionFull(String),
    #[error("session {0} is not accepting participants")]
    SessionNotActive(String),
    #[error("participant {0} not found")]
    ParticipantNotFound(String),
    #[error("viewers cannot apply operations")]
    ViewerCannotEdit,
    #[error("operation kind does not match this session's CRDT type")]
    OperationKindMismatch,
    #[error("session {0} not found")]
    SessionNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Editor,
    Viewer,
    Observer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Connecting,
    Active,
    Idle,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorPosition {
    pub path: String,
    pub offset: u64,
    #[serde(default)]
    pub selection_start: Option<u64>,
    #[serde(default)]
    pub selection_end: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub session_id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub shard_id: Option<String>,
    pub cursor: Option<CursorPosition>,
    pub last_operation_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_snapshot_interval")]
    pub auto_snapshot_interval_ms: u64,
    #[serde(default = "default_max_op_size")]
    pub max_operation_size_bytes: u64,
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
    #[serde(default = "default_conflict_resolution")]
    pub conflict_resolution: String,
    #[serde(default = "default_true")]
    pub ot_enabled: bool,
}

fn default_snapshot_interval() -> u64 {
    60_000
}
fn default_max_op_size() -> u64 {
    1_048_576
}
fn default_gossip_interval() -> u64 {
    100
}
fn default_conflict_resolution() -> String {
    "lww".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_snapshot_interval_ms: default_snapshot_interval(),
            max_operation_size_bytes: default_max_op_size(),
            gossip_interval_ms: default_gossip_interval(),
            conflict_resolution: default_conflict_resolution(),
            ot_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub session_id: String,
    pub state: serde_json::Value,
    pub vector_clock: VectorClock,
    pub operation_count: usize,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrdtKind {
    Rga,
    Lww,
    OrSet,
}

pub enum CrdtState {
    Rga(Rga<serde_json::Value>),
    Lww(LwwRegister<serde_json::Value>),
    OrSet(OrSet<String>),
}

impl CrdtState {
    fn new(kind: CrdtKind, node_id: &str) -> Self {
        match kind {
            CrdtKind::Rga => CrdtState::Rga(Rga::new(node_id)),
            CrdtKind::Lww => CrdtState::Lww(LwwRegister::new()),
            CrdtKind::OrSet => CrdtState::OrSet(OrSet::new(node_id)),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            CrdtState::Rga(rga) => serde_json::to_value(rga.value()).unwrap_or_default(),
            CrdtState::Lww(reg) => serde_json::to_value(reg.get()).unwrap_or_default(),
            CrdtState::OrSet(set) => serde_json::to_value(set.values()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    Insert { index: usize, value: serde_json::Value },
    Delete { index: usize },
    Set { value: serde_json::Value },
    Add { value: String },
    Remove { value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub id: Uuid,
    pub session_id: String,
    pub participant_id: String,
    pub clock: VectorClock,
    pub timestamp: DateTime<Utc>,
    pub operation: OperationKind,
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub success: bool,
    pub vector_clock: VectorClock,
    pub operation_id: Uuid,
}

pub struct CollaborationSession {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub crdt_type: CrdtKind,
    pub max_participants: u32,
    pub settings: SessionSettings,
    state: CrdtState,
    pub vector_clock: VectorClock,
    participants: HashMap<String, Participant>,
    operations: Vec<AppliedOperation>,
    applied_ids: HashSet<Uuid>,
    pub assigned_shards: Vec<String>,
    pub primary_shard: Option<String>,
    gossip: Option<Arc<GossipProtocol>>,
    snapshots: Vec<SessionSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollaborationSession {
    pub fn new(name: impl Into<String>, crdt_type: CrdtKind, max_participants: u32, settings: SessionSettings) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            state: CrdtState::new(crdt_type, &id),
            id,
            name: name.into(),
            status: SessionStatus::Active,
            crdt_type,
            max_participants,
            settings,
            vector_clock: VectorClock::new(),
            participants: HashMap::new(),
            operations: Vec::new(),
            applied_ids: HashSet::new(),
            assigned_shards: Vec::new(),
            primary_shard: None,
            gossip: None,
            snapshots: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attach_gossip(&mut self, gossip: Arc<GossipProtocol>) {
        self.gossip = Some(gossip);
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn add_participant(
        &mut self,
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        role: ParticipantRole,
        shard_manager: &mut ShardManager,
    ) -> Result<Participant, CollabError> {
        if self.status != SessionStatus::Active {
            return Err(CollabError::SessionNotActive(self.id.clone()));
        }
        if self.participant_count() as u32 >= self.max_participants {
            return Err(CollabError::SessionFull(self.id.clone()));
        }

        let mut participant = Participant {
            id: Uuid::new_v4().to_string(),
            session_id: self.id.clone(),
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            role,
            status: ParticipantStatus::Connecting,
            shard_id: None,
            cursor: None,
            last_operation_at: None,
            joined_at: Utc::now(),
        };

        participant.shard_id = shard_manager.assign_shard(&participant.id);
        if self.primary_shard.is_none() {
            self.primary_shard = participant.shard_id.clone();
        }
        if let Some(shard_id) = &participant.shard_id {
            if !self.assigned_shards.contains(shard_id) {
                self.assigned_shards.push(shard_id.clone());
            }
        }
        participant.status = ParticipantStatus::Active;

        self.participants.insert(participant.id.clone(), participant.clone());
        self.updated_at = Utc::now();
        Ok(participant)
    }

    pub fn remove_participant(&mut self, participant_id: &str, shard_manager: &mut ShardManager) {
        if self.participants.remove(participant_id).is_some() {
            shard_manager.remove_participant(participant_id);
            self.updated_at = Utc::now();
        }
    }

    pub fn get_participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.get(participant_id)
    }

    pub fn update_cursor(&mut self, participant_id: &str, cursor: CursorPosition) -> Result<(), CollabError> {
        let participant = self
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| CollabError::ParticipantNotFound(participant_id.to_string()))?;
        participant.cursor = Some(cursor);
        Ok(())
    }

    /// Apply one operation on behalf of `participant_id`. Viewers may not
    /// mutate the document. The clock advances unconditionally on success,
    /// and the operation is handed to gossip for cross-shard propagation.
    pub async fn apply_operation(
        &mut self,
        operation: OperationKind,
        participant_id: &str,
    ) -> Result<ApplyResult, CollabError> {
        let participant = self
            .participants
            .get(participant_id)
            .ok_or_else(|| CollabError::ParticipantNotFound(participant_id.to_string()))?;
        if participant.role == ParticipantRole::Viewer {
            return Err(CollabError::ViewerCannotEdit);
        }

        self.apply_to_state(&operation)?;
        self.vector_clock.increment(participant_id);

        let applied = AppliedOperation {
            id: Uuid::new_v4(),
            session_id: self.id.clone(),
            participant_id: participant_id.to_string(),
            clock: self.vector_clock.clone(),
            timestamp: Utc::now(),
            operation: operation.clone(),
        };
        self.applied_ids.insert(applied.id);
        self.operations.push(applied.clone());

        if let Some(p) = self.participants.get_mut(participant_id) {
            p.last_operation_at = Some(applied.timestamp);
        }

        if let Some(gossip) = &self.gossip {
            let payload = serde_json::to_value(&applied).unwrap_or_default();
            gossip.add_operation(payload).await;
        }

        self.updated_at = Utc::now();
        Ok(ApplyResult {
            success: true,
            vector_clock: self.vector_clock.clone(),
            operation_id: applied.id,
        })
    }

    /// Apply an operation received from a peer replica via gossip. Already
    /// validated at its origin, so it skips the participant/role check and
    /// merges the clock rather than incrementing this session's own entry.
    /// A no-op if the operation id was already applied.
    pub fn apply_remote_operation(&mut self, applied: AppliedOperation) -> Result<(), CollabError> {
        if self.applied_ids.contains(&applied.id) {
            return Ok(());
        }

        self.apply_to_state(&applied.operation)?;
        self.vector_clock.merge(&applied.clock);
        self.applied_ids.insert(applied.id);
        self.operations.push(applied);
        self.updated_at = Utc::now();
        Ok(())
    }

    fn apply_to_state(&mut self, operation: &OperationKind) -> Result<(), CollabError> {
        match (&mut self.state, operation) {
            (CrdtState::Rga(rga), OperationKind::Insert { index, value }) => {
                rga.insert(*index, value.clone(), now_millis());
                Ok(())
            }
            (CrdtState::Rga(rga), OperationKind::Delete { index }) => {
                rga.delete(*index);
                Ok(())
            }
            (CrdtState::Lww(reg), OperationKind::Set { value }) => {
                reg.set(value.clone(), self.id.as_str(), now_millis());
                Ok(())
            }
            (CrdtState::OrSet(set), OperationKind::Add { value }) => {
                set.add(value.clone());
                Ok(())
            }
            (CrdtState::OrSet(set), OperationKind::Remove { value }) => {
                set.remove(value);
                Ok(())
            }
            _ => Err(CollabError::OperationKindMismatch),
        }
    }

    pub fn state_json(&self) -> serde_json::Value {
        self.state.to_json()
    }

    pub fn create_snapshot(&mut self) -> SessionSnapshot {
        let state = self.state.to_json();
        let size_bytes = state.to_string().len();
        let snapshot = SessionSnapshot {
            id: Uuid::new_v4(),
            session_id: self.id.clone(),
            state,
            vector_clock: self.vector_clock.clone(),
            operation_count: self.operations.len(),
            size_bytes,
            created_at: Utc::now(),
        };
        self.snapshots.push(snapshot.clone());
        snapshot
    }

    /// Every operation not yet causally observed by `since_clock`.
    pub fn state_delta(&self, since_clock: &VectorClock) -> Vec<AppliedOperation> {
        self.operations
            .iter()
            .filter(|op| op.clock.happens_after(since_clock))
            .cloned()
            .collect()
    }

    pub fn close(&mut self) -> SessionSnapshot {
        self.status = SessionStatus::Closing;
        let snapshot = self.create_snapshot();
        self.gossip = None;
        for participant in self.participants.values_mut() {
            participant.status = ParticipantStatus::Disconnected;
        }
        self.status = SessionStatus::Closed;
        snapshot
    }
}

fn now_millis() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as f64
}

pub struct JoinResult {
    pub participant: Participant,
    pub shard_id: Option<String>,
    pub state: serde_json::Value,
    pub vector_clock: VectorClock,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, CollaborationSession>>,
    shard_manager: RwLock<ShardManager>,
    shard_gossip: RwLock<HashMap<String, Arc<GossipProtocol>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            shard_manager: RwLock::new(ShardManager::default()),
            shard_gossip: RwLock::new(HashMap::new()),
        }
    }

    /// Associate a shard id with the [`GossipProtocol`] instance that owns
    /// cross-replica sync for data assigned to it. Sessions whose primary
    /// shard matches get that protocol attached as they're joined.
    pub async fn register_shard_gossip(&self, shard_id: &str, protocol: Arc<GossipProtocol>) {
        self.shard_gossip.write().await.insert(shard_id.to_string(), protocol);
    }

    /// Each shard id paired with its ring-neighbor peer ids, for wiring up
    /// one [`GossipProtocol`] per shard before any session exists.
    pub async fn shard_topology(&self) -> Vec<(String, Vec<String>)> {
        let shard_manager = self.shard_manager.read().await;
        shard_manager
            .shard_ids()
            .into_iter()
            .map(|id| {
                let peers = shard_manager
                    .get_shard(&id)
                    .map(|shard| shard.peer_shards.iter().cloned().collect())
                    .unwrap_or_default();
                (id, peers)
            })
            .collect()
    }

    pub async fn create_session(
        &self,
        name: impl Into<String>,
        crdt_type: CrdtKind,
        max_participants: u32,
        settings: SessionSettings,
    ) -> String {
        let session = CollaborationSession::new(name, crdt_type, max_participants, settings);
        let id = session.id.clone();
        self.sessions.write().await.insert(id.clone(), session);
        id
    }

    pub async fn join_session(
        &self,
        session_id: &str,
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        role: ParticipantRole,
    ) -> Result<JoinResult, CollabError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;
        let mut shard_manager = self.shard_manager.write().await;
        let participant = session.add_participant(entity_id, entity_type, role, &mut shard_manager)?;

        if let Some(shard_id) = session.primary_shard.clone() {
            if let Some(protocol) = self.shard_gossip.read().await.get(&shard_id).cloned() {
                session.attach_gossip(protocol);
            }
        }

        Ok(JoinResult {
            shard_id: participant.shard_id.clone(),
            state: session.state_json(),
            vector_clock: session.vector_clock.clone(),
            participant,
        })
    }

    /// Route a gossip-delivered operation to the session it belongs to.
    /// Used by [`SessionGossipSink`] when the gossip layer hands us
    /// operations a peer replica applied first.
    pub async fn apply_remote_operation(&self, applied: AppliedOperation) -> Result<(), CollabError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&applied.session_id)
            .ok_or_else(|| CollabError::SessionNotFound(applied.session_id.clone()))?;
        session.apply_remote_operation(applied)
    }

    pub async fn leave_session(&self, session_id: &str, participant_id: &str) -> Result<(), CollabError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;
        let mut shard_manager = self.shard_manager.write().await;
        session.remove_participant(participant_id, &mut shard_manager);
        Ok(())
    }

    pub async fn close_session(&self, session_id: &str) -> Result<SessionSnapshot, CollabError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;
        Ok(session.close())
    }

    pub async fn list_sessions(&self, status: Option<SessionStatus>, limit: usize, offset: usize) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| status.is_none_or(|want| s.status == want))
            .map(|s| s.id.clone())
            .skip(offset)
            .take(limit)
            .collect()
    }
}

/// Bridges the gossip layer's transport-agnostic [`OperationSink`] to a
/// [`SessionManager`]: decodes each [`GossipOperation`]'s payload back into
/// an [`AppliedOperation`] and applies it to the session it names.
pub struct SessionGossipSink {
    manager: Arc<SessionManager>,
}

impl SessionGossipSink {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl OperationSink for SessionGossipSink {
    async fn on_receive(&self, operations: &[GossipOperation]) {
        for op in operations {
            let applied: AppliedOperation = match serde_json::from_value(op.payload.clone()) {
                Ok(applied) => applied,
                Err(err) => {
                    tracing::warn!(error = %err, op_id = %op.id, "dropping gossip operation with undecodable payload");
                    continue;
                }
            };
            if let Err(err) = self.manager.apply_remote_operation(applied).await {
                tracing::warn!(error = %err, op_id = %op.id, "failed to apply gossip operation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_assigns_a_shard_and_returns_state() {
        let manager = SessionManager::new();
        let session_id = manager.create_session("doc", CrdtKind::Rga, 10, SessionSettings::default()).await;

        let joined = manager
            .join_session(&session_id, "agent-1", "agent", ParticipantRole::Editor)
            .await
            .unwrap();
        assert!(joined.shard_id.is_some());
    }

    #[tokio::test]
    async fn viewers_cannot_apply_operations() {
        let mut session = CollaborationSession::new("doc", CrdtKind::Rga, 10, SessionSettings::default());
        let mut shard_manager = ShardManager::default();
        let participant = session
            .add_participant("agent-1", "agent", ParticipantRole::Viewer, &mut shard_manager)
            .unwrap();

        let result = session
            .apply_operation(
                OperationKind::Insert { index: 0, value: serde_json::json!("x") },
                &participant.id,
            )
            .await;
        assert!(matches!(result, Err(CollabError::ViewerCannotEdit)));
    }

    #[tokio::test]
    async fn editors_can_insert_and_state_reflects_it() {
        let mut session = CollaborationSession::new("doc", CrdtKind::Rga, 10, SessionSettings::default());
        let mut shard_manager = ShardManager::default();
        let participant = session
            .add_participant("agent-1", "agent", ParticipantRole::Editor, &mut shard_manager)
            .unwrap();

        session
            .apply_operation(
                OperationKind::Insert { index: 0, value: serde_json::json!("hello") },
                &participant.id,
            )
            .await
            .unwrap();

        assert_eq!(session.state_json(), serde_json::json!(["hello"]));
    }

    #[tokio::test]
    async fn state_delta_only_returns_operations_after_given_clock() {
        let mut session = CollaborationSession::new("doc", CrdtKind::Rga, 10, SessionSettings::default());
        let mut shard_manager = ShardManager::default();
        let participant = session
            .add_participant("agent-1", "agent", ParticipantRole::Editor, &mut shard_manager)
            .unwrap();

        let baseline = session.vector_clock.clone();
        session
            .apply_operation(
                OperationKind::Insert { index: 0, value: serde_json::json!("hello") },
                &participant.id,
            )
            .await
            .unwrap();

        assert_eq!(session.state_delta(&baseline).len(), 1);
    }
}

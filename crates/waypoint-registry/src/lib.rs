//! Agent registry and session layer.
//!
//! Tracks every agent daemon that has ever registered, its current
//! status, and (while connected) a live session used to push messages to
//! it. Registration is upsert-or-refresh: reconnecting with the same id
//! updates the existing record instead of erroring, since an agent daemon
//! restarting and reconnecting is the common case, not an exceptional one.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

const DEFAULT_OFFLINE_THRESHOLD_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent {0} is not connected")]
    NotConnected(String),
    #[error("failed to deliver message to agent {agent_id}: {reason}")]
    DeliveryFailed { agent_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub docker: bool,
    #[serde(default)]
    pub python: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default = "default_git")]
    pub git: bool,
    #[serde(default)]
    pub disk_gb: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

fn default_git() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTelemetry {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub disk_percent: f64,
    #[serde(default)]
    pub uptime_seconds: f64,
    #[serde(default)]
    pub load_average: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub hostname: String,
    pub display_name: Option<String>,
    pub status: AgentStatus,
    pub roles: Vec<String>,
    pub tags: Vec<String>,
    pub capabilities: AgentCapabilities,
    pub telemetry: AgentTelemetry,
    pub last_seen: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub current_task_id: Option<String>,
}

impl Agent {
    pub fn is_online(&self) -> bool {
        self.status == AgentStatus::Online
    }

    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Online && self.current_task_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub telemetry: AgentTelemetry,
    #[serde(default)]
    pub current_task_id: Option<String>,
}

/// Abstraction over a live transport to an agent daemon. `waypoint-server`
/// implements this over an axum websocket; tests implement it over an
/// in-memory channel.
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn send(&self, message: serde_json::Value) -> Result<(), String>;
}

struct AgentConnection {
    session: Arc<dyn AgentSession>,
    connected_at: DateTime<Utc>,
    last_message: DateTime<Utc>,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Agent>>,
    connections: RwLock<HashMap<String, AgentConnection>>,
    offline_threshold: Duration,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            offline_threshold: Duration::seconds(DEFAULT_OFFLINE_THRESHOLD_SECS),
        }
    }

    pub fn with_offline_threshold(mut self, threshold: Duration) -> Self {
        self.offline_threshold = threshold;
        self
    }

    /// Register or refresh an agent, then (re)bind its session. Never
    /// errors on an id that already exists.
    pub async fn register(&self, registration: AgentRegistration, session: Arc<dyn AgentSession>) {
        let now = Utc::now();
        let id = registration.id.clone();

        {
            let mut agents = self.agents.write().await;
            match agents.get_mut(&id) {
                Some(existing) => {
                    existing.hostname = registration.hostname;
                    existing.display_name = registration.display_name;
                    existing.roles = registration.roles;
                    existing.tags = registration.tags;
                    existing.capabilities = registration.capabilities;
                    existing.status = AgentStatus::Online;
                    existing.last_seen = Some(now);
                    tracing::info!(agent_id = %id, "agent reconnected");
                }
                None => {
                    agents.insert(
                        id.clone(),
                        Agent {
                            id: id.clone(),
                            hostname: registration.hostname,
                            display_name: registration.display_name,
                            status: AgentStatus::Online,
                            roles: registration.roles,
                            tags: registration.tags,
                            capabilities: registration.capabilities,
                            telemetry: AgentTelemetry::default(),
                            last_seen: Some(now),
                            registered_at: now,
                            current_task_id: None,
                        },
                    );
                    tracing::info!(agent_id = %id, "agent registered");
                }
            }
        }

        self.connections.write().await.insert(
            id,
            AgentConnection {
                session,
                connected_at: now,
                last_message: now,
            },
        );
    }

    /// Idempotent: unregistering an unknown or already-offline agent is a
    /// no-op, not an error.
    pub async fn unregister(&self, agent_id: &str) {
        self.connections.write().await.remove(agent_id);
        if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
            agent.status = AgentStatus::Offline;
            tracing::info!(agent_id, "agent unregistered");
        }
    }

    pub async fn heartbeat(&self, heartbeat: AgentHeartbeat) {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(&heartbeat.agent_id) else {
            tracing::warn!(agent_id = %heartbeat.agent_id, "heartbeat from unknown agent");
            return;
        };
        agent.telemetry = heartbeat.telemetry;
        agent.current_task_id = heartbeat.current_task_id.clone();
        agent.last_seen = Some(heartbeat.timestamp);
        agent.status = if heartbeat.current_task_id.is_some() {
            AgentStatus::Busy
        } else {
            AgentStatus::Online
        };
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn get_all(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn get_online(&self) -> Vec<Agent> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.is_online())
            .cloned()
            .collect()
    }

    pub async fn get_available(&self) -> Vec<Agent> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.is_available())
            .cloned()
            .collect()
    }

    pub async fn get_by_role(&self, role: &str) -> Vec<Agent> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.roles.iter().any(|r| r == role))
            .cloned()
            .collect()
    }

    /// Send a message to one agent. On delivery failure the agent is
    /// unregistered: a dead session means the agent is gone, not merely
    /// busy.
    pub async fn send_to_agent(
        &self,
        agent_id: &str,
        message: serde_json::Value,
    ) -> Result<(), RegistryError> {
        let session = {
            let connections = self.connections.read().await;
            connections
                .get(agent_id)
                .map(|c| c.session.clone())
                .ok_or_else(|| RegistryError::NotConnected(agent_id.to_string()))?
        };

        match session.send(message).await {
            Ok(()) => {
                if let Some(conn) = self.connections.write().await.get_mut(agent_id) {
                    conn.last_message = Utc::now();
                }
                Ok(())
            }
            Err(reason) => {
                self.unregister(agent_id).await;
                Err(RegistryError::DeliveryFailed {
                    agent_id: agent_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Best-effort fan-out; a failing connection is logged and skipped,
    /// not unregistered (unlike `send_to_agent`, since one recipient's
    /// failure shouldn't cut off the rest of the broadcast).
    pub async fn broadcast(&self, message: serde_json::Value, filter_roles: Option<&[String]>) {
        let agents = self.agents.read().await;
        let targets: Vec<String> = agents
            .values()
            .filter(|a| match filter_roles {
                Some(roles) => a.roles.iter().any(|r| roles.contains(r)),
                None => true,
            })
            .map(|a| a.id.clone())
            .collect();
        drop(agents);

        let connections = self.connections.read().await;
        for agent_id in targets {
            if let Some(conn) = connections.get(&agent_id) {
                if let Err(reason) = conn.session.send(message.clone()).await {
                    tracing::warn!(agent_id, reason, "broadcast delivery failed");
                }
            }
        }
    }

    /// Mark an agent as errored, e.g. after a reconciliation pass finds its
    /// recent job error rate over threshold. No-op if the agent is unknown.
    pub async fn mark_error(&self, agent_id: &str, reason: &str) {
        if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
            agent.status = AgentStatus::Error;
            tracing::warn!(agent_id, reason, "agent marked errored");
        }
    }

    /// Mark agents whose last heartbeat is older than the offline
    /// threshold as offline and drop their connection.
    pub async fn check_health(&self) {
        let now = Utc::now();
        let mut timed_out = Vec::new();

        {
            let mut agents = self.agents.write().await;
            for agent in agents.values_mut() {
                if agent.status != AgentStatus::Online {
                    continue;
                }
                let Some(last_seen) = agent.last_seen else {
                    continue;
                };
                if now - last_seen > self.offline_threshold {
                    agent.status = AgentStatus::Offline;
                    timed_out.push(agent.id.clone());
                }
            }
        }

        if !timed_out.is_empty() {
            let mut connections = self.connections.write().await;
            for agent_id in &timed_out {
                connections.remove(agent_id);
                tracing::info!(agent_id, "agent timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSession {
        sent: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AgentSession for RecordingSession {
        async fn send(&self, _message: serde_json::Value) -> Result<(), String> {
            if self.fail {
                return Err("connection reset".to_string());
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registration(id: &str) -> AgentRegistration {
        AgentRegistration {
            id: id.to_string(),
            hostname: "host".into(),
            display_name: None,
            roles: vec!["worker".into()],
            tags: vec![],
            capabilities: AgentCapabilities::default(),
            secret: None,
        }
    }

    #[tokio::test]
    async fn register_twice_refreshes_instead_of_erroring() {
        let registry = AgentRegistry::new();
        let session = Arc::new(RecordingSession {
            sent: AtomicUsize::new(0),
            fail: false,
        });
        registry.register(registration("a1"), session.clone()).await;
        registry.register(registration("a1"), session).await;

        assert_eq!(registry.get_all().await.len(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = AgentRegistry::new();
        registry.unregister("unknown").await;
        registry.unregister("unknown").await;
    }

    #[tokio::test]
    async fn heartbeat_marks_busy_when_task_assigned() {
        let registry = AgentRegistry::new();
        let session = Arc::new(RecordingSession {
            sent: AtomicUsize::new(0),
            fail: false,
        });
        registry.register(registration("a1"), session).await;
        registry
            .heartbeat(AgentHeartbeat {
                agent_id: "a1".into(),
                timestamp: Utc::now(),
                telemetry: AgentTelemetry::default(),
                current_task_id: Some("task-1".into()),
            })
            .await;

        let agent = registry.get("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);
    }

    #[tokio::test]
    async fn send_failure_unregisters_the_agent() {
        let registry = AgentRegistry::new();
        let session = Arc::new(RecordingSession {
            sent: AtomicUsize::new(0),
            fail: true,
        });
        registry.register(registration("a1"), session).await;

        let result = registry.send_to_agent("a1", serde_json::json!({})).await;
        assert!(result.is_err());

        let agent = registry.get("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn check_health_times_out_stale_agents() {
        let registry = AgentRegistry::new().with_offline_threshold(Duration::seconds(0));
        let session = Arc::new(RecordingSession {
            sent: AtomicUsize::new(0),
            fail: false,
        });
        registry.register(registration("a1"), session).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.check_health().await;

        let agent = registry.get("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
    }
}

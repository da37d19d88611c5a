//! Reconciliation loop: compares desired vs actual worker pool capacity
//! and agent health, then applies scaling decisions and marks agents
//! unhealthy when their recent error rate crosses a threshold.
//!
//! Queue depth, job-error statistics and the actual infrastructure scaling
//! call are all behind traits so the loop itself stays testable without a
//! queue broker or cloud API on hand.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use waypoint_audit::{AuditLedger, LedgerActor, LedgerEvent};
use waypoint_policy::{Effect, LedgerLevel};
use waypoint_registry::AgentRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolState {
    pub id: String,
    pub name: String,
    pub pack_id: Option<String>,
    pub queue_name: String,
    pub min_workers: u32,
    pub max_workers: u32,
    pub target_latency_ms: u64,
    pub current_workers: u32,
    #[serde(default)]
    pub queue_depth: u64,
    #[serde(default)]
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub error_rate: f64,
}

impl WorkerPoolState {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        queue_name: impl Into<String>,
        min_workers: u32,
        max_workers: u32,
        target_latency_ms: u64,
        current_workers: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            pack_id: None,
            queue_name: queue_name.into(),
            min_workers,
            max_workers,
            target_latency_ms,
            current_workers,
            queue_depth: 0,
            avg_latency_ms: 0.0,
            error_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub error_rate: f64,
    pub job_count: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleDecision {
    pub pool_name: String,
    pub current: u32,
    pub target: u32,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub reconcile_interval_secs: u64,
    pub scale_step: u32,
    pub high_queue_threshold: u64,
    pub low_queue_threshold: u64,
    pub error_rate_threshold: f64,
    pub latency_threshold_multiplier: f64,
    pub min_jobs_for_health_check: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 10,
            scale_step: 1,
            high_queue_threshold: 100,
            low_queue_threshold: 5,
            error_rate_threshold: 0.1,
            latency_threshold_multiplier: 1.5,
            min_jobs_for_health_check: 5,
        }
    }
}

/// Queue depth for a named queue; `waypoint-server` backs this with
/// whatever broker holds task queues, tests use an in-memory map.
#[async_trait]
pub trait QueueDepthSource: Send + Sync {
    async fn depth(&self, queue_name: &str) -> u64;
}

/// Recent per-agent job statistics, used to flag agents for the error-rate
/// health check.
#[async_trait]
pub trait AgentHealthSource: Send + Sync {
    async fn recent_health(&self) -> Vec<AgentHealth>;
}

/// Applies scaling decisions to the underlying compute platform.
#[async_trait]
pub trait InfraProvider: Send + Sync {
    async fn get_worker_count(&self, pool_name: &str) -> Option<u32>;
    async fn set_worker_count(&self, pool_name: &str, count: u32) -> bool;
}

/// Default provider for environments with no configured platform: logs the
/// decision and reports success so pool state still advances in-memory.
pub struct LoggingProvider;

#[async_trait]
impl InfraProvider for LoggingProvider {
    async fn get_worker_count(&self, _pool_name: &str) -> Option<u32> {
        None
    }

    async fn set_worker_count(&self, pool_name: &str, count: u32) -> bool {
        tracing::info!(pool_name, count, "would scale pool (no infra provider configured)");
        true
    }
}

pub struct Reconciler {
    pools: RwLock<HashMap<String, WorkerPoolState>>,
    infra: Arc<dyn InfraProvider>,
    queue_source: Arc<dyn QueueDepthSource>,
    health_source: Arc<dyn AgentHealthSource>,
    registry: Option<Arc<AgentRegistry>>,
    audit: Option<Arc<AuditLedger>>,
    pub config: OperatorConfig,
}

impl Reconciler {
    pub fn new(
        infra: Arc<dyn InfraProvider>,
        queue_source: Arc<dyn QueueDepthSource>,
        health_source: Arc<dyn AgentHealthSource>,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            infra,
            queue_source,
            health_source,
            registry: None,
            audit: None,
            config: OperatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLedger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn upsert_pool(&self, pool: WorkerPoolState) {
        self.pools.write().await.insert(pool.name.clone(), pool);
    }

    pub async fn pools(&self) -> Vec<WorkerPoolState> {
        self.pools.read().await.values().cloned().collect()
    }

    /// One reconciliation pass: refresh queue depths, decide and apply
    /// scaling, then check agent health. Errors from any one pool or
    /// agent are logged and do not abort the rest of the pass.
    pub async fn reconcile(&self) -> Vec<ScaleDecision> {
        tracing::debug!("starting reconciliation cycle");

        let pool_names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        for name in &pool_names {
            let queue_name = self.pools.read().await.get(name).map(|p| p.queue_name.clone());
            let Some(queue_name) = queue_name else { continue };
            let depth = self.queue_source.depth(&queue_name).await;
            if let Some(pool) = self.pools.write().await.get_mut(name) {
                pool.queue_depth = depth;
            }
        }

        let mut decisions = Vec::new();
        let pools = self.pools.read().await.values().cloned().collect::<Vec<_>>();
        for pool in &pools {
            if let Some(decision) = self.evaluate_scaling(pool) {
                decisions.push(decision);
            }
        }

        for decision in &decisions {
            tracing::info!(
                pool = %decision.pool_name,
                from = decision.current,
                to = decision.target,
                reason = %decision.reason,
                "scaling worker pool"
            );
            let applied = self.infra.set_worker_count(&decision.pool_name, decision.target).await;
            if applied {
                if let Some(pool) = self.pools.write().await.get_mut(&decision.pool_name) {
                    pool.current_workers = decision.target;
                }
            }
        }

        self.check_agent_health().await;

        tracing::debug!("reconciliation cycle complete");
        decisions
    }

    fn evaluate_scaling(&self, pool: &WorkerPoolState) -> Option<ScaleDecision> {
        let current = pool.current_workers;
        let (target, reason) = if pool.queue_depth > self.config.high_queue_threshold {
            (
                (current + self.config.scale_step).min(pool.max_workers),
                format!("high queue depth ({})", pool.queue_depth),
            )
        } else if pool.avg_latency_ms > pool.target_latency_ms as f64 * self.config.latency_threshold_multiplier {
            (
                (current + self.config.scale_step).min(pool.max_workers),
                format!("high latency ({}ms > {}ms)", pool.avg_latency_ms, pool.target_latency_ms),
            )
        } else if pool.queue_depth < self.config.low_queue_threshold && current > pool.min_workers {
            (
                current.saturating_sub(self.config.scale_step).max(pool.min_workers),
                format!("low queue depth ({})", pool.queue_depth),
            )
        } else {
            (current, String::new())
        };

        if target == current {
            return None;
        }
        Some(ScaleDecision {
            pool_name: pool.name.clone(),
            current,
            target,
            reason,
        })
    }

    async fn check_agent_health(&self) {
        let unhealthy: Vec<AgentHealth> = self
            .health_source
            .recent_health()
            .await
            .into_iter()
            .filter(|h| {
                h.job_count >= self.config.min_jobs_for_health_check
                    && h.error_rate > self.config.error_rate_threshold
            })
            .collect();

        for agent in &unhealthy {
            let reason = format!("high error rate: {:.1}% over {} jobs", agent.error_rate * 100.0, agent.job_count);
            tracing::warn!(agent_id = %agent.id, name = %agent.name, "{reason}");

            if let Some(registry) = &self.registry {
                registry.mark_error(&agent.id, &reason).await;
            }

            if let Some(audit) = &self.audit {
                let event = LedgerEvent::new(
                    agent.id.clone(),
                    "reconciler",
                    LedgerActor {
                        agent_id: Some(agent.id.clone()),
                        ..Default::default()
                    },
                    "agent.marked_unhealthy",
                    format!("agent/{}", agent.id),
                    Effect::Deny,
                    LedgerLevel::Action,
                )
                .with_reason(reason)
                .with_metadata(serde_json::json!({
                    "error_rate": agent.error_rate,
                    "job_count": agent.job_count,
                }));
                if let Err(err) = audit.record(event).await {
                    tracing::error!(error = %err, "failed to record unhealthy-agent ledger event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedQueue(u64);

    #[async_trait]
    impl QueueDepthSource for FixedQueue {
        async fn depth(&self, _queue_name: &str) -> u64 {
            self.0
        }
    }

    struct NoUnhealthyAgents;

    #[async_trait]
    impl AgentHealthSource for NoUnhealthyAgents {
        async fn recent_health(&self) -> Vec<AgentHealth> {
            Vec::new()
        }
    }

    struct OneUnhealthyAgent;

    #[async_trait]
    impl AgentHealthSource for OneUnhealthyAgent {
        async fn recent_health(&self) -> Vec<AgentHealth> {
            vec![AgentHealth {
                id: "agent-1".into(),
                org_id: "org-1".into(),
                name: "worker-1".into(),
                error_rate: 0.5,
                job_count: 10,
                avg_latency_ms: 200.0,
            }]
        }
    }

    struct RecordingInfra {
        applied: AtomicU64,
    }

    #[async_trait]
    impl InfraProvider for RecordingInfra {
        async fn get_worker_count(&self, _pool_name: &str) -> Option<u32> {
            None
        }

        async fn set_worker_count(&self, _pool_name: &str, _count: u32) -> bool {
            self.applied.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn pool(current: u32) -> WorkerPoolState {
        WorkerPoolState::new("pool-1", "default", "queue:default", 1, 10, 500, current)
    }

    #[tokio::test]
    async fn scales_up_on_high_queue_depth() {
        let reconciler = Reconciler::new(
            Arc::new(LoggingProvider),
            Arc::new(FixedQueue(150)),
            Arc::new(NoUnhealthyAgents),
        );
        reconciler.upsert_pool(pool(2)).await;

        let decisions = reconciler.reconcile().await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].target, 3);
    }

    #[tokio::test]
    async fn scales_down_on_low_queue_depth_above_minimum() {
        let reconciler = Reconciler::new(
            Arc::new(LoggingProvider),
            Arc::new(FixedQueue(1)),
            Arc::new(NoUnhealthyAgents),
        );
        reconciler.upsert_pool(pool(5)).await;

        let decisions = reconciler.reconcile().await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].target, 4);
    }

    #[tokio::test]
    async fn does_not_scale_below_minimum_workers() {
        let reconciler = Reconciler::new(
            Arc::new(LoggingProvider),
            Arc::new(FixedQueue(0)),
            Arc::new(NoUnhealthyAgents),
        );
        reconciler.upsert_pool(pool(1)).await;

        let decisions = reconciler.reconcile().await;
        assert!(decisions.is_empty());
    }

    #[tokio::test]
    async fn applying_a_scale_decision_updates_tracked_pool_state() {
        let infra = Arc::new(RecordingInfra { applied: AtomicU64::new(0) });
        let reconciler = Reconciler::new(infra.clone(), Arc::new(FixedQueue(200)), Arc::new(NoUnhealthyAgents));
        reconciler.upsert_pool(pool(2)).await;

        reconciler.reconcile().await;
        assert_eq!(infra.applied.load(Ordering::SeqCst), 1);
        assert_eq!(reconciler.pools().await[0].current_workers, 3);
    }

    struct NullSession;

    #[async_trait]
    impl waypoint_registry::AgentSession for NullSession {
        async fn send(&self, _message: serde_json::Value) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn marks_unhealthy_agents_in_the_registry() {
        let registry = Arc::new(AgentRegistry::new());
        registry
            .register(
                waypoint_registry::AgentRegistration {
                    id: "agent-1".into(),
                    hostname: "host".into(),
                    display_name: None,
                    roles: vec![],
                    tags: vec![],
                    capabilities: Default::default(),
                    secret: None,
                },
                Arc::new(NullSession),
            )
            .await;

        let reconciler = Reconciler::new(Arc::new(LoggingProvider), Arc::new(FixedQueue(0)), Arc::new(OneUnhealthyAgent))
            .with_registry(registry.clone());

        reconciler.check_agent_health().await;
        let agent = registry.get("agent-1").await.unwrap();
        assert_eq!(agent.status, waypoint_registry::AgentStatus::Error);
    }

    #[tokio::test]
    async fn records_unhealthy_agent_to_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLedger::new(dir.path()));
        let reconciler = Reconciler::new(Arc::new(LoggingProvider), Arc::new(FixedQueue(0)), Arc::new(OneUnhealthyAgent))
            .with_audit(audit.clone());

        reconciler.check_agent_health().await;
        assert_eq!(audit.count().await, 1);
    }
}

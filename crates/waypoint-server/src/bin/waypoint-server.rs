//! Binary entry point: wires every control-plane crate together, starts
//! the reconciliation and dispatch background loops, and serves the
//! HTTP/WebSocket router.

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use waypoint_audit::AuditLedger;
use waypoint_collab::{SessionGossipSink, SessionManager};
use waypoint_gossip::{GossipHub, GossipProtocol};
use waypoint_policy::PolicyEngine;
use waypoint_reconciler::{AgentHealth, AgentHealthSource, LoggingProvider, OperatorConfig, QueueDepthSource, Reconciler};
use waypoint_registry::AgentRegistry;
use waypoint_safety::SafetyValidator;
use waypoint_scheduler::{AgentAvailability, Scheduler};
use waypoint_server::{build_router, AppState, ServerConfig};

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if env_or("RUST_ENV", "production") == "development" {
        builder.init();
    } else {
        builder.json().init();
    }
}

/// No queue broker is wired up yet; every pool reports an empty queue so
/// the reconciler never scales up on depth alone.
struct NoQueueSource;

#[async_trait]
impl QueueDepthSource for NoQueueSource {
    async fn depth(&self, _queue_name: &str) -> u64 {
        0
    }
}

/// No job-statistics store is wired up yet; no agent is ever flagged
/// unhealthy by this source alone.
struct NoAgentHealthSource;

#[async_trait]
impl AgentHealthSource for NoAgentHealthSource {
    async fn recent_health(&self) -> Vec<AgentHealth> {
        Vec::new()
    }
}

struct RegistryAvailability {
    registry: Arc<AgentRegistry>,
}

#[async_trait]
impl AgentAvailability for RegistryAvailability {
    async fn is_available(&self, agent_id: &str) -> bool {
        self.registry.get(agent_id).await.map(|a| a.is_available()).unwrap_or(false)
    }

    async fn find_available(&self, role: Option<&str>) -> Option<String> {
        match role {
            Some(role) => self
                .registry
                .get_by_role(role)
                .await
                .into_iter()
                .find(|a| a.is_available())
                .map(|a| a.id),
            None => self.registry.get_available().await.into_iter().next().map(|a| a.id),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let policy_config_dir = env_or("POLICY_CONFIG_DIR", "./config/policy");
    let audit_log_dir = env_or("AUDIT_LOG_DIR", "./data/audit");
    let port: u16 = env_or("PORT", "8080").parse().unwrap_or(8080);
    let reconcile_interval_secs: u64 = env_or("RECONCILE_INTERVAL_SECS", "10").parse().unwrap_or(10);
    let dispatch_interval_ms: u64 = env_or("DISPATCH_INTERVAL_MS", "250").parse().unwrap_or(250);
    let gossip_interval_ms: u64 = env_or("GOSSIP_INTERVAL_MS", "100").parse().unwrap_or(100);

    let registry = Arc::new(AgentRegistry::new());
    let safety = Arc::new(SafetyValidator::default());
    let scheduler = Arc::new(Scheduler::new(safety));
    let policy = PolicyEngine::new(policy_config_dir);
    if let Err(err) = policy.load().await {
        tracing::error!(error = %err, "failed to load policy packs; continuing with an empty policy set");
    }
    let audit = Arc::new(AuditLedger::new(audit_log_dir));
    let sessions = Arc::new(SessionManager::new());

    let config = ServerConfig {
        catalog_version: env_or("CATALOG_VERSION", "unset"),
        agent_shared_secret: env::var("AGENT_SHARED_SECRET").ok(),
        http_auth_token: env::var("HTTP_AUTH_TOKEN").ok(),
        rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", "600").parse().unwrap_or(600),
    };

    let state = AppState::new(
        registry.clone(),
        scheduler.clone(),
        policy.clone(),
        audit.clone(),
        sessions,
        config,
    );

    let reconciler = Arc::new(
        Reconciler::new(Arc::new(LoggingProvider), Arc::new(NoQueueSource), Arc::new(NoAgentHealthSource))
            .with_config(OperatorConfig {
                reconcile_interval_secs,
                ..OperatorConfig::default()
            })
            .with_registry(registry.clone())
            .with_audit(audit.clone()),
    );

    let gossip_sink = Arc::new(SessionGossipSink::new(sessions.clone()));
    let gossip_hub = Arc::new(GossipHub::new(gossip_sink));
    for (shard_id, peers) in sessions.shard_topology().await {
        let protocol = Arc::new(GossipProtocol::new(shard_id.clone()));
        for peer in &peers {
            protocol.add_peer(peer).await;
        }
        gossip_hub.register_shard(&shard_id, protocol.clone()).await;
        sessions.register_shard_gossip(&shard_id, protocol).await;
    }

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    tokio::spawn({
        let reconciler = reconciler.clone();
        let interval = std::time::Duration::from_secs(reconcile_interval_secs.max(1));
        let mut stop = stop_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => reconciler.reconcile().await,
                    _ = stop.changed() => break,
                }
            }
        }
    });

    tokio::spawn({
        let scheduler = scheduler.clone();
        let availability = RegistryAvailability { registry: registry.clone() };
        let interval = std::time::Duration::from_millis(dispatch_interval_ms);
        let mut stop = stop_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { scheduler.dispatch_next(&availability).await; }
                    _ = stop.changed() => break,
                }
            }
        }
    });

    tokio::spawn({
        let registry = registry.clone();
        let mut stop = stop_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.check_health().await,
                    _ = stop.changed() => break,
                }
            }
        }
    });

    tokio::spawn({
        let gossip_hub = gossip_hub.clone();
        let interval = std::time::Duration::from_millis(gossip_interval_ms.max(1));
        let mut stop = stop_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => gossip_hub.run_round().await,
                    _ = stop.changed() => break,
                }
            }
        }
    });

    let router = build_router(state);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "waypoint-server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, stopping background loops");
            let _ = stop_tx.send(true);
        })
        .await?;

    Ok(())
}

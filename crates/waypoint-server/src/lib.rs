//! HTTP and WebSocket surface for the control plane, wiring together the
//! registry, scheduler, policy engine, audit ledger and collaboration
//! session manager behind one `axum::Router`.
//!
//! Agents speak a small JSON framing protocol over `/ws/agent`: the first
//! frame must be a `register`, after which `heartbeat`/`task_output`/
//! `command_result`/`task_complete`/`pong` flow one way and
//! `execute_task`/`ping` flow the other. UI observers connect to
//! `/ws/client` and receive every task transition as it happens.

pub mod agent_ws;
pub mod error;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower::{buffer::BufferLayer, limit::RateLimitLayer, ServiceBuilder};
use tower_http::trace::TraceLayer;
use waypoint_audit::AuditLedger;
use waypoint_collab::SessionManager;
use waypoint_policy::PolicyEngine;
use waypoint_registry::AgentRegistry;
use waypoint_scheduler::Scheduler;

pub const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub catalog_version: String,
    /// Pre-shared secret agents must present in their `register` frame.
    /// `None` disables agent-side auth (development only).
    pub agent_shared_secret: Option<String>,
    /// Bearer/ApiKey token required on the HTTP surface, save for `/health`.
    pub http_auth_token: Option<String>,
    pub rate_limit_per_minute: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            catalog_version: "unset".to_string(),
            agent_shared_secret: None,
            http_auth_token: None,
            rate_limit_per_minute: 600,
        }
    }
}

pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub policy: Arc<PolicyEngine>,
    pub audit: Arc<AuditLedger>,
    pub sessions: Arc<SessionManager>,
    pub config: ServerConfig,
    pub task_events: tokio::sync::broadcast::Sender<serde_json::Value>,
}

impl AppState {
    pub fn new(
        registry: Arc<AgentRegistry>,
        scheduler: Arc<Scheduler>,
        policy: Arc<PolicyEngine>,
        audit: Arc<AuditLedger>,
        sessions: Arc<SessionManager>,
        config: ServerConfig,
    ) -> Arc<Self> {
        let (task_events, _) = tokio::sync::broadcast::channel(1024);
        Arc::new(Self {
            registry,
            scheduler,
            policy,
            audit,
            sessions,
            config,
            task_events,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let rate_limit = ServiceBuilder::new()
        .layer(axum::error_handling::HandleErrorLayer::new(|err: tower::BoxError| async move {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("unhandled internal error: {err}"),
            )
        }))
        .layer(BufferLayer::new(1024))
        .layer(RateLimitLayer::new(
            state.config.rate_limit_per_minute,
            std::time::Duration::from_secs(60),
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/version", get(handlers::version))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/{id}", get(handlers::get_agent).delete(handlers::remove_agent))
        .route("/agents/{id}/ping", post(handlers::ping_agent))
        .route("/tasks", get(handlers::list_tasks).post(handlers::create_task))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/approve", post(handlers::approve_task))
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        .route("/tasks/{id}/retry", post(handlers::retry_task))
        .route("/policy/evaluate", post(handlers::evaluate_policy))
        .route("/ledger/event", post(handlers::append_ledger_event))
        .route("/ledger/events", get(handlers::query_ledger))
        .route("/ws/agent", get(agent_ws::upgrade_agent))
        .route("/ws/client", get(agent_ws::upgrade_client))
        .layer(TraceLayer::new_for_http())
        .layer(rate_limit)
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::auth))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::version_headers))
        .with_state(state)
}

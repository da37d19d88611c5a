//! Route handlers. Each one is a thin translation between the HTTP body
//! and the underlying crate's own request/response types — no business
//! logic lives here.

use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use waypoint_audit::{LedgerActor, LedgerEvent, LedgerQuery};
use waypoint_policy::{Effect, LedgerLevel, PolicyRequest, PolicySubject, RequestContext};
use waypoint_registry::{Agent, AgentHeartbeat};
use waypoint_scheduler::{Task, TaskPlan, TaskRequest};

use crate::error::ApiError;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

#[derive(Serialize)]
pub struct VersionResponse {
    operator_version: &'static str,
    catalog_version: String,
}

pub async fn version(State(state): State<Arc<AppState>>) -> Json<VersionResponse> {
    Json(VersionResponse {
        operator_version: crate::OPERATOR_VERSION,
        catalog_version: state.config.catalog_version.clone(),
    })
}

pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<Agent>> {
    Json(state.registry.get_all().await)
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("agent {id}")))
}

pub async fn remove_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> StatusCode {
    state.registry.unregister(&id).await;
    StatusCode::NO_CONTENT
}

pub async fn ping_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.registry.send_to_agent(&id, serde_json::json!({"type": "ping"})).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub struct TaskFilter {
    status: Option<String>,
}

pub async fn list_tasks(State(state): State<Arc<AppState>>, Query(filter): Query<TaskFilter>) -> Json<Vec<Task>> {
    let mut tasks = state.scheduler.get_all_tasks().await;
    if let Some(status) = filter.status {
        tasks.retain(|t| {
            serde_json::to_value(t.status).ok().and_then(|v| v.as_str().map(str::to_string)) == Some(status.clone())
        });
    }
    Json(tasks)
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub request: String,
    #[serde(default)]
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub target_role: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub skip_approval: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// A pre-built plan, when the caller already ran an external planner.
    /// Without it the task sits in `pending` until a plan is attached.
    #[serde(default)]
    pub plan: Option<TaskPlan>,
}

fn default_priority() -> i32 {
    5
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .scheduler
        .create_task(TaskRequest {
            request: body.request,
            target_agent_id: body.target_agent_id,
            target_role: body.target_role,
            workspace: body.workspace,
            skip_approval: body.skip_approval,
            priority: body.priority,
        })
        .await;
    broadcast_task(&state, &task);

    let task = match body.plan {
        Some(plan) => {
            let updated = state.scheduler.set_plan(&task.id, plan).await?;
            broadcast_task(&state, &updated);
            updated
        }
        None => task,
    };

    Ok(Json(task))
}

pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    state
        .scheduler
        .get_task(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task {id}")))
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn approve_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ApproveRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state.scheduler.approve_task(&id, body.approved, body.reason).await?;
    broadcast_task(&state, &task);
    Ok(Json(task))
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state.scheduler.cancel_task(&id, body.reason).await?;
    broadcast_task(&state, &task);
    Ok(Json(task))
}

pub async fn retry_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    let task = state.scheduler.retry_task(&id).await?;
    broadcast_task(&state, &task);
    Ok(Json(task))
}

fn broadcast_task(state: &AppState, task: &Task) {
    let _ = state.task_events.send(serde_json::json!({"type": "task", "task": task}));
}

#[derive(Deserialize)]
pub struct PolicyEvaluateBody {
    pub action: String,
    pub resource: String,
    pub host: String,
    #[serde(default)]
    pub subject: PolicySubject,
    #[serde(default)]
    pub claims: Vec<String>,
    #[serde(default)]
    pub asserted_facts: Vec<String>,
}

pub async fn evaluate_policy(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PolicyEvaluateBody>,
) -> Json<waypoint_policy::PolicyDecision> {
    let request = PolicyRequest {
        action: body.action,
        resource: body.resource,
        host: body.host,
        subject: body.subject,
        context: RequestContext {
            claims: body.claims.into_iter().map(|claim_type| waypoint_policy::Claim { claim_type }).collect(),
            asserted_facts: body.asserted_facts,
        },
    };
    Json(state.policy.evaluate(&request).await)
}

#[derive(Deserialize)]
pub struct AppendLedgerEventBody {
    pub correlation_id: String,
    pub layer: String,
    #[serde(default)]
    pub actor: LedgerActor,
    pub action: String,
    pub resource: String,
    pub decision: Effect,
    #[serde(default)]
    pub ledger_level: LedgerLevel,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub async fn append_ledger_event(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AppendLedgerEventBody>,
) -> Result<Json<LedgerEvent>, ApiError> {
    let mut event = LedgerEvent::new(
        body.correlation_id,
        body.layer,
        body.actor,
        body.action,
        body.resource,
        body.decision,
        body.ledger_level,
    )
    .with_metadata(body.metadata);
    if let Some(reason) = body.reason {
        event = event.with_reason(reason);
    }
    let recorded = state.audit.record(event).await?;
    Ok(Json(recorded))
}

#[derive(Deserialize, Default)]
pub struct LedgerQueryParams {
    pub correlation_id: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub decision: Option<Effect>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn query_ledger(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LedgerQueryParams>,
) -> Json<Vec<LedgerEvent>> {
    let query = LedgerQuery {
        correlation_id: params.correlation_id,
        action: params.action,
        resource: params.resource,
        decision: params.decision,
        start: None,
        end: None,
        limit: params.limit,
        offset: params.offset,
    };
    Json(state.audit.query(&query).await)
}

// Used by the agent websocket handler to translate a heartbeat frame.
pub fn parse_heartbeat(value: serde_json::Value) -> Result<AgentHeartbeat, serde_json::Error> {
    serde_json::from_value(value)
}

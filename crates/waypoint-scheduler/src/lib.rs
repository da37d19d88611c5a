//! Task lifecycle and dispatch.
//!
//! A task moves PENDING -> PLANNING -> (AWAITING_APPROVAL | QUEUED) ->
//! RUNNING -> (COMPLETED | FAILED), with CANCELLED reachable from any
//! non-terminal state. The queue holds QUEUED tasks ordered by priority
//! (descending) and, within a priority, by arrival order. Agent lookup is
//! injected through `AgentAvailability` so this crate never depends on the
//! registry directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use waypoint_safety::{RiskLevel, SafetyValidator};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {0} is not awaiting approval")]
    NotAwaitingApproval(String),
    #[error("task {0} has already reached a terminal state")]
    AlreadyTerminal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    AwaitingApproval,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    Specific,
    Any,
    All,
    Role,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    #[serde(default = "default_dir")]
    pub dir: String,
    pub run: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub approval_required: bool,
}

fn default_dir() -> String {
    "~".to_string()
}
fn default_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub target_agent: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default = "default_workspace_type")]
    pub workspace_type: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub estimated_duration_seconds: Option<u64>,
    #[serde(default = "default_risk_level")]
    pub risk_level: RiskLevel,
    #[serde(default = "default_true")]
    pub requires_approval: bool,
}

fn default_workspace_type() -> String {
    "bare".to_string()
}
fn default_risk_level() -> RiskLevel {
    RiskLevel::Low
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub request: String,
    pub target_mode: TargetMode,
    pub target_agent_id: Option<String>,
    pub target_role: Option<String>,
    pub plan: Option<TaskPlan>,
    pub assigned_agent_id: Option<String>,
    pub workspace_id: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub planned_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub requires_approval: bool,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub request: String,
    pub target_agent_id: Option<String>,
    pub target_role: Option<String>,
    pub workspace: Option<String>,
    pub skip_approval: bool,
    pub priority: i32,
}

impl Default for TaskRequest {
    fn default() -> Self {
        Self {
            request: String::new(),
            target_agent_id: None,
            target_role: None,
            workspace: None,
            skip_approval: false,
            priority: 5,
        }
    }
}

/// Injected agent lookup so the scheduler never depends on the registry
/// crate directly.
#[async_trait]
pub trait AgentAvailability: Send + Sync {
    async fn is_available(&self, agent_id: &str) -> bool;
    /// First available agent, optionally filtered by role.
    async fn find_available(&self, role: Option<&str>) -> Option<String>;
}

#[async_trait]
pub trait TaskListener: Send + Sync {
    async fn on_transition(&self, task: &Task);
}

pub struct Scheduler {
    tasks: RwLock<HashMap<String, Task>>,
    queue: RwLock<VecDeque<String>>,
    running: RwLock<HashMap<String, String>>,
    listeners: RwLock<Vec<Arc<dyn TaskListener>>>,
    safety: Arc<SafetyValidator>,
}

impl Scheduler {
    pub fn new(safety: Arc<SafetyValidator>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            queue: RwLock::new(VecDeque::new()),
            running: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            safety,
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        self.listeners.write().await.push(listener);
    }

    async fn notify(&self, task: &Task) {
        for listener in self.listeners.read().await.iter() {
            listener.on_transition(task).await;
        }
    }

    fn new_task_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
    }

    pub async fn create_task(&self, request: TaskRequest) -> Task {
        let now = Utc::now();
        let target_mode = if request.target_role.is_some() {
            TargetMode::Role
        } else if request.target_agent_id.is_some() {
            TargetMode::Specific
        } else {
            TargetMode::Any
        };

        let task = Task {
            id: Self::new_task_id(),
            status: TaskStatus::Pending,
            request: request.request,
            target_mode,
            target_agent_id: request.target_agent_id,
            target_role: request.target_role,
            plan: None,
            assigned_agent_id: None,
            workspace_id: request.workspace,
            exit_code: None,
            output: None,
            error: None,
            created_at: now,
            planned_at: None,
            approved_at: None,
            started_at: None,
            completed_at: None,
            created_by: "user".to_string(),
            requires_approval: !request.skip_approval,
            priority: request.priority,
        };

        self.tasks.write().await.insert(task.id.clone(), task.clone());
        self.notify(&task).await;
        task
    }

    /// Attach a validated plan. Blocked commands fail the task outright;
    /// otherwise the task either waits for approval or is enqueued.
    pub async fn set_plan(&self, task_id: &str, plan: TaskPlan) -> Result<Task, SchedulerError> {
        let commands: Vec<String> = plan.commands.iter().map(|c| c.run.clone()).collect();
        let (all_valid, results) = self.safety.validate_commands(&commands);

        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id).ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        task.planned_at = Some(Utc::now());

        if !all_valid {
            let reasons: Vec<String> = results
                .iter()
                .filter(|r| r.blocked)
                .filter_map(|r| r.reason.clone())
                .collect();
            task.status = TaskStatus::Failed;
            task.error = Some(format!("plan blocked: {}", reasons.join("; ")));
            task.completed_at = Some(Utc::now());
            let snapshot = task.clone();
            drop(tasks);
            self.notify(&snapshot).await;
            return Ok(snapshot);
        }

        let needs_approval = task.requires_approval || self.safety.should_require_approval(&commands);
        task.requires_approval = needs_approval;
        task.plan = Some(plan);

        let snapshot = if needs_approval {
            task.status = TaskStatus::AwaitingApproval;
            task.clone()
        } else {
            task.status = TaskStatus::Queued;
            let snapshot = task.clone();
            drop(tasks);
            self.enqueue(&snapshot).await;
            snapshot
        };

        self.notify(&snapshot).await;
        Ok(snapshot)
    }

    async fn enqueue(&self, task: &Task) {
        let mut queue = self.queue.write().await;
        let tasks = self.tasks.read().await;

        let insert_at = queue
            .iter()
            .position(|id| {
                tasks
                    .get(id)
                    .map(|t| t.priority < task.priority)
                    .unwrap_or(false)
            })
            .unwrap_or(queue.len());
        queue.insert(insert_at, task.id.clone());
    }

    pub async fn approve_task(
        &self,
        task_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> Result<Task, SchedulerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id).ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        if task.status != TaskStatus::AwaitingApproval {
            return Err(SchedulerError::NotAwaitingApproval(task_id.to_string()));
        }

        let snapshot = if approved {
            task.status = TaskStatus::Queued;
            task.approved_at = Some(Utc::now());
            let snapshot = task.clone();
            drop(tasks);
            self.enqueue(&snapshot).await;
            snapshot
        } else {
            task.status = TaskStatus::Cancelled;
            task.error = reason;
            task.completed_at = Some(Utc::now());
            task.clone()
        };

        self.notify(&snapshot).await;
        Ok(snapshot)
    }

    /// Scan the queue head-to-tail for the first task with an eligible
    /// available agent; earlier tasks with no eligible agent are skipped
    /// rather than blocking the whole queue.
    pub async fn dispatch_next(&self, agents: &dyn AgentAvailability) -> Option<Task> {
        let candidate_ids: Vec<String> = self.queue.read().await.iter().cloned().collect();

        for task_id in candidate_ids {
            let target = {
                let tasks = self.tasks.read().await;
                let Some(task) = tasks.get(&task_id) else { continue };
                let Some(plan) = &task.plan else { continue };
                (
                    plan.target_agent.clone().or_else(|| task.target_agent_id.clone()),
                    task.target_role.clone(),
                )
            };

            let agent_id = match target {
                (Some(specific), _) => {
                    if agents.is_available(&specific).await {
                        Some(specific)
                    } else {
                        None
                    }
                }
                (None, role) => agents.find_available(role.as_deref()).await,
            };

            if let Some(agent_id) = agent_id {
                return self.dispatch(&task_id, &agent_id).await;
            }
        }
        None
    }

    async fn dispatch(&self, task_id: &str, agent_id: &str) -> Option<Task> {
        self.queue.write().await.retain(|id| id != task_id);

        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id)?;
        task.status = TaskStatus::Running;
        task.assigned_agent_id = Some(agent_id.to_string());
        task.started_at = Some(Utc::now());
        let snapshot = task.clone();
        drop(tasks);

        self.running.write().await.insert(agent_id.to_string(), task_id.to_string());
        self.notify(&snapshot).await;
        Some(snapshot)
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        success: bool,
        exit_code: Option<i32>,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<Task, SchedulerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id).ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        task.status = if success { TaskStatus::Completed } else { TaskStatus::Failed };
        task.exit_code = exit_code;
        task.output = output;
        task.error = error;
        task.completed_at = Some(Utc::now());
        let snapshot = task.clone();
        let agent_id = snapshot.assigned_agent_id.clone();
        drop(tasks);

        if let Some(agent_id) = agent_id {
            self.running.write().await.remove(&agent_id);
        }

        self.notify(&snapshot).await;
        Ok(snapshot)
    }

    pub async fn cancel_task(&self, task_id: &str, reason: Option<String>) -> Result<Task, SchedulerError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id).ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        if task.status.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(task_id.to_string()));
        }

        task.status = TaskStatus::Cancelled;
        task.error = reason;
        task.completed_at = Some(Utc::now());
        let snapshot = task.clone();
        let agent_id = snapshot.assigned_agent_id.clone();
        drop(tasks);

        self.queue.write().await.retain(|id| id != task_id);
        if let Some(agent_id) = agent_id {
            self.running.write().await.remove(&agent_id);
        }

        self.notify(&snapshot).await;
        Ok(snapshot)
    }

    /// Create a fresh task carrying the same request as a failed or
    /// cancelled one.
    pub async fn retry_task(&self, task_id: &str) -> Result<Task, SchedulerError> {
        let original = self
            .tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        if !matches!(original.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(SchedulerError::AlreadyTerminal(task_id.to_string()));
        }

        Ok(self
            .create_task(TaskRequest {
                request: original.request,
                target_agent_id: original.target_agent_id,
                target_role: original.target_role,
                workspace: original.workspace_id,
                skip_approval: !original.requires_approval,
                priority: original.priority,
            })
            .await)
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn get_all_tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    pub async fn get_queued_tasks(&self) -> Vec<Task> {
        let queue = self.queue.read().await;
        let tasks = self.tasks.read().await;
        queue.iter().filter_map(|id| tasks.get(id).cloned()).collect()
    }

    pub async fn get_running_tasks(&self) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect()
    }

    pub async fn get_agent_task(&self, agent_id: &str) -> Option<Task> {
        let task_id = self.running.read().await.get(agent_id).cloned()?;
        self.get_task(&task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysAvailable;

    #[async_trait]
    impl AgentAvailability for AlwaysAvailable {
        async fn is_available(&self, agent_id: &str) -> bool {
            agent_id != "ghost"
        }
        async fn find_available(&self, _role: Option<&str>) -> Option<String> {
            Some("agent-1".to_string())
        }
    }

    struct NoneAvailable;

    #[async_trait]
    impl AgentAvailability for NoneAvailable {
        async fn is_available(&self, _agent_id: &str) -> bool {
            false
        }
        async fn find_available(&self, _role: Option<&str>) -> Option<String> {
            None
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(SafetyValidator::default()))
    }

    fn plan_with(commands: Vec<&str>) -> TaskPlan {
        TaskPlan {
            target_agent: None,
            workspace: None,
            workspace_type: "bare".into(),
            steps: vec![],
            commands: commands
                .into_iter()
                .map(|c| Command { run: c.to_string(), ..Default::default() })
                .collect(),
            reasoning: None,
            estimated_duration_seconds: None,
            risk_level: RiskLevel::Low,
            requires_approval: false,
        }
    }

    #[tokio::test]
    async fn blocked_plan_fails_the_task() {
        let s = scheduler();
        let task = s.create_task(TaskRequest { skip_approval: true, ..Default::default() }).await;
        let result = s.set_plan(&task.id, plan_with(vec!["sudo rm -rf /"])).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn safe_plan_with_skip_approval_goes_straight_to_queue() {
        let s = scheduler();
        let task = s.create_task(TaskRequest { skip_approval: true, ..Default::default() }).await;
        let result = s.set_plan(&task.id, plan_with(vec!["git status"])).await.unwrap();
        assert_eq!(result.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn priority_ties_preserve_fifo_order() {
        let s = scheduler();
        let a = s.create_task(TaskRequest { skip_approval: true, priority: 5, ..Default::default() }).await;
        let b = s.create_task(TaskRequest { skip_approval: true, priority: 5, ..Default::default() }).await;
        s.set_plan(&a.id, plan_with(vec!["git status"])).await.unwrap();
        s.set_plan(&b.id, plan_with(vec!["git status"])).await.unwrap();

        let queued = s.get_queued_tasks().await;
        assert_eq!(queued[0].id, a.id);
        assert_eq!(queued[1].id, b.id);
    }

    #[tokio::test]
    async fn dispatch_skips_tasks_with_no_eligible_agent() {
        let s = scheduler();
        let low = s.create_task(TaskRequest { skip_approval: true, priority: 9, target_agent_id: Some("ghost".into()), ..Default::default() }).await;
        let high = s.create_task(TaskRequest { skip_approval: true, priority: 1, ..Default::default() }).await;
        s.set_plan(&low.id, plan_with(vec!["git status"])).await.unwrap();
        s.set_plan(&high.id, plan_with(vec!["git status"])).await.unwrap();

        let dispatched = s.dispatch_next(&AlwaysAvailable).await.unwrap();
        assert_eq!(dispatched.id, high.id);
    }

    #[tokio::test]
    async fn dispatch_returns_none_when_nothing_eligible() {
        let s = scheduler();
        let task = s.create_task(TaskRequest { skip_approval: true, ..Default::default() }).await;
        s.set_plan(&task.id, plan_with(vec!["git status"])).await.unwrap();

        assert!(s.dispatch_next(&NoneAvailable).await.is_none());
    }

    #[tokio::test]
    async fn cancel_fails_on_terminal_task() {
        let s = scheduler();
        let task = s.create_task(TaskRequest { skip_approval: true, ..Default::default() }).await;
        s.set_plan(&task.id, plan_with(vec!["sudo rm -rf /"])).await.unwrap();
        assert!(s.cancel_task(&task.id, None).await.is_err());
    }
}

use chrono::{DateTime, Utc};
use convoy_core::{ConvoyError, ANY_CAPABILITY};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

/// Liveness state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Lock-manager identity of the process that registered the agent.
    pub owner: String,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
    #[serde(default)]
    pub deregistered_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        capabilities: BTreeSet<String>,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            capabilities,
            status: AgentStatus::Active,
            registered_at: now,
            last_heartbeat: now,
            owner: owner.into(),
            tasks_completed: 0,
            tasks_failed: 0,
            deregistered_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether this agent may run a task requiring `capability`.
    pub fn can_run(&self, capability: &str) -> bool {
        capability == ANY_CAPABILITY || self.has_capability(capability)
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks live in the archive and never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ConvoyError::Validation(format!(
                "Unknown task status '{other}'"
            ))),
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: serde_json::Value,
    pub required_capability: String,
    pub priority: u8,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub workflow_id: Option<String>,
}

impl Task {
    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    /// Whether `agent_id` currently holds this task.
    pub fn is_held_by(&self, agent_id: &str) -> bool {
        self.status == TaskStatus::Assigned && self.assigned_agent.as_deref() == Some(agent_id)
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            status: self.status,
            priority: self.priority,
            required_capability: self.required_capability.clone(),
            assigned_agent: self.assigned_agent.clone(),
            attempts: self.attempts,
            submitted_at: self.submitted_at,
        }
    }
}

fn default_capability() -> String {
    ANY_CAPABILITY.to_string()
}

fn default_priority() -> u8 {
    5
}

/// A task submission. Also used as a workflow's task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_capability")]
    pub required_capability: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Falls back to the queue's configured default.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            required_capability: default_capability(),
            priority: default_priority(),
            max_attempts: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capability = capability.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Compact task view for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: u8,
    pub required_capability: String,
    pub assigned_agent: Option<String>,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
}

/// What `fail` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FailOutcome {
    /// Back to pending; `attempts` failures so far.
    Requeued { attempts: u32 },
    /// Retry budget spent; the task is terminally failed.
    Exhausted { attempts: u32 },
}

/// Stored output of a completed task. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub result: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// Several task results combined into one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub requested: Vec<String>,
    pub results: Vec<TaskResult>,
    /// Requested ids that had no stored result.
    pub missing: Vec<String>,
}

/// Aggregate state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A named group of tasks submitted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub tasks: Vec<NewTask>,
    /// Generated task ids, in definition order.
    pub task_ids: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_tasks: BTreeSet<String>,
    #[serde(default)]
    pub failed_tasks: BTreeSet<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            total_tasks: self.task_ids.len(),
            completed_tasks: self.completed_tasks.len(),
            failed_tasks: self.failed_tasks.len(),
            submitted_at: self.submitted_at,
        }
    }
}

/// Compact workflow view for listings and status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub submitted_at: DateTime<Utc>,
}

/// Active agent counts per capability tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub active: usize,
    pub inactive: usize,
    pub by_capability: BTreeMap<String, usize>,
}

/// Record counts across the whole system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub agents_active: usize,
    pub agents_inactive: usize,
    pub tasks_pending: usize,
    pub tasks_assigned: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub workflows: usize,
    pub results: usize,
}

/// The instant `window` before now, or `None` when that lies before the
/// earliest representable time.
pub(crate) fn window_start(window: Duration) -> Option<DateTime<Utc>> {
    let window = chrono::Duration::from_std(window).ok()?;
    Utc::now().checked_sub_signed(window)
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::NexusError;

/// Kind of work a task represents. Drives capability lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Writing or modifying source code.
    Code,
    /// Data processing and transformation.
    Data,
    /// File system operations.
    File,
    /// Shell command execution.
    Terminal,
    /// Web requests and scraping.
    Web,
    /// Anything without a more specific capability.
    General,
}

impl TaskType {
    /// All task types, in declaration order.
    pub const ALL: [TaskType; 6] = [
        TaskType::Code,
        TaskType::Data,
        TaskType::File,
        TaskType::Terminal,
        TaskType::Web,
        TaskType::General,
    ];

    /// Lowercase tag used in plans and the capability table.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Code => "code",
            TaskType::Data => "data",
            TaskType::File => "file",
            TaskType::Terminal => "terminal",
            TaskType::Web => "web",
            TaskType::General => "general",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| NexusError::InvalidPlan(format!("unknown task type '{s}'")))
    }
}

/// Lifecycle status of a task.
///
/// Monotonic along `Pending → Ready → Running → {Completed | Failed |
/// Cancelled}`, except for the `Running → Pending` rollback used by retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or a retry slot.
    Pending,
    /// Dependencies satisfied, eligible for claiming.
    Ready,
    /// Claimed and dispatched to an agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Exhausted its retries.
    Failed,
    /// Abandoned because the session was cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a task in this status may be claimed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Ready)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of work within a session's task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the session.
    pub id: String,
    /// Kind of work; drives skill lookup.
    pub task_type: TaskType,
    /// Free-text instructions for the agent.
    pub description: String,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Capability tags the agent needs.
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// Dispatch hint naming the agent implementation.
    pub agent_type: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Success payload, present only when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub attempt: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last status change.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task with no dependencies and a generic agent type.
    pub fn new(id: impl Into<String>, task_type: TaskType, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_type,
            description: description.into(),
            dependencies: Vec::new(),
            required_skills: Vec::new(),
            agent_type: "GenericAgent".to_string(),
            status: TaskStatus::Pending,
            result: None,
            error_message: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the dependency list.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the required skill tags.
    pub fn with_required_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    /// Set the agent type hint.
    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    /// Change status and bump `updated_at`.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

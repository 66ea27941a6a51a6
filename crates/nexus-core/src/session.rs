use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::task::{Task, TaskStatus};

/// Lifecycle status of an orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Persisted but not yet driven.
    Created,
    /// A control loop is scheduling its tasks.
    Running,
    /// Every task completed.
    Completed,
    /// A task exhausted its retries or the session was aborted.
    Failed,
    /// Cancelled on request.
    Cancelled,
}

impl SessionStatus {
    /// Terminal statuses are sticky.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One end-to-end orchestration run, as projected into the blackboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id.
    pub session_id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last status change.
    pub updated_at: DateTime<Utc>,
    /// Task ids in plan order.
    #[serde(default)]
    pub task_order: Vec<String>,
    /// Task-id → task projection. Empty in the persisted header; the
    /// blackboard stores each task under its own key.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tasks: HashMap<String, Task>,
}

impl Session {
    /// Create a session with a generated id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Create a session with an explicit id.
    pub fn with_id(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
            task_order: Vec::new(),
            tasks: HashMap::new(),
        }
    }

    /// Attach tasks, keeping their order.
    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        for task in tasks {
            self.task_order.push(task.id.clone());
            self.tasks.insert(task.id.clone(), task);
        }
        self
    }

    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks in plan order. Ids missing from the projection are skipped.
    pub fn ordered_tasks(&self) -> Vec<&Task> {
        self.task_order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    /// Number of tasks in the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// The persisted header: same session without the task projection.
    pub fn header(&self) -> Session {
        Session {
            tasks: HashMap::new(),
            ..self.clone()
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

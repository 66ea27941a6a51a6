use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of state transition carried by a [`TaskEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Session persisted.
    SessionCreated,
    /// A control loop started driving the session.
    SessionRunning,
    /// A worker claimed a task.
    TaskClaimed,
    /// A task finished successfully.
    TaskCompleted,
    /// A failed attempt was scheduled for retry.
    TaskRetrying,
    /// A task exhausted its retries.
    TaskFailed,
    /// A task was abandoned by cancellation.
    TaskCancelled,
    /// A claim was released voluntarily.
    LeaseReleased,
    /// A claim expired without heartbeat and the task was reset.
    LeaseExpired,
    /// Every task completed.
    SessionCompleted,
    /// The session failed.
    SessionFailed,
    /// The session was cancelled.
    SessionCancelled,
}

/// Envelope published on a session's notification channel.
///
/// Delivery is at-least-once; observers deduplicate on `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Unique event id.
    pub event_id: Uuid,
    /// Session the event belongs to.
    pub session_id: String,
    /// Task the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Free-form detail (error message, worker id, attempt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl TaskEvent {
    /// Session-level event.
    pub fn session(session_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            session_id: session_id.into(),
            task_id: None,
            kind,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    /// Task-level event.
    pub fn task(session_id: impl Into<String>, task_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::session(session_id, kind)
        }
    }

    /// Attach a detail payload.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

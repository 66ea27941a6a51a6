use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Proof of an exclusive, time-bounded claim on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    /// Session of the claimed task.
    pub session_id: String,
    /// Claimed task.
    pub task_id: String,
    /// Worker holding the claim.
    pub worker_id: String,
    /// Distinguishes successive claims by the same worker.
    pub lease_id: Uuid,
    /// Wall-clock expiry as of the last claim or renewal.
    pub expires_at: DateTime<Utc>,
}

impl LeaseToken {
    /// Mint a token for a claim not yet taken. Pass it to
    /// [`Blackboard::claim_with`](crate::Blackboard::claim_with) so retries
    /// of the same claim are recognised.
    pub fn new(
        session_id: &str,
        task_id: &str,
        worker_id: &str,
        duration: Duration,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            lease_id: Uuid::new_v4(),
            expires_at: expiry(duration),
        }
    }

    /// Value stored under the claim key. Compare operations match on it, so
    /// it contains only fields that never change over the lease's life.
    pub(crate) fn claim_value(&self) -> serde_json::Value {
        serde_json::json!({
            "worker_id": self.worker_id,
            "lease_id": self.lease_id,
        })
    }

    pub(crate) fn extended(&self, duration: Duration) -> Self {
        Self {
            expires_at: expiry(duration),
            ..self.clone()
        }
    }
}

fn expiry(duration: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

use crate::lease::LeaseToken;
use crate::store::{InMemoryStore, StateStore};
use crate::subscription::Subscription;
use chrono::Utc;
use nexus_core::{
    EventKind, NexusError, NexusResult, Session, SessionStatus, Task, TaskEvent, TaskStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lost compare-and-swap rounds tolerated before a write is reported as a
/// store failure.
const MAX_CAS_ROUNDS: usize = 16;

const KEY_ROOT: &str = "nexus";

fn session_prefix(session_id: &str) -> String {
    format!("{KEY_ROOT}:{session_id}:")
}

fn session_key(session_id: &str) -> String {
    format!("{KEY_ROOT}:{session_id}:session")
}

fn task_prefix(session_id: &str) -> String {
    format!("{KEY_ROOT}:{session_id}:task:")
}

fn task_key(session_id: &str, task_id: &str) -> String {
    format!("{KEY_ROOT}:{session_id}:task:{task_id}")
}

fn claim_key(session_id: &str, task_id: &str) -> String {
    format!("{KEY_ROOT}:{session_id}:claim:{task_id}")
}

fn events_channel(session_id: &str) -> String {
    format!("{KEY_ROOT}:{session_id}:events")
}

fn session_event(status: SessionStatus) -> EventKind {
    match status {
        SessionStatus::Created => EventKind::SessionCreated,
        SessionStatus::Running => EventKind::SessionRunning,
        SessionStatus::Completed => EventKind::SessionCompleted,
        SessionStatus::Failed => EventKind::SessionFailed,
        SessionStatus::Cancelled => EventKind::SessionCancelled,
    }
}

/// Shared-state coordinator for sessions, tasks and claims.
///
/// Every mutation maps to one atomic store primitive or a compare-and-swap
/// loop over one. Terminal statuses, once written, are never overwritten by a
/// different status. Session lifecycle changes, claims, releases and reaped
/// leases are published on the session's event channel from here; task
/// outcome events are published by the caller through [`Blackboard::publish`].
#[derive(Clone)]
pub struct Blackboard {
    store: Arc<dyn StateStore>,
}

impl Blackboard {
    /// Wrap a store.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Blackboard over a fresh [`InMemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Health probe of the underlying store.
    pub async fn ping(&self) -> NexusResult<()> {
        self.store.ping().await
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Persist a new session header and its task projection.
    ///
    /// Calling again with the same `session` after a transient failure
    /// finishes the interrupted write. A different session under the same id
    /// fails with `SessionExists`.
    pub async fn create_session(&self, session: &Session) -> NexusResult<()> {
        let sid = &session.session_id;
        let key = session_key(sid);
        let header = serde_json::to_value(session.header())?;
        if !self.store.set_if_absent(&key, header.clone(), None).await? {
            if self.store.get(&key).await?.as_ref() != Some(&header) {
                return Err(NexusError::SessionExists(sid.clone()));
            }
            debug!(session_id = %sid, "Finishing interrupted session creation");
        }
        for task in session.ordered_tasks() {
            self.store
                .set(&task_key(sid, &task.id), serde_json::to_value(task)?, None)
                .await?;
        }
        info!(session_id = %sid, tasks = session.task_order.len(), "Session created");
        self.announce(sid, &TaskEvent::session(sid.as_str(), session_event(session.status)))
            .await;
        Ok(())
    }

    /// Load a session header together with every task stored for it.
    pub async fn get_session(&self, session_id: &str) -> NexusResult<Session> {
        let mut session = self.load_header(session_id).await?.1;
        let mut tasks = HashMap::new();
        for key in self.store.keys(&task_prefix(session_id)).await? {
            if let Some(value) = self.store.get(&key).await? {
                let task: Task = serde_json::from_value(value)?;
                tasks.insert(task.id.clone(), task);
            }
        }
        session.tasks = tasks;
        Ok(session)
    }

    /// Ids of every session currently stored.
    pub async fn list_sessions(&self) -> NexusResult<Vec<String>> {
        let prefix = format!("{KEY_ROOT}:");
        Ok(self
            .store
            .keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(":session"))
                    .map(str::to_string)
            })
            .collect())
    }

    /// Move a session to `status`. Re-applying the current status is a no-op;
    /// leaving a terminal status fails with `InvalidTransition`.
    pub async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> NexusResult<Session> {
        let key = session_key(session_id);
        for _ in 0..MAX_CAS_ROUNDS {
            let (raw, mut header) = self.load_header(session_id).await?;
            if header.status == status {
                return Ok(header);
            }
            if header.status.is_terminal() {
                return Err(NexusError::InvalidTransition(format!(
                    "session {session_id} is {} and cannot become {status}",
                    header.status
                )));
            }
            header.status = status;
            header.updated_at = Utc::now();
            let new = serde_json::to_value(&header)?;
            if self.store.compare_and_swap(&key, Some(&raw), new).await? {
                info!(session_id, status = %status, "Session status updated");
                self.announce(session_id, &TaskEvent::session(session_id, session_event(status)))
                    .await;
                return Ok(header);
            }
        }
        Err(NexusError::StoreUnavailable(format!(
            "session {session_id} update lost {MAX_CAS_ROUNDS} compare-and-swap rounds"
        )))
    }

    /// Delete every key of a session. Returns how many keys were removed.
    pub async fn flush_session(&self, session_id: &str) -> NexusResult<usize> {
        let removed = self.store.delete_prefix(&session_prefix(session_id)).await?;
        info!(session_id, removed, "Session flushed");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Current projection of one task.
    pub async fn get_task(&self, session_id: &str, task_id: &str) -> NexusResult<Task> {
        Ok(self.load_task(session_id, task_id).await?.1)
    }

    /// Overwrite a task's stored state.
    ///
    /// A task already terminal only accepts a write with the same status.
    pub async fn update_task_state(&self, session_id: &str, task: &Task) -> NexusResult<()> {
        let key = task_key(session_id, &task.id);
        let new = serde_json::to_value(task)?;
        for _ in 0..MAX_CAS_ROUNDS {
            let (raw, current) = self.load_task(session_id, &task.id).await?;
            if current.status.is_terminal() && current.status != task.status {
                return Err(NexusError::InvalidTransition(format!(
                    "task {} is {} and cannot become {}",
                    task.id, current.status, task.status
                )));
            }
            if self
                .store
                .compare_and_swap(&key, Some(&raw), new.clone())
                .await?
            {
                debug!(session_id, task_id = %task.id, status = %task.status, "Task state updated");
                return Ok(());
            }
        }
        Err(NexusError::StoreUnavailable(format!(
            "task {} update lost {MAX_CAS_ROUNDS} compare-and-swap rounds",
            task.id
        )))
    }

    // ------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------

    /// Take an exclusive, expiring claim on a task and mark it Running.
    ///
    /// The claim key is written with set-if-absent, so of any number of
    /// concurrent claimers exactly one proceeds. The winner then checks the
    /// task is still Pending or Ready; if it is not, the claim is dropped and
    /// `ClaimConflict` is returned.
    pub async fn claim_task(
        &self,
        session_id: &str,
        task_id: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> NexusResult<LeaseToken> {
        let token = LeaseToken::new(session_id, task_id, worker_id, lease_duration);
        self.claim_with(&token, lease_duration).await
    }

    /// [`Blackboard::claim_task`] under a lease the caller minted.
    ///
    /// Retrying with the same token after a transient failure is safe: a
    /// claim key already holding this token's value is taken as ours, and a
    /// task already Running under it is left as is.
    pub async fn claim_with(
        &self,
        token: &LeaseToken,
        lease_duration: Duration,
    ) -> NexusResult<LeaseToken> {
        let (session_id, task_id) = (token.session_id.as_str(), token.task_id.as_str());
        let worker_id = token.worker_id.as_str();
        let ckey = claim_key(session_id, task_id);
        let claim = token.claim_value();
        let fresh = self
            .store
            .set_if_absent(&ckey, claim.clone(), Some(lease_duration))
            .await?;
        if !fresh {
            if self.store.get(&ckey).await?.as_ref() != Some(&claim) {
                debug!(session_id, task_id, worker_id, "Claim already held");
                return Err(NexusError::ClaimConflict {
                    task_id: task_id.to_string(),
                });
            }
            self.store
                .compare_and_expire(&ckey, &claim, lease_duration)
                .await?;
            debug!(session_id, task_id, worker_id, "Resuming interrupted claim");
        }

        if let Err(e) = self.mark_claimed(session_id, task_id, !fresh).await {
            // A transient failure keeps the claim so a retry can finish.
            if !e.is_transient() {
                if let Err(undo) = self.store.compare_and_delete(&ckey, &claim).await {
                    warn!(session_id, task_id, error = %undo, "Could not drop rejected claim");
                }
            }
            return Err(e);
        }

        info!(session_id, task_id, worker_id, "Task claimed");
        let event = TaskEvent::task(session_id, task_id, EventKind::TaskClaimed)
            .with_detail(serde_json::json!({ "worker_id": worker_id }));
        self.announce(session_id, &event).await;
        Ok(token.extended(lease_duration))
    }

    async fn mark_claimed(&self, session_id: &str, task_id: &str, resumed: bool) -> NexusResult<()> {
        let (raw, mut task) = self.load_task(session_id, task_id).await?;
        if resumed && task.status == TaskStatus::Running {
            return Ok(());
        }
        if !task.status.is_claimable() {
            return Err(NexusError::ClaimConflict {
                task_id: task_id.to_string(),
            });
        }
        task.set_status(TaskStatus::Running);
        let new = serde_json::to_value(&task)?;
        if self
            .store
            .compare_and_swap(&task_key(session_id, task_id), Some(&raw), new)
            .await?
        {
            Ok(())
        } else {
            Err(NexusError::ClaimConflict {
                task_id: task_id.to_string(),
            })
        }
    }

    /// Extend a held claim. Fails with `LeaseExpired` once the claim has
    /// lapsed or been taken over.
    pub async fn renew_lease(
        &self,
        token: &LeaseToken,
        duration: Duration,
    ) -> NexusResult<LeaseToken> {
        let ckey = claim_key(&token.session_id, &token.task_id);
        if self
            .store
            .compare_and_expire(&ckey, &token.claim_value(), duration)
            .await?
        {
            Ok(token.extended(duration))
        } else {
            warn!(
                session_id = %token.session_id,
                task_id = %token.task_id,
                "Lease lost before renewal"
            );
            Err(NexusError::LeaseExpired {
                task_id: token.task_id.clone(),
            })
        }
    }

    /// Drop a held claim. Returns false when the claim was no longer ours.
    pub async fn release_lease(&self, token: &LeaseToken) -> NexusResult<bool> {
        let ckey = claim_key(&token.session_id, &token.task_id);
        let released = self
            .store
            .compare_and_delete(&ckey, &token.claim_value())
            .await?;
        if released {
            debug!(session_id = %token.session_id, task_id = %token.task_id, "Lease released");
            let event =
                TaskEvent::task(token.session_id.as_str(), token.task_id.as_str(), EventKind::LeaseReleased);
            self.announce(&token.session_id, &event).await;
        }
        Ok(released)
    }

    /// Worker currently holding a live claim on the task, if any.
    pub async fn claim_holder(&self, session_id: &str, task_id: &str) -> NexusResult<Option<String>> {
        Ok(self
            .store
            .get(&claim_key(session_id, task_id))
            .await?
            .and_then(|v| v.get("worker_id").and_then(Value::as_str).map(str::to_string)))
    }

    /// Return tasks recorded as Running without a live claim to Pending.
    /// Returns the ids that were reset.
    pub async fn reap_abandoned(&self, session_id: &str) -> NexusResult<Vec<String>> {
        let mut reaped = Vec::new();
        for key in self.store.keys(&task_prefix(session_id)).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let mut task: Task = serde_json::from_value(raw.clone())?;
            if task.status != TaskStatus::Running {
                continue;
            }
            if self.store.get(&claim_key(session_id, &task.id)).await?.is_some() {
                continue;
            }
            task.set_status(TaskStatus::Pending);
            let new = serde_json::to_value(&task)?;
            // Losing the swap means someone else moved the task on.
            if self.store.compare_and_swap(&key, Some(&raw), new).await? {
                warn!(session_id, task_id = %task.id, "Reclaimed abandoned task");
                let event = TaskEvent::task(session_id, task.id.as_str(), EventKind::LeaseExpired);
                self.announce(session_id, &event).await;
                reaped.push(task.id);
            }
        }
        Ok(reaped)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Publish an event on the session channel. Returns subscribers reached.
    pub async fn publish(&self, session_id: &str, event: &TaskEvent) -> NexusResult<usize> {
        let payload = serde_json::to_value(event)?;
        self.store.publish(&events_channel(session_id), payload).await
    }

    /// Publish after a committed write. The write stands either way, so a
    /// failed publish is logged rather than returned.
    async fn announce(&self, session_id: &str, event: &TaskEvent) {
        if let Err(e) = self.publish(session_id, event).await {
            warn!(session_id, kind = ?event.kind, error = %e, "Event publish failed");
        }
    }

    /// Subscribe to a session's events.
    pub async fn subscribe(&self, session_id: &str) -> NexusResult<Subscription> {
        let rx = self.store.subscribe(&events_channel(session_id)).await?;
        Ok(Subscription::new(rx))
    }

    // ------------------------------------------------------------------

    async fn load_header(&self, session_id: &str) -> NexusResult<(Value, Session)> {
        let raw = self
            .store
            .get(&session_key(session_id))
            .await?
            .ok_or_else(|| NexusError::NotFound(format!("session {session_id}")))?;
        let header = serde_json::from_value(raw.clone())?;
        Ok((raw, header))
    }

    async fn load_task(&self, session_id: &str, task_id: &str) -> NexusResult<(Value, Task)> {
        let raw = self
            .store
            .get(&task_key(session_id, task_id))
            .await?
            .ok_or_else(|| NexusError::NotFound(format!("task {task_id} in session {session_id}")))?;
        let task = serde_json::from_value(raw.clone())?;
        Ok((raw, task))
    }
}

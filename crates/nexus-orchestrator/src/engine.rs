use crate::config::{ConcurrencyScope, Settings};
use crate::dispatch::{AgentDispatch, DispatchOutcome, DispatchRequest};
use crate::graph::TaskGraph;
use crate::monitor::{AgentMonitor, AttemptResult};
use crate::plan::{Plan, SubmissionStatus};
use crate::retry::{with_store_retry, RetryPolicy};
use nexus_blackboard::{Blackboard, LeaseToken};
use nexus_core::{
    EventKind, NexusError, NexusResult, Session, SessionStatus, Task, TaskEvent, TaskStatus,
};
use nexus_skills::SkillLookup;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reports of submitted sessions kept for a later `await_session`.
const UNCLAIMED_REPORTS: usize = 64;

/// Final account of one session run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session id.
    pub session_id: String,
    /// Terminal status.
    pub status: SessionStatus,
    /// Number of tasks.
    pub total: usize,
    /// Tasks Completed.
    pub completed: usize,
    /// Tasks Failed.
    pub failed: usize,
    /// Tasks Cancelled.
    pub cancelled: usize,
    /// Wall time of the run.
    pub duration_ms: u64,
    /// One-line human summary.
    pub summary: String,
    /// Why the session failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionReport {
    fn build(
        session_id: &str,
        status: SessionStatus,
        counts: [usize; 4],
        duration_ms: u64,
        error: Option<String>,
    ) -> Self {
        let [total, completed, failed, cancelled] = counts;
        let summary = match (&status, &error) {
            (SessionStatus::Failed, Some(reason)) => format!(
                "Session {status}: {reason} ({completed}/{total} tasks completed, {cancelled} cancelled)"
            ),
            _ => format!(
                "Session {status}: {completed}/{total} tasks completed, {failed} failed, {cancelled} cancelled"
            ),
        };
        Self {
            session_id: session_id.to_string(),
            status,
            total,
            completed,
            failed,
            cancelled,
            duration_ms,
            summary,
            error,
        }
    }

    fn from_session(session: &Session) -> Self {
        let counts = [
            session.tasks.len(),
            session.count(TaskStatus::Completed),
            session.count(TaskStatus::Failed),
            session.count(TaskStatus::Cancelled),
        ];
        let duration_ms = (session.updated_at - session.created_at)
            .num_milliseconds()
            .max(0) as u64;
        Self::build(&session.session_id, session.status, counts, duration_ms, None)
    }
}

struct Inner {
    settings: Settings,
    policy: RetryPolicy,
    blackboard: Blackboard,
    dispatcher: Arc<dyn AgentDispatch>,
    skills: Arc<dyn SkillLookup>,
    monitor: AgentMonitor,
    worker_id: String,
    instance_permits: Arc<Semaphore>,
    active: Mutex<HashMap<String, CancellationToken>>,
    background: Mutex<HashMap<String, JoinHandle<SessionReport>>>,
    unclaimed: Mutex<VecDeque<SessionReport>>,
}

impl Inner {
    async fn store<T, F, Fut>(&self, what: &str, op: F) -> NexusResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = NexusResult<T>>,
    {
        with_store_retry(
            what,
            self.settings.orchestrator.store_retry_window(),
            &self.policy,
            op,
        )
        .await
    }

    /// Drop a finished background driver's handle. When nobody is waiting
    /// on it yet, keep the report for `await_session`.
    fn retire(&self, report: &SessionReport) {
        if self.background.lock().remove(&report.session_id).is_none() {
            return;
        }
        let mut unclaimed = self.unclaimed.lock();
        if unclaimed.len() == UNCLAIMED_REPORTS {
            unclaimed.pop_front();
        }
        unclaimed.push_back(report.clone());
    }
}

/// Drives sessions from plan to terminal state.
///
/// Each session runs its own control loop that owns the session's
/// [`TaskGraph`]. The loop claims ready tasks through the [`Blackboard`],
/// hands them to the [`AgentDispatch`] and folds the outcomes back in.
/// Cloning is cheap; clones share sessions, metrics and the concurrency
/// budget.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator over an existing blackboard.
    pub fn new(
        settings: Settings,
        blackboard: Blackboard,
        dispatcher: Arc<dyn AgentDispatch>,
        skills: Arc<dyn SkillLookup>,
    ) -> Self {
        let worker_id = settings.cluster.resolve_worker_id();
        let instance_permits = Arc::new(Semaphore::new(settings.cluster.max_parallel_agents));
        let policy = settings.orchestrator.retry_policy();
        Self {
            inner: Arc::new(Inner {
                settings,
                policy,
                blackboard,
                dispatcher,
                skills,
                monitor: AgentMonitor::new(),
                worker_id,
                instance_permits,
                active: Mutex::new(HashMap::new()),
                background: Mutex::new(HashMap::new()),
                unclaimed: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Build an orchestrator over the store named in `settings`.
    pub fn from_settings(
        settings: Settings,
        dispatcher: Arc<dyn AgentDispatch>,
        skills: Arc<dyn SkillLookup>,
    ) -> NexusResult<Self> {
        let blackboard = Blackboard::new(settings.cluster.open_store()?);
        Ok(Self::new(settings, blackboard, dispatcher, skills))
    }

    /// Identity written into claims.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Effective settings.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// The shared blackboard.
    pub fn blackboard(&self) -> &Blackboard {
        &self.inner.blackboard
    }

    /// Per-agent-type metrics.
    pub fn monitor(&self) -> &AgentMonitor {
        &self.inner.monitor
    }

    /// Check a plan without running it.
    pub fn validate(&self, plan: &Plan) -> SubmissionStatus {
        plan.submission_status()
    }

    /// Run a plan under a generated session id and wait for the outcome.
    pub async fn run(&self, plan: &Plan) -> NexusResult<SessionReport> {
        self.run_as(Uuid::new_v4().to_string(), plan).await
    }

    /// Run a plan under the given session id and wait for the outcome.
    ///
    /// Plan errors and a failure to create the session are returned as
    /// `Err`; everything after that ends in a report, including failure.
    pub async fn run_as(
        &self,
        session_id: impl Into<String>,
        plan: &Plan,
    ) -> NexusResult<SessionReport> {
        let graph = plan.validate()?;
        let driver = self.start(session_id.into(), graph).await?;
        Ok(driver.drive().await)
    }

    /// Validate a plan, create its session and drive it in the background.
    /// Returns the session id.
    pub async fn submit(&self, plan: &Plan) -> NexusResult<String> {
        self.submit_as(Uuid::new_v4().to_string(), plan).await
    }

    /// [`Orchestrator::submit`] with a caller-chosen session id.
    pub async fn submit_as(
        &self,
        session_id: impl Into<String>,
        plan: &Plan,
    ) -> NexusResult<String> {
        let graph = plan.validate()?;
        let driver = self.start(session_id.into(), graph).await?;
        let session_id = driver.session_id.clone();
        let inner = Arc::clone(&self.inner);
        // Held across the spawn so the driver cannot retire before its
        // handle is registered.
        let mut background = self.inner.background.lock();
        let handle = tokio::spawn(async move {
            let report = driver.drive().await;
            inner.retire(&report);
            report
        });
        background.insert(session_id.clone(), handle);
        Ok(session_id)
    }

    /// Wait for a session started with `submit` to finish.
    ///
    /// Each report is handed out once. The last 64 reports nobody waited for
    /// are kept; older ones are only in the blackboard projection.
    pub async fn await_session(&self, session_id: &str) -> NexusResult<SessionReport> {
        let handle = self.inner.background.lock().remove(session_id);
        if let Some(handle) = handle {
            return handle
                .await
                .map_err(|e| NexusError::Driver(format!("session {session_id}: {e}")));
        }
        let mut unclaimed = self.inner.unclaimed.lock();
        unclaimed
            .iter()
            .position(|r| r.session_id == session_id)
            .and_then(|i| unclaimed.remove(i))
            .ok_or_else(|| NexusError::NotFound(format!("background session {session_id}")))
    }

    /// Pick up a session from its blackboard projection after a restart.
    ///
    /// Completed tasks stay Completed. Running tasks whose claim has lapsed
    /// go back to Pending; tasks still claimed elsewhere are followed until
    /// their holder finishes or lets go.
    pub async fn resume(&self, session_id: &str) -> NexusResult<SessionReport> {
        let inner = &self.inner;
        let bb = &inner.blackboard;
        let current = inner.store("get_session", || bb.get_session(session_id)).await?;
        if current.status.is_terminal() {
            return Ok(SessionReport::from_session(&current));
        }
        let reaped = inner
            .store("reap_abandoned", || bb.reap_abandoned(session_id))
            .await?;
        if !reaped.is_empty() {
            info!(session_id, reaped = reaped.len(), "Abandoned tasks returned to pending");
        }
        let session = inner.store("get_session", || bb.get_session(session_id)).await?;
        let graph = TaskGraph::from_tasks(session.ordered_tasks().into_iter().cloned())?;
        inner
            .store("update_session_status", || {
                bb.update_session_status(session_id, SessionStatus::Running)
            })
            .await?;
        info!(session_id, tasks = graph.len(), "Session resumed");
        let driver = self.driver(session_id.to_string(), graph);
        Ok(driver.drive().await)
    }

    /// Ask a session driven by this orchestrator to stop.
    pub fn cancel(&self, session_id: &str) -> NexusResult<()> {
        let active = self.inner.active.lock();
        let token = active
            .get(session_id)
            .ok_or_else(|| NexusError::NotFound(format!("active session {session_id}")))?;
        info!(session_id, "Cancellation requested");
        token.cancel();
        Ok(())
    }

    /// Ids of sessions currently driven by this orchestrator.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current blackboard projection of a session.
    pub async fn session(&self, session_id: &str) -> NexusResult<Session> {
        self.inner.blackboard.get_session(session_id).await
    }

    async fn start(&self, session_id: String, graph: TaskGraph) -> NexusResult<SessionLoop> {
        let inner = &self.inner;
        let bb = &inner.blackboard;
        let session =
            Session::with_id(session_id.as_str()).with_tasks(graph.tasks().into_iter().cloned());
        inner
            .store("create_session", || bb.create_session(&session))
            .await?;
        inner
            .store("update_session_status", || {
                bb.update_session_status(&session_id, SessionStatus::Running)
            })
            .await?;
        info!(session_id = %session_id, tasks = graph.len(), worker_id = %inner.worker_id, "Session started");
        Ok(self.driver(session_id, graph))
    }

    fn driver(&self, session_id: String, graph: TaskGraph) -> SessionLoop {
        let cancel = CancellationToken::new();
        self.inner
            .active
            .lock()
            .insert(session_id.clone(), cancel.clone());
        SessionLoop::new(Arc::clone(&self.inner), session_id, graph, cancel)
    }
}

// ----------------------------------------------------------------------
// Dispatched units
// ----------------------------------------------------------------------

enum UnitOutcome {
    Dispatched(DispatchOutcome),
    Rejected(String),
    LeaseLost,
    Cancelled,
}

enum Message {
    Finished { task_id: String, outcome: UnitOutcome },
    RetryReady(String),
}

struct InFlight {
    lease: LeaseToken,
    cancel: CancellationToken,
    agent_type: String,
    started: Instant,
}

/// One claimed task on its way through the dispatcher. Renews the lease
/// while the agent works and stops the agent when the lease is lost or the
/// session is cancelled.
struct Unit {
    dispatcher: Arc<dyn AgentDispatch>,
    blackboard: Blackboard,
    timeout: Duration,
    heartbeat: Duration,
    lease_duration: Duration,
    cancel: CancellationToken,
}

impl Unit {
    async fn run(self, request: DispatchRequest, mut lease: LeaseToken) -> UnitOutcome {
        let handle = match self.dispatcher.submit(request).await {
            Ok(handle) => handle,
            Err(e) => return UnitOutcome::Rejected(e.to_string()),
        };
        let wait = self.dispatcher.wait(&handle, self.timeout);
        tokio::pin!(wait);
        let period = self.heartbeat.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut wait => return UnitOutcome::Dispatched(outcome),
                _ = self.cancel.cancelled() => {
                    self.dispatcher.cancel(&handle).await;
                    return UnitOutcome::Cancelled;
                }
                _ = heartbeat.tick() => {
                    match self.blackboard.renew_lease(&lease, self.lease_duration).await {
                        Ok(renewed) => lease = renewed,
                        Err(NexusError::LeaseExpired { .. }) => {
                            self.dispatcher.cancel(&handle).await;
                            return UnitOutcome::LeaseLost;
                        }
                        // The claim TTL decides if the store stays away.
                        Err(e) => warn!(task_id = %handle.task_id, error = %e, "Lease renewal failed"),
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Session control loop
// ----------------------------------------------------------------------

struct SessionLoop {
    inner: Arc<Inner>,
    session_id: String,
    graph: TaskGraph,
    rank: HashMap<String, usize>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    in_flight: HashMap<String, InFlight>,
    backing_off: HashSet<String>,
    failure: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    started: Instant,
}

impl SessionLoop {
    fn new(inner: Arc<Inner>, session_id: String, graph: TaskGraph, cancel: CancellationToken) -> Self {
        let permits = match inner.settings.cluster.concurrency_scope {
            ConcurrencyScope::Session => {
                Arc::new(Semaphore::new(inner.settings.cluster.max_parallel_agents))
            }
            ConcurrencyScope::Instance => Arc::clone(&inner.instance_permits),
        };
        let rank = graph
            .topological_sort()
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner,
            session_id,
            graph,
            rank,
            permits,
            cancel,
            in_flight: HashMap::new(),
            backing_off: HashSet::new(),
            failure: None,
            tx,
            rx,
            started: Instant::now(),
        }
    }

    async fn drive(mut self) -> SessionReport {
        let status = match self.run().await {
            Ok(status) => status,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Session aborted");
                self.failure.get_or_insert_with(|| e.to_string());
                SessionStatus::Failed
            }
        };
        self.finish(status).await
    }

    async fn run(&mut self) -> NexusResult<SessionStatus> {
        let period = self
            .inner
            .settings
            .orchestrator
            .scan_interval()
            .max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                return Ok(SessionStatus::Cancelled);
            }
            if self.failure.is_some() {
                return Ok(SessionStatus::Failed);
            }
            if self.graph.is_complete() {
                return Ok(SessionStatus::Completed);
            }

            self.dispatch_ready().await?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                Some(message) = self.rx.recv() => self.handle(message).await?,
                _ = sweep.tick() => self.sweep().await?,
            }
        }
    }

    /// Claim and launch ready tasks while the concurrency budget allows.
    async fn dispatch_ready(&mut self) -> NexusResult<()> {
        if self.cancel.is_cancelled() || self.failure.is_some() {
            return Ok(());
        }
        let sequential = !self.inner.settings.orchestrator.dag_optimization_enabled;
        if sequential && !self.in_flight.is_empty() {
            return Ok(());
        }

        let mut ready: Vec<String> = self
            .graph
            .get_ready_tasks()
            .into_iter()
            .filter(|t| !self.in_flight.contains_key(&t.id) && !self.backing_off.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();
        if sequential {
            ready.sort_by_key(|id| self.rank.get(id).copied().unwrap_or(usize::MAX));
        }

        let inner = Arc::clone(&self.inner);
        let bb = &inner.blackboard;
        let lease_duration = inner.settings.cluster.lease_duration();
        for task_id in ready {
            if sequential && !self.in_flight.is_empty() {
                break;
            }
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                debug!(session_id = %self.session_id, "Concurrency budget exhausted");
                break;
            };
            let token = LeaseToken::new(&self.session_id, &task_id, &inner.worker_id, lease_duration);
            let claim = inner
                .store("claim_task", || bb.claim_with(&token, lease_duration))
                .await;
            match claim {
                Ok(lease) => self.launch(task_id, lease, permit).await?,
                Err(NexusError::ClaimConflict { .. }) => {
                    debug!(session_id = %self.session_id, task_id = %task_id, "Claim conflict, skipping");
                }
                Err(e) => {
                    // One attempt only; the claim TTL covers a store that stays away.
                    if let Err(undo) = bb.release_lease(&token).await {
                        debug!(session_id = %self.session_id, task_id = %task_id, error = %undo, "Claim left to expire");
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn launch(
        &mut self,
        task_id: String,
        lease: LeaseToken,
        permit: OwnedSemaphorePermit,
    ) -> NexusResult<()> {
        self.graph.mark_task_running(&task_id)?;
        let task = self
            .graph
            .get(&task_id)
            .cloned()
            .ok_or_else(|| NexusError::UnknownTask(task_id.clone()))?;
        let skills = self.inner.skills.skills_for(task.task_type);
        let agent_type = task.agent_type.clone();
        self.inner.monitor.start_task(&agent_type, &task_id).await;

        let unit_cancel = self.cancel.child_token();
        self.in_flight.insert(
            task_id.clone(),
            InFlight {
                lease: lease.clone(),
                cancel: unit_cancel.clone(),
                agent_type,
                started: Instant::now(),
            },
        );
        info!(
            session_id = %self.session_id,
            task_id = %task_id,
            attempt = task.attempt,
            skills = ?skills,
            "Task dispatched"
        );

        let cluster = &self.inner.settings.cluster;
        let unit = Unit {
            dispatcher: Arc::clone(&self.inner.dispatcher),
            blackboard: self.inner.blackboard.clone(),
            timeout: self.inner.settings.orchestrator.task_timeout(),
            heartbeat: cluster.heartbeat_interval(),
            lease_duration: cluster.lease_duration(),
            cancel: unit_cancel,
        };
        let request = DispatchRequest {
            session_id: self.session_id.clone(),
            task,
            skills,
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = unit.run(request, lease).await;
            drop(permit);
            // The loop may already be gone.
            let _ = tx.send(Message::Finished { task_id, outcome });
        });
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> NexusResult<()> {
        match message {
            Message::RetryReady(task_id) => {
                self.backing_off.remove(&task_id);
                Ok(())
            }
            Message::Finished { task_id, outcome } => {
                let Some(flight) = self.in_flight.remove(&task_id) else {
                    return Ok(());
                };
                let elapsed = flight.started.elapsed().as_millis() as u64;
                match outcome {
                    UnitOutcome::Dispatched(DispatchOutcome::Success(value)) => {
                        self.on_success(task_id, flight, value, elapsed).await
                    }
                    UnitOutcome::Dispatched(DispatchOutcome::Failure(message)) => {
                        self.on_failure(task_id, flight, message, AttemptResult::Failed, elapsed)
                            .await
                    }
                    UnitOutcome::Dispatched(DispatchOutcome::TimedOut) => {
                        let message = format!(
                            "timed out after {}s",
                            self.inner.settings.orchestrator.task_timeout_secs
                        );
                        self.on_failure(task_id, flight, message, AttemptResult::TimedOut, elapsed)
                            .await
                    }
                    UnitOutcome::Rejected(message) => {
                        self.on_failure(task_id, flight, message, AttemptResult::Failed, elapsed)
                            .await
                    }
                    UnitOutcome::LeaseLost => {
                        warn!(session_id = %self.session_id, task_id = %task_id, "Lease lost, returning task to the ready set");
                        self.inner
                            .monitor
                            .finish_task(&flight.agent_type, &task_id, AttemptResult::Abandoned, elapsed)
                            .await;
                        if self.graph.get(&task_id).is_some_and(|t| !t.status.is_terminal()) {
                            self.graph.reset_to_pending(&task_id)?;
                        }
                        Ok(())
                    }
                    UnitOutcome::Cancelled => {
                        self.inner
                            .monitor
                            .finish_task(&flight.agent_type, &task_id, AttemptResult::Abandoned, elapsed)
                            .await;
                        self.release(&flight.lease).await;
                        Ok(())
                    }
                }
            }
        }
    }

    async fn on_success(
        &mut self,
        task_id: String,
        flight: InFlight,
        value: serde_json::Value,
        elapsed: u64,
    ) -> NexusResult<()> {
        let mut done = self.snapshot(&task_id)?;
        done.set_status(TaskStatus::Completed);
        done.result = Some(value.clone());
        done.error_message = None;

        // The graph only advances once the blackboard has the result.
        if !self.persist(&done).await? {
            self.inner
                .monitor
                .finish_task(&flight.agent_type, &task_id, AttemptResult::Abandoned, elapsed)
                .await;
            self.release(&flight.lease).await;
            return Ok(());
        }
        self.graph.mark_task_complete(&task_id, Some(value))?;
        self.inner
            .monitor
            .finish_task(&flight.agent_type, &task_id, AttemptResult::Completed, elapsed)
            .await;
        info!(session_id = %self.session_id, task_id = %task_id, duration_ms = elapsed, "Task completed");
        self.publish(
            TaskEvent::task(self.session_id.as_str(), task_id.as_str(), EventKind::TaskCompleted)
                .with_detail(serde_json::json!({
                    "attempt": done.attempt,
                    "worker_id": self.inner.worker_id,
                })),
        )
        .await;
        self.release(&flight.lease).await;
        Ok(())
    }

    async fn on_failure(
        &mut self,
        task_id: String,
        flight: InFlight,
        message: String,
        result: AttemptResult,
        elapsed: u64,
    ) -> NexusResult<()> {
        let attempt = self.graph.record_attempt(&task_id)?;
        self.graph.set_error(&task_id, message.clone())?;
        self.inner
            .monitor
            .finish_task(&flight.agent_type, &task_id, result, elapsed)
            .await;

        if self.inner.policy.should_retry(attempt) {
            self.graph.reset_to_pending(&task_id)?;
            let pending = self.snapshot(&task_id)?;
            let persisted = self.persist(&pending).await?;
            self.release(&flight.lease).await;
            if !persisted {
                return Ok(());
            }
            let delay = self.inner.policy.delay_for(attempt);
            warn!(
                session_id = %self.session_id,
                task_id = %task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Task failed, retrying"
            );
            self.inner.monitor.record_retry(&flight.agent_type).await;
            self.publish(
                TaskEvent::task(self.session_id.as_str(), task_id.as_str(), EventKind::TaskRetrying)
                    .with_detail(serde_json::json!({
                        "attempt": attempt,
                        "delay_ms": delay.as_millis() as u64,
                        "error": message,
                    })),
            )
            .await;
            self.backing_off.insert(task_id.clone());
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Message::RetryReady(task_id));
            });
        } else {
            self.graph.mark_task_failed(&task_id, message.clone())?;
            let failed = self.snapshot(&task_id)?;
            self.persist(&failed).await?;
            self.release(&flight.lease).await;
            error!(
                session_id = %self.session_id,
                task_id = %task_id,
                attempt,
                error = %message,
                "Task failed permanently"
            );
            self.publish(
                TaskEvent::task(self.session_id.as_str(), task_id.as_str(), EventKind::TaskFailed)
                    .with_detail(serde_json::json!({
                        "attempt": attempt,
                        "error": message,
                    })),
            )
            .await;
            self.failure = Some(format!(
                "task '{task_id}' failed after {attempt} attempt(s): {message}"
            ));
        }
        Ok(())
    }

    /// Return abandoned claims to the pool and catch up with tasks other
    /// workers have moved on.
    async fn sweep(&mut self) -> NexusResult<()> {
        let inner = Arc::clone(&self.inner);
        let bb = &inner.blackboard;
        let sid = self.session_id.as_str();

        let reaped = inner.store("reap_abandoned", || bb.reap_abandoned(sid)).await?;
        for task_id in &reaped {
            if !self.in_flight.contains_key(task_id)
                && self
                    .graph
                    .get(task_id)
                    .is_some_and(|t| t.status == TaskStatus::Running)
            {
                self.graph.reset_to_pending(task_id)?;
            }
        }

        let projection = inner.store("get_session", || bb.get_session(sid)).await?;
        match projection.status {
            SessionStatus::Cancelled => {
                info!(session_id = %self.session_id, "Session cancelled elsewhere");
                self.cancel.cancel();
                return Ok(());
            }
            SessionStatus::Failed => {
                self.failure
                    .get_or_insert_with(|| "session failed on another worker".to_string());
                return Ok(());
            }
            _ => {}
        }

        for task_id in self.graph.ids().to_vec() {
            if self.in_flight.contains_key(&task_id) || self.backing_off.contains(&task_id) {
                continue;
            }
            let (Some(local), Some(remote)) = (self.graph.get(&task_id), projection.task(&task_id))
            else {
                continue;
            };
            if local.status == remote.status || local.status.is_terminal() {
                continue;
            }
            match remote.status {
                TaskStatus::Completed => {
                    info!(session_id = %self.session_id, task_id = %task_id, "Task completed by another worker");
                    self.graph
                        .mark_task_complete(&task_id, remote.result.clone())?;
                }
                TaskStatus::Failed => {
                    let message = remote.error_message.clone().unwrap_or_default();
                    self.graph.mark_task_failed(&task_id, message.clone())?;
                    self.failure.get_or_insert_with(|| {
                        format!("task '{task_id}' failed on another worker: {message}")
                    });
                }
                TaskStatus::Cancelled => {
                    self.graph.mark_task_cancelled(&task_id)?;
                    self.cancel.cancel();
                }
                TaskStatus::Running => self.graph.mark_task_running(&task_id)?,
                TaskStatus::Pending | TaskStatus::Ready => self.graph.reset_to_pending(&task_id)?,
            }
        }
        Ok(())
    }

    async fn finish(mut self, status: SessionStatus) -> SessionReport {
        let sid = self.session_id.clone();
        if status != SessionStatus::Completed {
            for flight in self.in_flight.values() {
                flight.cancel.cancel();
            }
            let flights: Vec<(String, InFlight)> = self.in_flight.drain().collect();
            for (task_id, flight) in flights {
                let elapsed = flight.started.elapsed().as_millis() as u64;
                self.inner
                    .monitor
                    .finish_task(&flight.agent_type, &task_id, AttemptResult::Abandoned, elapsed)
                    .await;
                self.release(&flight.lease).await;
            }
            self.cancel_remaining().await;
        }

        let inner = Arc::clone(&self.inner);
        let bb = &inner.blackboard;
        if let Err(e) = inner
            .store("update_session_status", || bb.update_session_status(&sid, status))
            .await
        {
            error!(session_id = %sid, error = %e, "Could not record session outcome");
        }
        inner.active.lock().remove(&sid);

        let report = SessionReport::build(
            &sid,
            status,
            [
                self.graph.len(),
                self.graph.count(TaskStatus::Completed),
                self.graph.count(TaskStatus::Failed),
                self.graph.count(TaskStatus::Cancelled),
            ],
            self.started.elapsed().as_millis() as u64,
            if status == SessionStatus::Failed {
                self.failure.take()
            } else {
                None
            },
        );
        match status {
            SessionStatus::Completed => info!(session_id = %sid, summary = %report.summary, "Session finished"),
            SessionStatus::Cancelled => warn!(session_id = %sid, summary = %report.summary, "Session finished"),
            _ => error!(session_id = %sid, summary = %report.summary, "Session finished"),
        }
        report
    }

    async fn cancel_remaining(&mut self) {
        let open: Vec<String> = self
            .graph
            .tasks()
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for task_id in open {
            if self.graph.mark_task_cancelled(&task_id).is_err() {
                continue;
            }
            let Ok(cancelled) = self.snapshot(&task_id) else {
                continue;
            };
            if let Err(e) = self.persist(&cancelled).await {
                warn!(session_id = %self.session_id, task_id = %task_id, error = %e, "Could not record cancellation");
            }
            self.publish(TaskEvent::task(
                self.session_id.as_str(),
                task_id.as_str(),
                EventKind::TaskCancelled,
            ))
            .await;
        }
    }

    // ------------------------------------------------------------------

    fn snapshot(&self, task_id: &str) -> NexusResult<Task> {
        self.graph
            .get(task_id)
            .cloned()
            .ok_or_else(|| NexusError::UnknownTask(task_id.to_string()))
    }

    /// Write a task to the blackboard. `Ok(false)` means the blackboard
    /// already holds a different terminal state; the next sweep brings the
    /// graph in line.
    async fn persist(&self, task: &Task) -> NexusResult<bool> {
        let bb = &self.inner.blackboard;
        let sid = self.session_id.as_str();
        match self
            .inner
            .store("update_task_state", || bb.update_task_state(sid, task))
            .await
        {
            Ok(()) => Ok(true),
            Err(NexusError::InvalidTransition(reason)) => {
                warn!(session_id = %sid, task_id = %task.id, reason = %reason, "Blackboard refused task update");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&self, lease: &LeaseToken) {
        let bb = &self.inner.blackboard;
        if let Err(e) = self.inner.store("release_lease", || bb.release_lease(lease)).await {
            warn!(session_id = %self.session_id, task_id = %lease.task_id, error = %e, "Could not release lease");
        }
    }

    async fn publish(&self, event: TaskEvent) {
        let bb = &self.inner.blackboard;
        let sid = self.session_id.as_str();
        if let Err(e) = self.inner.store("publish", || bb.publish(sid, &event)).await {
            warn!(session_id = %sid, error = %e, "Could not publish event");
        }
    }
}

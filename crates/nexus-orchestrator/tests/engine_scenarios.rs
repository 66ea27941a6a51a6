#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use nexus_blackboard::{Blackboard, InMemoryStore, StateStore};
use nexus_core::{
    EventKind, NexusError, NexusResult, Session, SessionStatus, Task, TaskEvent, TaskStatus,
    TaskType,
};
use nexus_orchestrator::*;
use nexus_skills::CapabilityTable;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// Records start/end order and peak concurrency.
struct Recorder {
    log: Mutex<Vec<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
    work: Duration,
}

impl Recorder {
    fn new(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            work,
        })
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn position(&self, entry: &str) -> usize {
        self.log()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("missing log entry {entry}"))
    }

    fn starts(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|e| e.strip_prefix("start:").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl AgentExecutor for Recorder {
    async fn execute(&self, request: DispatchRequest) -> NexusResult<Value> {
        let id = request.task.id.clone();
        self.log.lock().push(format!("start:{id}"));
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.work).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().push(format!("end:{id}"));
        Ok(json!({ "id": id }))
    }
}

/// Fails a fixed number of times, then succeeds.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for Flaky {
    async fn execute(&self, request: DispatchRequest) -> NexusResult<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(NexusError::TaskExecution {
                task_id: request.task.id,
                message: format!("exit code {}", call + 1),
            })
        } else {
            Ok(json!("ok"))
        }
    }
}

/// Never finishes on its own.
struct Stuck;

#[async_trait]
impl AgentExecutor for Stuck {
    async fn execute(&self, _request: DispatchRequest) -> NexusResult<Value> {
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        Ok(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Store that can be switched off
// ---------------------------------------------------------------------------

struct FlakyStore {
    inner: InMemoryStore,
    down: AtomicBool,
    /// Event type whose next publish fails.
    dropped_event: Mutex<Option<&'static str>>,
    /// Operations whose next call fails.
    fail_once: Mutex<HashSet<&'static str>>,
}

impl FlakyStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            down: AtomicBool::new(false),
            dropped_event: Mutex::new(None),
            fail_once: Mutex::new(HashSet::new()),
        })
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn drop_next_event(&self, kind: &'static str) {
        *self.dropped_event.lock() = Some(kind);
    }

    fn fail_next(&self, op: &'static str) {
        self.fail_once.lock().insert(op);
    }

    fn check_op(&self, op: &'static str) -> NexusResult<()> {
        self.check()?;
        if self.fail_once.lock().remove(op) {
            Err(NexusError::StoreUnavailable(format!("{op}: connection reset")))
        } else {
            Ok(())
        }
    }

    fn check(&self) -> NexusResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(NexusError::StoreUnavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get(&self, key: &str) -> NexusResult<Option<Value>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> NexusResult<()> {
        self.check_op("set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> NexusResult<bool> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> NexusResult<bool> {
        self.check()?;
        self.inner.compare_and_swap(key, expected, new).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &Value) -> NexusResult<bool> {
        self.check()?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &Value,
        ttl: Duration,
    ) -> NexusResult<bool> {
        self.check()?;
        self.inner.compare_and_expire(key, expected, ttl).await
    }

    async fn keys(&self, prefix: &str) -> NexusResult<Vec<String>> {
        self.check()?;
        self.inner.keys(prefix).await
    }

    async fn delete_prefix(&self, prefix: &str) -> NexusResult<usize> {
        self.check()?;
        self.inner.delete_prefix(prefix).await
    }

    async fn publish(&self, channel: &str, payload: Value) -> NexusResult<usize> {
        self.check()?;
        {
            let mut dropped = self.dropped_event.lock();
            if dropped.is_some() && payload["type"].as_str() == *dropped {
                *dropped = None;
                return Err(NexusError::StoreUnavailable("publish: connection reset".into()));
            }
        }
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> NexusResult<broadcast::Receiver<Value>> {
        self.check()?;
        self.inner.subscribe(channel).await
    }

    async fn ping(&self) -> NexusResult<()> {
        self.check()
    }
}

/// Takes the store down while the first task runs.
struct OutageDuring {
    store: Arc<FlakyStore>,
    outage: Option<Duration>,
}

#[async_trait]
impl AgentExecutor for OutageDuring {
    async fn execute(&self, _request: DispatchRequest) -> NexusResult<Value> {
        self.store.set_down(true);
        if let Some(outage) = self.outage {
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                tokio::time::sleep(outage).await;
                store.set_down(false);
            });
        }
        Ok(json!("done"))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.cluster.worker_id = Some("worker-a".into());
    settings.orchestrator.retry_backoff_base_ms = 10;
    settings.orchestrator.retry_backoff_max_ms = 100;
    settings.orchestrator.scan_interval_ms = 50;
    settings.orchestrator.store_retry_window_secs = 5;
    settings
}

fn orchestrator_on(
    settings: Settings,
    blackboard: Blackboard,
    executor: Arc<dyn AgentExecutor>,
) -> Orchestrator {
    Orchestrator::new(
        settings,
        blackboard,
        Arc::new(LocalDispatcher::with_default(executor)),
        Arc::new(CapabilityTable::default_table()),
    )
}

fn orchestrator(settings: Settings, executor: Arc<dyn AgentExecutor>) -> Orchestrator {
    orchestrator_on(settings, Blackboard::in_memory(), executor)
}

fn spec(id: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec {
        id: id.to_string(),
        task_type: TaskType::General,
        description: format!("do {id}"),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        required_skills: Vec::new(),
        agent_type: "GenericAgent".to_string(),
    }
}

fn independent(n: usize) -> Plan {
    Plan::new(
        (0..n)
            .map(|i| spec(&format!("t{i}"), &[]))
            .collect(),
    )
}

fn count(events: &[TaskEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fan_out_respects_dependencies() {
    let recorder = Recorder::new(Duration::from_millis(100));
    let orch = orchestrator(settings(), recorder.clone());
    let plan = Plan::new(vec![
        spec("A", &[]),
        spec("B", &["A"]),
        spec("C", &["A"]),
        spec("D", &["B"]),
        spec("E", &["C"]),
    ]);

    let report = orch.run_as("fan", &plan).await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.completed, 5);

    assert_eq!(recorder.starts()[0], "A");
    assert!(recorder.position("end:A") < recorder.position("start:B"));
    assert!(recorder.position("end:A") < recorder.position("start:C"));
    assert!(recorder.position("end:B") < recorder.position("start:D"));
    assert!(recorder.position("end:C") < recorder.position("start:E"));
    // B and C run side by side.
    assert!(recorder.position("start:C") < recorder.position("end:B"));
}

#[tokio::test]
async fn cyclic_plan_is_rejected_before_any_session_exists() {
    let bb = Blackboard::in_memory();
    let orch = orchestrator_on(settings(), bb.clone(), Arc::new(EchoExecutor));
    let plan = Plan::new(vec![spec("a", &["c"]), spec("b", &["a"]), spec("c", &["b"])]);

    let status = orch.validate(&plan);
    assert!(matches!(status, SubmissionStatus::Rejected { ref reason } if reason.contains("cycle")));
    let err = orch.run(&plan).await.unwrap_err();
    assert!(matches!(err, NexusError::CyclicDependency(_)));
    assert!(orch.submit(&plan).await.is_err());
    assert!(bb.list_sessions().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrency_ceiling_is_honored() {
    let recorder = Recorder::new(Duration::from_millis(200));
    let mut settings = settings();
    settings.cluster.max_parallel_agents = 2;
    let orch = orchestrator(settings, recorder.clone());

    let report = orch.run(&independent(6)).await.unwrap();
    assert_eq!(report.completed, 6);
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn sequential_mode_runs_one_task_at_a_time_in_order() {
    let recorder = Recorder::new(Duration::from_millis(50));
    let mut settings = settings();
    settings.orchestrator.dag_optimization_enabled = false;
    let orch = orchestrator(settings, recorder.clone());
    let plan = Plan::new(vec![
        spec("setup", &[]),
        spec("lint", &["setup"]),
        spec("build", &["setup"]),
        spec("package", &["lint", "build"]),
    ]);

    let report = orch.run(&plan).await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.starts(), vec!["setup", "lint", "build", "package"]);
}

#[tokio::test(start_paused = true)]
async fn instance_scope_shares_the_ceiling_across_sessions() {
    let recorder = Recorder::new(Duration::from_millis(100));
    let mut settings = settings();
    settings.cluster.max_parallel_agents = 2;
    settings.cluster.concurrency_scope = ConcurrencyScope::Instance;
    let orch = orchestrator(settings, recorder.clone());

    let first = orch.submit(&independent(3)).await.unwrap();
    let second = orch.submit(&independent(3)).await.unwrap();
    assert_eq!(orch.await_session(&first).await.unwrap().completed, 3);
    assert_eq!(orch.await_session(&second).await.unwrap().completed, 3);
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Failures and retries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retries_exhausted_fail_the_session_once() {
    let flaky = Flaky::new(u32::MAX);
    let bb = Blackboard::in_memory();
    let orch = orchestrator_on(settings(), bb.clone(), flaky.clone());
    let mut events = bb.subscribe("doomed").await.unwrap();

    let report = orch
        .run_as("doomed", &Plan::new(vec![spec("only", &[]), spec("after", &["only"])]))
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.failed, 1);
    assert_eq!(report.cancelled, 1);
    assert!(report.error.as_deref().unwrap().contains("after 3 attempt(s)"));
    assert_eq!(flaky.calls(), 3);

    let events = events.drain();
    assert_eq!(count(&events, EventKind::TaskRetrying), 2);
    assert_eq!(count(&events, EventKind::TaskFailed), 1);
    assert_eq!(count(&events, EventKind::SessionFailed), 1);

    let session = orch.session("doomed").await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    let only = session.task("only").unwrap();
    assert_eq!(only.status, TaskStatus::Failed);
    assert_eq!(only.attempt, 3);
    assert_eq!(only.error_message.as_deref(), Some("task 'only' failed: exit code 3"));
    assert_eq!(session.task("after").unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn flaky_task_recovers_within_budget() {
    let flaky = Flaky::new(2);
    let bb = Blackboard::in_memory();
    let orch = orchestrator_on(settings(), bb.clone(), flaky.clone());

    let report = orch.run_as("flaky", &Plan::new(vec![spec("x", &[])])).await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(flaky.calls(), 3);

    let task = bb.get_task("flaky", "x").await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt, 2);
    assert!(task.error_message.is_none());

    let metrics = orch.monitor().aggregate_metrics().await;
    assert_eq!(metrics.retried, 2);
    assert_eq!(metrics.failed, 2);
    assert_eq!(metrics.completed, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_as_failure() {
    let mut settings = settings();
    settings.orchestrator.task_timeout_secs = 2;
    settings.orchestrator.max_task_retries = 1;
    let orch = orchestrator(settings, Arc::new(Stuck));

    let report = orch.run_as("slow", &Plan::new(vec![spec("hang", &[])])).await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("timed out after 2s"));

    let metrics = orch.monitor().aggregate_metrics().await;
    assert_eq!(metrics.timed_out, 1);
    assert_eq!(metrics.retried, 0);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_stops_running_work() {
    let bb = Blackboard::in_memory();
    let orch = orchestrator_on(settings(), bb.clone(), Arc::new(Stuck));
    let plan = Plan::new(vec![spec("a", &[]), spec("b", &[]), spec("c", &["a"])]);

    let id = orch.submit_as("stop-me", &plan).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orch.active_sessions(), vec!["stop-me"]);
    assert_eq!(orch.monitor().in_flight().await, 2);

    orch.cancel(&id).unwrap();
    let report = orch.await_session(&id).await.unwrap();
    assert_eq!(report.status, SessionStatus::Cancelled);
    assert_eq!(report.cancelled, 3);
    assert!(orch.active_sessions().is_empty());
    assert_eq!(orch.monitor().in_flight().await, 0);

    let session = bb.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert!(session
        .tasks
        .values()
        .all(|t| t.status == TaskStatus::Cancelled));
    assert!(bb.claim_holder(&id, "a").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Store outages
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn short_store_outage_is_ridden_out() {
    let store = FlakyStore::new();
    let bb = Blackboard::new(store.clone());
    let executor = Arc::new(OutageDuring {
        store: store.clone(),
        outage: Some(Duration::from_secs(1)),
    });
    let orch = orchestrator_on(settings(), bb.clone(), executor);

    let report = orch.run_as("blip", &Plan::new(vec![spec("a", &[])])).await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(
        bb.get_task("blip", "a").await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn long_store_outage_fails_the_session() {
    let store = FlakyStore::new();
    let bb = Blackboard::new(store.clone());
    let executor = Arc::new(OutageDuring {
        store: store.clone(),
        outage: None,
    });
    let orch = orchestrator_on(settings(), bb, executor);

    let report = orch.run_as("dark", &Plan::new(vec![spec("a", &[])])).await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert!(report
        .error
        .as_deref()
        .unwrap()
        .contains("state store unavailable"));
}

#[tokio::test(start_paused = true)]
async fn failed_claim_event_does_not_stall_the_task() {
    let store = FlakyStore::new();
    store.drop_next_event("task_claimed");
    let orch = orchestrator_on(settings(), Blackboard::new(store), Arc::new(EchoExecutor));

    let started = tokio::time::Instant::now();
    let report = orch
        .run_as("claim-blip", &Plan::new(vec![spec("a", &[])]))
        .await
        .unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "took {:?}",
        started.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn interrupted_session_creation_is_finished_on_retry() {
    let store = FlakyStore::new();
    store.fail_next("set");
    let bb = Blackboard::new(store);
    let orch = orchestrator_on(settings(), bb.clone(), Arc::new(EchoExecutor));

    let plan = Plan::new(vec![spec("a", &[]), spec("b", &["a"])]);
    let report = orch.run_as("half-written", &plan).await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.completed, 2);
    assert_eq!(bb.get_session("half-written").await.unwrap().tasks.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_rejects_the_session() {
    let store = FlakyStore::new();
    store.set_down(true);
    let orch = orchestrator_on(settings(), Blackboard::new(store), Arc::new(EchoExecutor));

    let err = orch.run(&Plan::new(vec![spec("a", &[])])).await.unwrap_err();
    assert!(err.is_transient());
}

// ---------------------------------------------------------------------------
// Recovery and shared state
// ---------------------------------------------------------------------------

fn task(id: &str, deps: &[&str], status: TaskStatus) -> Task {
    let mut task = Task::new(id, TaskType::General, format!("do {id}"))
        .with_dependencies(deps.iter().copied());
    task.set_status(status);
    task
}

#[tokio::test(start_paused = true)]
async fn resume_picks_up_where_a_crashed_worker_stopped() {
    let bb = Blackboard::in_memory();
    let mut done = task("a", &[], TaskStatus::Completed);
    done.result = Some(json!("from before"));
    bb.create_session(&Session::with_id("crashed").with_tasks([
        done,
        task("b", &["a"], TaskStatus::Running),
        task("c", &["b"], TaskStatus::Pending),
    ]))
    .await
    .unwrap();
    bb.update_session_status("crashed", SessionStatus::Running)
        .await
        .unwrap();

    let recorder = Recorder::new(Duration::from_millis(10));
    let orch = orchestrator_on(settings(), bb.clone(), recorder.clone());
    let report = orch.resume("crashed").await.unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.completed, 3);
    assert_eq!(recorder.starts(), vec!["b", "c"]);
    assert_eq!(
        bb.get_task("crashed", "a").await.unwrap().result,
        Some(json!("from before"))
    );
}

#[tokio::test(start_paused = true)]
async fn task_finished_by_another_worker_is_picked_up() {
    let bb = Blackboard::in_memory();
    bb.create_session(&Session::with_id("shared").with_tasks([
        task("a", &[], TaskStatus::Pending),
        task("b", &["a"], TaskStatus::Pending),
    ]))
    .await
    .unwrap();
    let lease = bb
        .claim_task("shared", "a", "worker-b", Duration::from_secs(300))
        .await
        .unwrap();

    let other = bb.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut a = other.get_task("shared", "a").await.unwrap();
        a.set_status(TaskStatus::Completed);
        a.result = Some(json!("by worker-b"));
        other.update_task_state("shared", &a).await.unwrap();
        other.release_lease(&lease).await.unwrap();
    });

    let recorder = Recorder::new(Duration::from_millis(10));
    let orch = orchestrator_on(settings(), bb.clone(), recorder.clone());
    let report = orch.resume("shared").await.unwrap();

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(recorder.starts(), vec!["b"]);
    assert_eq!(
        bb.get_task("shared", "a").await.unwrap().result,
        Some(json!("by worker-b"))
    );
}

#[tokio::test(start_paused = true)]
async fn lost_lease_returns_task_without_spending_an_attempt() {
    let mut settings = settings();
    settings.cluster.agent_idle_timeout_secs = 10;
    settings.cluster.heartbeat_interval_secs = 4;
    let bb = Blackboard::in_memory();
    let recorder = Recorder::new(Duration::from_secs(6));
    let orch = orchestrator_on(settings, bb.clone(), recorder.clone());

    let id = orch.submit_as("stolen", &Plan::new(vec![spec("a", &[])])).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    // Someone else drops the claim behind the worker's back.
    let holder_key = "nexus:stolen:claim:a";
    bb.store().delete_prefix(holder_key).await.unwrap();

    let report = orch.await_session(&id).await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(recorder.starts(), vec!["a", "a"]);
    let a = bb.get_task(&id, "a").await.unwrap();
    assert_eq!(a.attempt, 0);
    let metrics = orch.monitor().aggregate_metrics().await;
    assert_eq!(metrics.dispatched, 2);
    assert_eq!(metrics.failed, 0);
}

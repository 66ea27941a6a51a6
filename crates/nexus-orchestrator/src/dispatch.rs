use async_trait::async_trait;
use nexus_core::{NexusError, NexusResult, Task};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything an agent needs to run one attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Owning session.
    pub session_id: String,
    /// Snapshot of the task at dispatch time.
    pub task: Task,
    /// Skill ids resolved for the task type.
    pub skills: Vec<String>,
}

/// Reference to a submitted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchHandle {
    /// Unique dispatch id.
    pub id: Uuid,
    /// Task being executed.
    pub task_id: String,
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The agent produced a result.
    Success(Value),
    /// The agent reported an error.
    Failure(String),
    /// The attempt ran past its time budget.
    TimedOut,
}

/// Submit/await/cancel contract between the scheduler and execution agents.
#[async_trait]
pub trait AgentDispatch: Send + Sync {
    /// Start executing a request. Must not block on the work itself.
    async fn submit(&self, request: DispatchRequest) -> NexusResult<DispatchHandle>;

    /// Wait for a submitted unit, giving up after `timeout`.
    async fn wait(&self, handle: &DispatchHandle, timeout: Duration) -> DispatchOutcome;

    /// Stop a submitted unit. Fire-and-forget.
    async fn cancel(&self, handle: &DispatchHandle);
}

/// Something that actually runs a task.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Execute one attempt.
    async fn execute(&self, request: DispatchRequest) -> NexusResult<Value>;
}

/// Executor that succeeds immediately, describing what it was given.
pub struct EchoExecutor;

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(&self, request: DispatchRequest) -> NexusResult<Value> {
        Ok(serde_json::json!({
            "task_id": request.task.id,
            "task_type": request.task.task_type,
            "agent_type": request.task.agent_type,
            "skills": request.skills,
        }))
    }
}

/// Aborts the wrapped task when dropped, so a cancelled waiter never
/// leaves the work running.
struct AbortOnDrop(JoinHandle<NexusResult<Value>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// In-process dispatcher: runs executors as tokio tasks.
///
/// Executors are chosen by the task's `agent_type`, falling back to the
/// default executor.
pub struct LocalDispatcher {
    executors: HashMap<String, Arc<dyn AgentExecutor>>,
    default_executor: Option<Arc<dyn AgentExecutor>>,
    running: Mutex<HashMap<Uuid, JoinHandle<NexusResult<Value>>>>,
}

impl LocalDispatcher {
    /// Dispatcher with no executors.
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            default_executor: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatcher that sends everything to one executor.
    pub fn with_default(executor: Arc<dyn AgentExecutor>) -> Self {
        Self::new().default_executor(executor)
    }

    /// Set the fallback executor.
    pub fn default_executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.default_executor = Some(executor);
        self
    }

    /// Route an agent type to an executor.
    pub fn register(mut self, agent_type: impl Into<String>, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executors.insert(agent_type.into(), executor);
        self
    }

    /// Number of submitted units not yet awaited or cancelled.
    pub fn in_flight(&self) -> usize {
        self.running.lock().len()
    }

    fn executor_for(&self, agent_type: &str) -> Option<Arc<dyn AgentExecutor>> {
        self.executors
            .get(agent_type)
            .or(self.default_executor.as_ref())
            .cloned()
    }
}

impl Default for LocalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentDispatch for LocalDispatcher {
    async fn submit(&self, request: DispatchRequest) -> NexusResult<DispatchHandle> {
        let task_id = request.task.id.clone();
        let executor = self.executor_for(&request.task.agent_type).ok_or_else(|| {
            NexusError::TaskExecution {
                task_id: task_id.clone(),
                message: format!("no executor for agent type '{}'", request.task.agent_type),
            }
        })?;
        let handle = DispatchHandle {
            id: Uuid::new_v4(),
            task_id,
        };
        let join = tokio::spawn(async move { executor.execute(request).await });
        self.running.lock().insert(handle.id, join);
        debug!(dispatch_id = %handle.id, task_id = %handle.task_id, "Dispatched");
        Ok(handle)
    }

    async fn wait(&self, handle: &DispatchHandle, timeout: Duration) -> DispatchOutcome {
        let Some(join) = self.running.lock().remove(&handle.id) else {
            return DispatchOutcome::Failure(format!("unknown dispatch {}", handle.id));
        };
        let mut guard = AbortOnDrop(join);
        match tokio::time::timeout(timeout, &mut guard.0).await {
            Ok(Ok(Ok(value))) => DispatchOutcome::Success(value),
            Ok(Ok(Err(e))) => DispatchOutcome::Failure(e.to_string()),
            Ok(Err(join_err)) => {
                warn!(task_id = %handle.task_id, error = %join_err, "Agent task aborted");
                DispatchOutcome::Failure(format!("agent aborted: {join_err}"))
            }
            Err(_) => DispatchOutcome::TimedOut,
        }
    }

    async fn cancel(&self, handle: &DispatchHandle) {
        if let Some(join) = self.running.lock().remove(&handle.id) {
            join.abort();
            debug!(dispatch_id = %handle.id, task_id = %handle.task_id, "Dispatch cancelled");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use nexus_core::TaskType;

    struct Sleepy(Duration);

    #[async_trait]
    impl AgentExecutor for Sleepy {
        async fn execute(&self, _request: DispatchRequest) -> NexusResult<Value> {
            tokio::time::sleep(self.0).await;
            Ok(Value::Null)
        }
    }

    struct Broken;

    #[async_trait]
    impl AgentExecutor for Broken {
        async fn execute(&self, request: DispatchRequest) -> NexusResult<Value> {
            Err(NexusError::TaskExecution {
                task_id: request.task.id,
                message: "exit code 1".into(),
            })
        }
    }

    fn request(agent_type: &str) -> DispatchRequest {
        DispatchRequest {
            session_id: "s".into(),
            task: Task::new("t", TaskType::Terminal, "run").with_agent_type(agent_type),
            skills: vec!["terminal-exec".into()],
        }
    }

    #[tokio::test]
    async fn test_echo_success() {
        let dispatcher = LocalDispatcher::with_default(Arc::new(EchoExecutor));
        let handle = dispatcher.submit(request("GenericAgent")).await.unwrap();
        match dispatcher.wait(&handle, Duration::from_secs(1)).await {
            DispatchOutcome::Success(v) => {
                assert_eq!(v["task_id"], "t");
                assert_eq!(v["skills"][0], "terminal-exec");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_routing_by_agent_type() {
        let dispatcher = LocalDispatcher::with_default(Arc::new(EchoExecutor))
            .register("BrokenAgent", Arc::new(Broken));
        let handle = dispatcher.submit(request("BrokenAgent")).await.unwrap();
        let outcome = dispatcher.wait(&handle, Duration::from_secs(1)).await;
        assert!(matches!(outcome, DispatchOutcome::Failure(m) if m.contains("exit code 1")));
    }

    #[tokio::test]
    async fn test_no_executor() {
        let dispatcher = LocalDispatcher::new();
        let err = dispatcher.submit(request("Nobody")).await.unwrap_err();
        assert!(matches!(err, NexusError::TaskExecution { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let dispatcher = LocalDispatcher::with_default(Arc::new(Sleepy(Duration::from_secs(60))));
        let handle = dispatcher.submit(request("GenericAgent")).await.unwrap();
        assert_eq!(
            dispatcher.wait(&handle, Duration::from_secs(5)).await,
            DispatchOutcome::TimedOut
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_wait() {
        let dispatcher = LocalDispatcher::with_default(Arc::new(Sleepy(Duration::from_secs(60))));
        let handle = dispatcher.submit(request("GenericAgent")).await.unwrap();
        assert_eq!(dispatcher.in_flight(), 1);
        dispatcher.cancel(&handle).await;
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(matches!(
            dispatcher.wait(&handle, Duration::from_secs(1)).await,
            DispatchOutcome::Failure(_)
        ));
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters for one agent type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Attempts handed to the dispatcher.
    pub dispatched: u64,
    /// Attempts that succeeded.
    pub completed: u64,
    /// Attempts that failed (timeouts included).
    pub failed: u64,
    /// Failures that were scheduled for another try.
    pub retried: u64,
    /// Attempts that ran past the task timeout.
    pub timed_out: u64,
    /// Cumulative wall time of finished attempts.
    pub duration_ms: u64,
}

/// Live view of one agent type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Agent type key.
    pub agent_type: String,
    /// Task ids currently running on this agent type.
    pub in_flight: Vec<String>,
    /// Counters.
    pub metrics: AgentMetrics,
}

/// How a dispatched attempt ended, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    /// Success.
    Completed,
    /// Agent-reported failure.
    Failed,
    /// Exceeded the task timeout.
    TimedOut,
    /// Stopped by cancellation or lease loss; counts no outcome.
    Abandoned,
}

/// Tracks state and metrics per agent type.
#[derive(Clone, Default)]
pub struct AgentMonitor {
    states: Arc<RwLock<HashMap<String, AgentState>>>,
}

impl AgentMonitor {
    /// Empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// An attempt of `task_id` was dispatched to `agent_type`.
    pub async fn start_task(&self, agent_type: &str, task_id: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent_type.to_string())
            .or_insert_with(|| AgentState {
                agent_type: agent_type.to_string(),
                ..AgentState::default()
            });
        state.metrics.dispatched += 1;
        state.in_flight.push(task_id.to_string());
    }

    /// An attempt of `task_id` on `agent_type` ended.
    pub async fn finish_task(
        &self,
        agent_type: &str,
        task_id: &str,
        result: AttemptResult,
        duration_ms: u64,
    ) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent_type) {
            if let Some(pos) = state.in_flight.iter().position(|t| t == task_id) {
                state.in_flight.remove(pos);
            }
            state.metrics.duration_ms += duration_ms;
            match result {
                AttemptResult::Completed => state.metrics.completed += 1,
                AttemptResult::Failed => state.metrics.failed += 1,
                AttemptResult::TimedOut => {
                    state.metrics.failed += 1;
                    state.metrics.timed_out += 1;
                }
                AttemptResult::Abandoned => {}
            }
        }
    }

    /// A failed attempt on `agent_type` will be retried.
    pub async fn record_retry(&self, agent_type: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(agent_type) {
            state.metrics.retried += 1;
        }
    }

    /// All agent states, sorted by agent type.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        let states = self.states.read().await;
        let mut all: Vec<AgentState> = states.values().cloned().collect();
        all.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
        all
    }

    /// State of one agent type.
    pub async fn get_state(&self, agent_type: &str) -> Option<AgentState> {
        let states = self.states.read().await;
        states.get(agent_type).cloned()
    }

    /// Total attempts currently running.
    pub async fn in_flight(&self) -> usize {
        let states = self.states.read().await;
        states.values().map(|s| s.in_flight.len()).sum()
    }

    /// Metrics summed over every agent type.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.dispatched += state.metrics.dispatched;
            total.completed += state.metrics.completed;
            total.failed += state.metrics.failed;
            total.retried += state.metrics.retried;
            total.timed_out += state.metrics.timed_out;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": states,
            "aggregate": aggregate,
        })
    }
}

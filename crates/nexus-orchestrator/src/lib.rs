//! Task-graph scheduling engine for the Nexus orchestrator.
//!
//! A [`Plan`] is validated into a [`TaskGraph`]; the [`Orchestrator`] then
//! drives each session to a terminal state, claiming ready tasks on the
//! shared blackboard, dispatching them through an [`AgentDispatch`] and
//! retrying failures with exponential backoff.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Session control loop: claim, dispatch, retry, finish.
//! - [`TaskGraph`] — Dependency DAG with readiness, cycle detection and ordering.
//! - [`Plan`] — Declarative task list as submitted by callers.
//! - [`AgentDispatch`] — Submit/await/cancel contract towards execution agents.
//! - [`AgentMonitor`] — Per-agent-type in-flight tracking and counters.
//! - [`Settings`] — Runtime configuration with environment overrides.

/// Runtime configuration.
pub mod config;
/// Dispatch contract and the in-process dispatcher.
pub mod dispatch;
/// Session control loop.
pub mod engine;
/// Dependency graph.
pub mod graph;
/// Per-agent-type metrics.
pub mod monitor;
/// Submitted plans.
pub mod plan;
/// Backoff and store retry.
pub mod retry;

pub use config::{ClusterConfig, ConcurrencyScope, LoggingConfig, OrchestratorConfig, Settings};
pub use dispatch::{
    AgentDispatch, AgentExecutor, DispatchHandle, DispatchOutcome, DispatchRequest, EchoExecutor,
    LocalDispatcher,
};
pub use engine::{Orchestrator, SessionReport};
pub use graph::TaskGraph;
pub use monitor::{AgentMetrics, AgentMonitor, AgentState, AttemptResult};
pub use plan::{Plan, SubmissionStatus, TaskSpec};
pub use retry::{compute_backoff, with_store_retry, RetryPolicy};

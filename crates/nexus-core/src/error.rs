use thiserror::Error;

/// A convenience `Result` alias using [`NexusError`].
pub type NexusResult<T> = Result<T, NexusError>;

/// Top-level error type for the Nexus orchestrator.
///
/// Graph construction errors (`DanglingDependency`, `CyclicDependency`,
/// `DuplicateTask`, `InvalidPlan`) are reported synchronously to the
/// submitter. `ClaimConflict` and `LeaseExpired` are expected outcomes of
/// multi-worker coordination, not user-facing failures.
#[derive(Error, Debug)]
pub enum NexusError {
    /// A task declares a dependency on a task id that is not in the graph.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    DanglingDependency {
        /// The task declaring the dependency.
        task: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// The dependency relation contains a directed cycle.
    #[error("dependency cycle detected: {0}")]
    CyclicDependency(String),

    /// A task id was inserted twice into the same graph.
    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),

    /// A graph operation referenced a task id that does not exist.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// The submitted plan is empty or malformed.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Another worker holds the claim on this task.
    #[error("task '{task_id}' is already claimed")]
    ClaimConflict {
        /// The contested task.
        task_id: String,
    },

    /// A single execution attempt of a task failed.
    #[error("task '{task_id}' failed: {message}")]
    TaskExecution {
        /// The failing task.
        task_id: String,
        /// Failure message reported by the agent.
        message: String,
    },

    /// The lease on a claimed task expired or was taken over.
    #[error("lease on task '{task_id}' expired")]
    LeaseExpired {
        /// The task whose lease is gone.
        task_id: String,
    },

    /// The shared state store could not be reached.
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    /// A session or record was not found in the blackboard.
    #[error("not found: {0}")]
    NotFound(String),

    /// A session with the same id already exists.
    #[error("session '{0}' already exists")]
    SessionExists(String),

    /// A state transition that would leave a terminal state.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    /// A background session driver stopped without producing a report.
    #[error("session driver failed: {0}")]
    Driver(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the skill registry.
    #[error("Skill error: {0}")]
    Skill(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NexusError {
    /// Whether the error is a transient infrastructure failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, NexusError::StoreUnavailable(_))
    }

    /// Whether the error belongs to plan/graph construction, which rejects a
    /// submission before anything runs.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            NexusError::DanglingDependency { .. }
                | NexusError::CyclicDependency(_)
                | NexusError::DuplicateTask(_)
                | NexusError::InvalidPlan(_)
        )
    }
}

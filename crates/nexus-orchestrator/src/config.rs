use crate::retry::RetryPolicy;
use config::{Config, Environment, File, FileFormat};
use nexus_blackboard::{InMemoryStore, RedisStore, StateStore};
use nexus_core::{NexusError, NexusResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Prefix of environment overrides, e.g. `NEXUS_CLUSTER__MAX_PARALLEL_AGENTS`.
pub const ENV_PREFIX: &str = "NEXUS";
/// Environment variable naming the config file.
pub const CONFIG_FILE_ENV: &str = "NEXUS_CONFIG_FILE";

const LOG_LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Whether the parallelism budget is per session or per process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyScope {
    /// Each session gets `max_parallel_agents`.
    #[default]
    Session,
    /// All sessions of one orchestrator share `max_parallel_agents`.
    Instance,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_task_retries() -> u32 {
    3
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_scan_interval_ms() -> u64 {
    250
}
fn default_store_retry_window_secs() -> u64 {
    30
}
fn default_store_url() -> String {
    "memory://".to_string()
}
fn default_max_parallel_agents() -> usize {
    5
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_logging_level() -> String {
    "info".to_string()
}

/// Scheduling and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Orchestrator log level (TRACE..ERROR).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Dispatch every ready task in parallel. When off, tasks run one at a
    /// time in topological order.
    #[serde(default = "default_true")]
    pub dag_optimization_enabled: bool,
    /// Failed attempts allowed per task.
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,
    /// Time budget of one attempt.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Base retry delay.
    #[serde(default = "default_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Retry delay cap.
    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// Period of the ready-set scan and abandoned-lease sweep.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// How long store outages are retried before the session fails.
    #[serde(default = "default_store_retry_window_secs")]
    pub store_retry_window_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dag_optimization_enabled: true,
            max_task_retries: default_max_task_retries(),
            task_timeout_secs: default_task_timeout_secs(),
            retry_backoff_base_ms: default_backoff_base_ms(),
            retry_backoff_max_ms: default_backoff_max_ms(),
            scan_interval_ms: default_scan_interval_ms(),
            store_retry_window_secs: default_store_retry_window_secs(),
        }
    }
}

impl OrchestratorConfig {
    /// Retry policy built from the retry fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_task_retries,
            backoff_base_ms: self.retry_backoff_base_ms,
            backoff_max_ms: self.retry_backoff_max_ms,
        }
    }

    /// Time budget of one attempt.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Scan period.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Store outage tolerance.
    pub fn store_retry_window(&self) -> Duration {
        Duration::from_secs(self.store_retry_window_secs)
    }
}

/// Shared-store and worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Store location: `memory://` for a private in-process store, or a
    /// `redis://` / `rediss://` url shared by every worker. Also read as
    /// `redis_url`.
    #[serde(default = "default_store_url", alias = "redis_url")]
    pub store_url: String,
    /// Ceiling on claimed-and-dispatched tasks.
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    /// Scope of `max_parallel_agents`.
    #[serde(default)]
    pub concurrency_scope: ConcurrencyScope,
    /// Claim lease length; a claim not renewed in this time expires.
    #[serde(default = "default_idle_timeout_secs")]
    pub agent_idle_timeout_secs: u64,
    /// Lease renewal period.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Worker identity written into claims. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            max_parallel_agents: default_max_parallel_agents(),
            concurrency_scope: ConcurrencyScope::default(),
            agent_idle_timeout_secs: default_idle_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            worker_id: None,
        }
    }
}

impl ClusterConfig {
    /// Lease length.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.agent_idle_timeout_secs)
    }

    /// Lease renewal period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Configured worker id, or a fresh one.
    pub fn resolve_worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
    }

    /// Open the configured store.
    pub fn open_store(&self) -> NexusResult<Arc<dyn StateStore>> {
        let url = self.store_url.as_str();
        match url.split_once("://").map(|(scheme, _)| scheme) {
            Some("memory") => Ok(Arc::new(InMemoryStore::new())),
            Some("redis" | "rediss") => {
                info!(url, "Using redis store");
                Ok(Arc::new(RedisStore::open(url)?))
            }
            _ => Err(NexusError::Config(format!("unsupported store url '{url}'"))),
        }
    }
}

/// Log output settings for the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_logging_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_logging_level(),
            json: false,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Scheduling and retry.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Store and workers.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Parse TOML and apply overrides from the process environment.
    pub fn from_toml(source: &str) -> NexusResult<Self> {
        Self::build(source, None)
    }

    /// Parse TOML and apply overrides from the given `(name, value)` pairs
    /// instead of the process environment.
    pub fn from_toml_with_env(
        source: &str,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> NexusResult<Self> {
        Self::build(source, Some(vars.into_iter().collect()))
    }

    fn build(source: &str, vars: Option<config::Map<String, String>>) -> NexusResult<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .source(vars),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| NexusError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path`, else from `NEXUS_CONFIG_FILE`, else defaults; then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> NexusResult<Self> {
        let from_env = std::env::var(CONFIG_FILE_ENV).ok();
        let path: Option<PathBuf> = path.map(Path::to_path_buf).or_else(|| from_env.map(PathBuf::from));
        let source = match &path {
            Some(p) => std::fs::read_to_string(p).map_err(|e| {
                NexusError::Config(format!("Failed to read config '{}': {e}", p.display()))
            })?,
            None => String::new(),
        };
        let settings = Self::from_toml(&source)?;
        info!(
            path = %path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<defaults>".into()),
            "Configuration loaded"
        );
        Ok(settings)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> NexusResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| NexusError::Config(format!("Failed to render config: {e}")))
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> NexusResult<()> {
        let o = &self.orchestrator;
        let c = &self.cluster;
        if !LOG_LEVELS.contains(&o.log_level.to_uppercase().as_str()) {
            return Err(NexusError::Config(format!(
                "unknown log level '{}'",
                o.log_level
            )));
        }
        if c.max_parallel_agents == 0 {
            return Err(NexusError::Config(
                "cluster.max_parallel_agents must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("orchestrator.task_timeout_secs", o.task_timeout_secs),
            ("orchestrator.scan_interval_ms", o.scan_interval_ms),
            ("cluster.agent_idle_timeout_secs", c.agent_idle_timeout_secs),
            ("cluster.heartbeat_interval_secs", c.heartbeat_interval_secs),
        ] {
            if value == 0 {
                return Err(NexusError::Config(format!("{name} must be positive")));
            }
        }
        if c.heartbeat_interval_secs >= c.agent_idle_timeout_secs {
            return Err(NexusError::Config(format!(
                "cluster.heartbeat_interval_secs ({}) must be below agent_idle_timeout_secs ({})",
                c.heartbeat_interval_secs, c.agent_idle_timeout_secs
            )));
        }
        if o.retry_backoff_base_ms > o.retry_backoff_max_ms {
            return Err(NexusError::Config(
                "orchestrator.retry_backoff_base_ms exceeds retry_backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

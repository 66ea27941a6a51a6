use crate::graph::TaskGraph;
use nexus_core::{NexusError, NexusResult, Task, TaskType};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_agent_type() -> String {
    "GenericAgent".to_string()
}

/// One task as written in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task id, unique within the plan.
    #[serde(alias = "task_id")]
    pub id: String,
    /// Task type tag.
    #[serde(rename = "type", alias = "task_type")]
    pub task_type: TaskType,
    /// Free text handed to the agent.
    #[serde(default)]
    pub description: String,
    /// Ids this task waits for.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Capability tags.
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// Dispatch hint.
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
}

impl TaskSpec {
    /// Convert into a fresh pending task.
    pub fn to_task(&self) -> Task {
        Task::new(self.id.clone(), self.task_type, self.description.clone())
            .with_dependencies(self.dependencies.iter().cloned())
            .with_required_skills(self.required_skills.iter().cloned())
            .with_agent_type(self.agent_type.clone())
    }
}

impl From<&Task> for TaskSpec {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            task_type: task.task_type,
            description: task.description.clone(),
            dependencies: task.dependencies.clone(),
            required_skills: task.required_skills.clone(),
            agent_type: task.agent_type.clone(),
        }
    }
}

/// A parsed plan: the tasks of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Tasks in plan order.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl Plan {
    /// Plan from task specs.
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    /// Parse a JSON plan.
    pub fn from_json(source: &str) -> NexusResult<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Parse a TOML plan (`[[tasks]]` tables).
    pub fn from_toml(source: &str) -> NexusResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Read a plan file; `.toml` files are parsed as TOML, anything else as JSON.
    pub fn from_path(path: &Path) -> NexusResult<Self> {
        let source = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&source),
            _ => Self::from_json(&source),
        }
    }

    /// Fresh pending tasks in plan order.
    pub fn to_tasks(&self) -> Vec<Task> {
        self.tasks.iter().map(TaskSpec::to_task).collect()
    }

    /// Check the plan and build its graph: non-empty, non-blank ids, unique
    /// ids, no dangling dependency, acyclic.
    pub fn validate(&self) -> NexusResult<TaskGraph> {
        if self.tasks.is_empty() {
            return Err(NexusError::InvalidPlan("plan contains no tasks".to_string()));
        }
        if let Some(blank) = self.tasks.iter().position(|t| t.id.trim().is_empty()) {
            return Err(NexusError::InvalidPlan(format!(
                "task #{} has an empty id",
                blank + 1
            )));
        }
        TaskGraph::from_tasks(self.to_tasks())
    }

    /// Outcome of [`Plan::validate`] as a submission status.
    pub fn submission_status(&self) -> SubmissionStatus {
        match self.validate() {
            Ok(_) => SubmissionStatus::Accepted,
            Err(e) => SubmissionStatus::Rejected {
                reason: e.to_string(),
            },
        }
    }
}

/// Whether a plan was accepted for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// The plan is valid and may be run.
    Accepted,
    /// The plan was refused before any dispatch.
    Rejected {
        /// Why.
        reason: String,
    },
}

impl SubmissionStatus {
    /// True for `Accepted`.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_json_plan_with_aliases() {
        let plan = Plan::from_json(
            r#"{"tasks": [
                {"task_id": "fetch", "task_type": "web", "description": "download"},
                {"id": "parse", "type": "data", "dependencies": ["fetch"],
                 "required_skills": ["data-transform"], "agent_type": "DataAgent"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].id, "fetch");
        assert_eq!(plan.tasks[0].task_type, TaskType::Web);
        assert_eq!(plan.tasks[0].agent_type, "GenericAgent");
        assert_eq!(plan.tasks[1].agent_type, "DataAgent");

        let graph = plan.validate().unwrap();
        assert_eq!(graph.topological_sort().unwrap(), vec!["fetch", "parse"]);
    }

    #[test]
    fn test_toml_plan() {
        let plan = Plan::from_toml(
            r#"
[[tasks]]
id = "build"
type = "code"
description = "compile"

[[tasks]]
id = "ship"
type = "terminal"
dependencies = ["build"]
"#,
        )
        .unwrap();
        assert!(plan.submission_status().is_accepted());
    }

    #[test]
    fn test_unknown_task_type_is_a_parse_error() {
        assert!(Plan::from_json(r#"{"tasks": [{"id": "a", "type": "quantum"}]}"#).is_err());
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(
            Plan::default().validate().unwrap_err(),
            NexusError::InvalidPlan(_)
        ));

        let spec = |id: &str, deps: &[&str]| TaskSpec {
            id: id.to_string(),
            task_type: TaskType::General,
            description: String::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            required_skills: Vec::new(),
            agent_type: default_agent_type(),
        };

        let blank = Plan::new(vec![spec(" ", &[])]);
        assert!(matches!(blank.validate().unwrap_err(), NexusError::InvalidPlan(_)));

        let dup = Plan::new(vec![spec("a", &[]), spec("a", &[])]);
        assert!(matches!(dup.validate().unwrap_err(), NexusError::DuplicateTask(_)));

        let dangling = Plan::new(vec![spec("a", &["missing"])]);
        assert!(matches!(
            dangling.validate().unwrap_err(),
            NexusError::DanglingDependency { .. }
        ));

        let cyclic = Plan::new(vec![spec("a", &["b"]), spec("b", &["a"])]);
        match cyclic.submission_status() {
            SubmissionStatus::Rejected { reason } => assert!(reason.contains("cycl"), "{reason}"),
            SubmissionStatus::Accepted => panic!("cyclic plan accepted"),
        }
    }

    #[test]
    fn test_task_spec_round_trip_through_task() {
        let spec = TaskSpec {
            id: "x".into(),
            task_type: TaskType::File,
            description: "copy".into(),
            dependencies: vec![],
            required_skills: vec!["file-ops".into()],
            agent_type: "FileAgent".into(),
        };
        assert_eq!(TaskSpec::from(&spec.to_task()), spec);
    }
}

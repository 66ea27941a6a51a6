use nexus_core::TaskType;
use std::collections::HashMap;

/// Resolves the skills available for a task type.
///
/// The scheduler calls this once per dispatch and does not cache the answer.
pub trait SkillLookup: Send + Sync {
    /// Skill ids usable for `task_type`, most preferred first.
    fn skills_for(&self, task_type: TaskType) -> Vec<String>;
}

/// Mapping from task-type tag to an ordered list of skill ids.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: HashMap<TaskType, Vec<String>>,
}

impl CapabilityTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The builtin mapping of task types to builtin skills.
    pub fn default_table() -> Self {
        Self::new()
            .with(TaskType::Code, ["code-gen", "file-ops"])
            .with(TaskType::Data, ["data-transform", "file-ops"])
            .with(TaskType::File, ["file-ops"])
            .with(TaskType::Terminal, ["terminal-exec"])
            .with(TaskType::Web, ["web-fetch"])
            .with(TaskType::General, ["code-gen", "terminal-exec"])
    }

    /// Set the skills for one task type, replacing any previous entry.
    pub fn with<I, S>(mut self, task_type: TaskType, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(task_type, skills);
        self
    }

    /// Set the skills for one task type in place.
    pub fn set<I, S>(&mut self, task_type: TaskType, skills: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .insert(task_type, skills.into_iter().map(Into::into).collect());
    }

    /// Skills configured for a task type, in preference order.
    pub fn get(&self, task_type: TaskType) -> &[String] {
        self.entries
            .get(&task_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl SkillLookup for CapabilityTable {
    fn skills_for(&self, task_type: TaskType) -> Vec<String> {
        self.get(task_type).to_vec()
    }
}

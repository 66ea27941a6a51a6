use nexus_core::TaskType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad capability family a skill belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillCategory {
    /// Code generation and editing.
    Code,
    /// Data processing.
    Data,
    /// File system access.
    File,
    /// Shell execution.
    Terminal,
    /// Network fetches.
    Web,
    /// Uncategorized.
    General,
}

impl From<TaskType> for SkillCategory {
    fn from(task_type: TaskType) -> Self {
        match task_type {
            TaskType::Code => SkillCategory::Code,
            TaskType::Data => SkillCategory::Data,
            TaskType::File => SkillCategory::File,
            TaskType::Terminal => SkillCategory::Terminal,
            TaskType::Web => SkillCategory::Web,
            TaskType::General => SkillCategory::General,
        }
    }
}

impl fmt::Display for SkillCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkillCategory::Code => "code",
            SkillCategory::Data => "data",
            SkillCategory::File => "file",
            SkillCategory::Terminal => "terminal",
            SkillCategory::Web => "web",
            SkillCategory::General => "general",
        };
        f.write_str(s)
    }
}

/// Names of the parameters a skill accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameters that must be supplied.
    #[serde(default)]
    pub required: Vec<String>,
    /// Parameters that may be supplied.
    #[serde(default)]
    pub optional: Vec<String>,
}

impl ParameterSchema {
    /// Returns the required parameters missing from `supplied`.
    pub fn missing<'a>(&'a self, supplied: &serde_json::Value) -> Vec<&'a str> {
        self.required
            .iter()
            .filter(|name| supplied.get(name.as_str()).is_none())
            .map(String::as_str)
            .collect()
    }
}

/// A named capability an agent can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    /// Unique skill id, e.g. `file-ops`.
    #[serde(alias = "skill_id")]
    pub id: String,
    /// Display name.
    pub name: String,
    /// What the skill does.
    #[serde(default)]
    pub description: String,
    /// Capability family.
    pub category: SkillCategory,
    /// Semantic version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Disabled skills are never offered to the scheduler.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Parameter names.
    #[serde(default)]
    pub parameters: ParameterSchema,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Skill {
    /// Create an enabled skill with an empty parameter schema.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        category: SkillCategory,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            category,
            version: default_version(),
            enabled: true,
            parameters: ParameterSchema::default(),
        }
    }

    /// Set the parameter schema.
    pub fn with_parameters<R, O>(mut self, required: R, optional: O) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        self.parameters = ParameterSchema {
            required: required.into_iter().map(Into::into).collect(),
            optional: optional.into_iter().map(Into::into).collect(),
        };
        self
    }

    /// Mark the skill enabled or disabled.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Metadata view exposed to observers.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "skill_id": self.id,
            "name": self.name,
            "description": self.description,
            "category": self.category,
            "version": self.version,
            "enabled": self.enabled,
            "parameters": self.parameters,
        })
    }
}

use crate::builtin::builtin_skills;
use crate::lookup::{CapabilityTable, SkillLookup};
use crate::registry::SkillRegistry;
use crate::skill::{Skill, SkillCategory};
use nexus_core::{NexusError, NexusResult, TaskType};
use serde::Deserialize;
use tracing::{info, warn};

/// On-disk skill definition file.
///
/// ```toml
/// [[skills]]
/// id = "csv-loader"
/// name = "CSV Loader"
/// category = "data"
///
/// [skills.parameters]
/// required = ["path"]
///
/// [capabilities]
/// data = ["csv-loader", "data-transform"]
/// ```
#[derive(Debug, Default, Deserialize)]
struct SkillDefinitions {
    #[serde(default)]
    skills: Vec<Skill>,
    #[serde(default)]
    capabilities: std::collections::HashMap<String, Vec<String>>,
}

/// Registry plus capability table: the skill lookup the scheduler consults.
pub struct SkillManager {
    registry: SkillRegistry,
    table: CapabilityTable,
}

impl SkillManager {
    /// Empty registry with the default capability table.
    pub fn new() -> Self {
        Self {
            registry: SkillRegistry::new(),
            table: CapabilityTable::default_table(),
        }
    }

    /// Default table with every builtin skill registered.
    pub fn with_builtins() -> Self {
        let mut manager = Self::new();
        for skill in builtin_skills() {
            manager.registry.register(skill);
        }
        manager
    }

    /// Replace the capability table.
    pub fn with_table(mut self, table: CapabilityTable) -> Self {
        self.table = table;
        self
    }

    /// The underlying registry.
    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    /// Mutable access to the registry.
    pub fn registry_mut(&mut self) -> &mut SkillRegistry {
        &mut self.registry
    }

    /// Look up a skill by id.
    pub fn get_skill(&self, id: &str) -> Option<&Skill> {
        self.registry.get(id)
    }

    /// Register skills and capability mappings from a TOML definition file.
    /// Returns the number of skills registered.
    pub fn load_definitions(&mut self, source: &str) -> NexusResult<usize> {
        let defs: SkillDefinitions = toml::from_str(source)?;
        let count = defs.skills.len();
        for skill in defs.skills {
            self.registry.register(skill);
        }
        for (tag, skills) in defs.capabilities {
            let task_type: TaskType = tag
                .parse()
                .map_err(|_| NexusError::Skill(format!("unknown task type '{tag}' in capabilities")))?;
            self.table.set(task_type, skills);
        }
        info!(count, "Loaded skill definitions");
        Ok(count)
    }
}

impl SkillLookup for SkillManager {
    /// Table entries that are registered and enabled; when none are, enabled
    /// skills of the matching category.
    fn skills_for(&self, task_type: TaskType) -> Vec<String> {
        let from_table: Vec<String> = self
            .table
            .get(task_type)
            .iter()
            .filter(|id| self.registry.is_enabled(id))
            .cloned()
            .collect();
        if !from_table.is_empty() {
            return from_table;
        }

        let category = SkillCategory::from(task_type);
        let fallback: Vec<String> = self
            .registry
            .list_by_category(category)
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| s.id.clone())
            .collect();
        if fallback.is_empty() {
            warn!(task_type = %task_type, "No enabled skill for task type");
        }
        fallback
    }
}

impl Default for SkillManager {
    fn default() -> Self {
        Self::new()
    }
}

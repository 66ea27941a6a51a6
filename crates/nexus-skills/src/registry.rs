use crate::skill::{Skill, SkillCategory};
use std::collections::HashMap;
use tracing::{debug, info};

/// Central registry for all known skills.
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            skills: HashMap::new(),
        }
    }

    /// Register a skill, replacing any previous skill with the same id.
    pub fn register(&mut self, skill: Skill) {
        info!(skill = %skill.id, category = %skill.category, "Registered skill");
        self.skills.insert(skill.id.clone(), skill);
    }

    /// Remove a skill. Returns it if it was registered.
    pub fn unregister(&mut self, id: &str) -> Option<Skill> {
        let removed = self.skills.remove(id);
        if removed.is_some() {
            debug!(skill = %id, "Unregistered skill");
        }
        removed
    }

    /// Look up a skill by id.
    pub fn get(&self, id: &str) -> Option<&Skill> {
        self.skills.get(id)
    }

    /// Whether a skill is registered and enabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.skills.get(id).is_some_and(|s| s.enabled)
    }

    /// All skills, sorted by id.
    pub fn list(&self) -> Vec<&Skill> {
        let mut skills: Vec<&Skill> = self.skills.values().collect();
        skills.sort_by(|a, b| a.id.cmp(&b.id));
        skills
    }

    /// Skills of one category, sorted by id.
    pub fn list_by_category(&self, category: SkillCategory) -> Vec<&Skill> {
        self.list()
            .into_iter()
            .filter(|s| s.category == category)
            .collect()
    }

    /// Enabled skills, sorted by id.
    pub fn list_enabled(&self) -> Vec<&Skill> {
        self.list().into_iter().filter(|s| s.enabled).collect()
    }

    /// Number of registered skills.
    pub fn len(&self) -> usize {
        self.skills.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

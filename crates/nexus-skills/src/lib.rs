//! Skill catalog and capability lookup for the Nexus orchestrator.
//!
//! The scheduler only needs [`SkillLookup::skills_for`]; the registry and
//! definition loading exist so deployments can describe what their agents
//! can do.

/// Builtin skill descriptors.
pub mod builtin;
/// Capability lookup contract and table.
pub mod lookup;
/// Registry plus table.
pub mod manager;
/// Skill registry.
pub mod registry;
/// Skill entity.
pub mod skill;

pub use builtin::builtin_skills;
pub use lookup::{CapabilityTable, SkillLookup};
pub use manager::SkillManager;
pub use registry::SkillRegistry;
pub use skill::{ParameterSchema, Skill, SkillCategory};

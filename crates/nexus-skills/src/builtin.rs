use crate::skill::{Skill, SkillCategory};

/// Descriptors for the skills shipped with Nexus.
pub fn builtin_skills() -> Vec<Skill> {
    vec![
        file_ops(),
        terminal_exec(),
        Skill::new(
            "code-gen",
            "Code Generation",
            "Generate or modify source code from a description",
            SkillCategory::Code,
        )
        .with_parameters(["language", "instructions"], ["target_path"]),
        Skill::new(
            "data-transform",
            "Data Transform",
            "Load, transform, and write tabular data",
            SkillCategory::Data,
        )
        .with_parameters(["input"], ["output", "format"]),
        Skill::new(
            "web-fetch",
            "Web Fetch",
            "Fetch a URL and return its body",
            SkillCategory::Web,
        )
        .with_parameters(["url"], ["method", "headers"]),
    ]
}

/// Read, write, and list files inside the sandbox.
pub fn file_ops() -> Skill {
    Skill::new(
        "file-ops",
        "File Operations",
        "Read, write, and list files inside the sandbox",
        SkillCategory::File,
    )
    .with_parameters(["operation", "path"], ["content"])
}

/// Run a shell command inside the sandbox.
pub fn terminal_exec() -> Skill {
    Skill::new(
        "terminal-exec",
        "Terminal Execution",
        "Run a shell command inside the sandbox",
        SkillCategory::Terminal,
    )
    .with_parameters(["command"], ["cwd", "timeout"])
}

//! `nexus` command-line front end.

use anyhow::Context;
use clap::{Parser, Subcommand};
use nexus_blackboard::Blackboard;
use nexus_core::{EventKind, TaskType};
use nexus_orchestrator::{
    EchoExecutor, LocalDispatcher, LoggingConfig, Orchestrator, Plan, SessionReport, Settings,
    SubmissionStatus, TaskGraph,
};
use nexus_skills::{SkillLookup, SkillManager};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nexus", version, about = "Nexus — multi-agent task orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "NEXUS_CONFIG_FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a plan without running it
    Validate {
        /// Plan file (.json or .toml)
        plan: PathBuf,
    },
    /// Print the dispatch order and the ready waves of a plan
    Order {
        /// Plan file (.json or .toml)
        plan: PathBuf,
    },
    /// Print the effective configuration
    Config,
    /// List skills and the task-type mapping
    Skills {
        /// Extra skill definition file
        #[arg(long)]
        definitions: Option<PathBuf>,
    },
    /// Run a plan in memory with an echo agent and print every event
    DryRun {
        /// Plan file (.json or .toml)
        plan: PathBuf,
        /// Extra skill definition file
        #[arg(long)]
        definitions: Option<PathBuf>,
    },
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_plan(path: &Path) -> anyhow::Result<Plan> {
    Plan::from_path(path).with_context(|| format!("Failed to read plan '{}'", path.display()))
}

fn load_skills(definitions: Option<&Path>) -> anyhow::Result<SkillManager> {
    let mut manager = SkillManager::with_builtins();
    if let Some(path) = definitions {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read skill definitions '{}'", path.display()))?;
        manager.load_definitions(&source)?;
    }
    Ok(manager)
}

fn render_status(status: &SubmissionStatus) -> String {
    match status {
        SubmissionStatus::Accepted => "accepted".to_string(),
        SubmissionStatus::Rejected { reason } => format!("rejected: {reason}"),
    }
}

fn render_order(graph: &TaskGraph) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "Dispatch order:")?;
    for (i, id) in graph.topological_sort()?.iter().enumerate() {
        writeln!(out, "  {}. {id}", i + 1)?;
    }
    writeln!(out, "Ready waves:")?;
    for (i, wave) in graph.ready_waves()?.iter().enumerate() {
        writeln!(out, "  wave {}: {}", i + 1, wave.join(", "))?;
    }
    Ok(out)
}

fn render_skills(manager: &SkillManager) -> anyhow::Result<String> {
    let mut out = String::new();
    let skills = manager.registry().list();
    if skills.is_empty() {
        writeln!(out, "No skills registered.")?;
    } else {
        writeln!(out, "Registered skills:")?;
        for skill in &skills {
            let state = if skill.enabled { "" } else { " (disabled)" };
            writeln!(
                out,
                "  {} [{}] — {}{state}",
                skill.id, skill.category, skill.description
            )?;
        }
    }
    writeln!(out, "Task types:")?;
    for task_type in TaskType::ALL {
        writeln!(
            out,
            "  {}: {}",
            task_type.as_str(),
            manager.skills_for(task_type).join(", ")
        )?;
    }
    write!(out, "\nTotal: {} skill(s)", skills.len())?;
    Ok(out)
}

fn is_session_end(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::SessionCompleted | EventKind::SessionFailed | EventKind::SessionCancelled
    )
}

async fn dry_run(
    settings: Settings,
    plan: &Plan,
    skills: SkillManager,
) -> anyhow::Result<SessionReport> {
    let blackboard = Blackboard::in_memory();
    let orchestrator = Orchestrator::new(
        settings,
        blackboard.clone(),
        Arc::new(LocalDispatcher::with_default(Arc::new(EchoExecutor))),
        Arc::new(skills),
    );

    let session_id = uuid::Uuid::new_v4().to_string();
    let mut events = blackboard.subscribe(&session_id).await?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "Could not render event"),
            }
            if is_session_end(event.kind) {
                break;
            }
        }
    });

    let report = orchestrator.run_as(session_id, plan).await?;
    if tokio::time::timeout(Duration::from_secs(1), printer)
        .await
        .is_err()
    {
        tracing::warn!("Event printer did not see the end of the session");
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    init_logging(&settings.logging);
    info!(
        worker_id = ?settings.cluster.worker_id,
        max_parallel_agents = settings.cluster.max_parallel_agents,
        "Nexus starting"
    );

    match cli.command {
        Commands::Validate { plan } => {
            let plan = load_plan(&plan)?;
            let status = plan.submission_status();
            println!("{}", render_status(&status));
            if !status.is_accepted() {
                anyhow::bail!("plan rejected");
            }
        }
        Commands::Order { plan } => {
            let graph = load_plan(&plan)?.validate()?;
            print!("{}", render_order(&graph)?);
        }
        Commands::Config => {
            print!("{}", settings.to_toml()?);
        }
        Commands::Skills { definitions } => {
            let manager = load_skills(definitions.as_deref())?;
            println!("{}", render_skills(&manager)?);
        }
        Commands::DryRun { plan, definitions } => {
            let plan = load_plan(&plan)?;
            let skills = load_skills(definitions.as_deref())?;
            let report = dry_run(settings, &plan, skills).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status != nexus_core::SessionStatus::Completed {
                anyhow::bail!("{}", report.summary);
            }
        }
    }

    Ok(())
}

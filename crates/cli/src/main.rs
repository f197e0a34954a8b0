//! `flowline` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — validate a workflow definition JSON file.
//! - `run`      — execute a workflow file locally against mock collaborators.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use agents::mock::{InMemoryEventSource, KeyEvaluator, MockAgent, MockHttp, MockScript};
use engine::{
    dag, Collaborators, EngineConfig, NewWorkflow, StartMode, Workflow, WorkflowEngine,
};

#[derive(Parser)]
#[command(
    name = "flowline",
    about = "Workflow orchestration engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: std::path::PathBuf,
    },
    /// Execute a workflow file locally. Agent, HTTP and script steps run
    /// against built-in mocks, so this exercises orchestration only.
    Run {
        /// Path to the workflow JSON file.
        path: std::path::PathBuf,
        /// Input parameters as a JSON object.
        #[arg(long)]
        params: Option<String>,
    },
}

fn load(path: &std::path::Path) -> anyhow::Result<NewWorkflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).context("invalid workflow JSON")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let new = load(&path)?;
            let workflow = Workflow::new(new.name, new.description, new.steps, new.triggers);
            match dag::validate(&workflow) {
                Ok(()) => {
                    println!("✅ Workflow is valid ({} top-level steps)", workflow.steps.len());
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Run { path, params } => {
            let new = load(&path)?;
            let params = match params {
                Some(raw) => serde_json::from_str(&raw).context("invalid --params JSON")?,
                None => serde_json::json!({}),
            };

            let engine = WorkflowEngine::new(
                Collaborators {
                    agents: Arc::new(MockAgent::returning(serde_json::json!({ "ok": true }))),
                    evaluator: Arc::new(KeyEvaluator),
                    http: Arc::new(MockHttp::returning(serde_json::json!(null))),
                    scripts: Arc::new(MockScript),
                    events: Arc::new(InMemoryEventSource::new()),
                },
                EngineConfig::default(),
            );

            let workflow = engine
                .create_workflow(new)
                .context("workflow rejected")?;
            info!(workflow_id = %workflow.id, "running workflow");

            let run = engine
                .start(workflow.id, params, StartMode::Sync)
                .await
                .context("run failed to start")?;

            println!("Run {} finished: {:?}", run.id, run.status);
            println!("{}", serde_json::to_string_pretty(&run)?);
            if !run.errors.is_empty() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

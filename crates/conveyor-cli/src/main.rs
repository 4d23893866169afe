//! Conveyor CLI.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor continuous-deployment orchestrator", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CONVEYOR_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to the pipeline file
        #[arg(default_value = "conveyor.kdl")]
        path: PathBuf,
    },
    /// Run a pipeline locally against a ref
    Run(RunArgs),
    /// Check whether an event would start a run
    TriggerCheck {
        /// Path to the pipeline file
        #[arg(default_value = "conveyor.kdl")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,
    },
}

/// The ref an event points at.
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Branch the event was pushed to
    #[arg(long, conflicts_with = "tag", required_unless_present = "tag")]
    pub branch: Option<String>,

    /// Tag the event was pushed to
    #[arg(long)]
    pub tag: Option<String>,

    /// Paths changed by the event (repeatable)
    #[arg(long = "changed", value_name = "PATH")]
    pub changed: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the pipeline file
    #[arg(default_value = "conveyor.kdl")]
    pub path: PathBuf,

    #[command(flatten)]
    pub event: EventArgs,

    /// Repository checkout copied into the run workspace
    /// (defaults to the pipeline file's directory)
    #[arg(long, value_name = "DIR")]
    pub source: Option<PathBuf>,

    /// System configuration file
    #[arg(long, env = "CONVEYOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for run workspaces
    #[arg(long, env = "CONVEYOR_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Default step timeout in seconds
    #[arg(long, env = "CONVEYOR_STEP_TIMEOUT")]
    pub step_timeout: Option<u64>,

    /// Print the finished run as JSON
    #[arg(long)]
    pub json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Run(args) => {
            commands::run::run_local(args).await?;
        }
        Commands::TriggerCheck { path, event } => {
            commands::trigger::check(&path, &event)?;
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod cmd;

#[derive(Parser)]
#[command(name = "stageforge")]
#[command(version, about = "Staged milestone orchestrator for coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new stageforge project
    Init,
    /// Run or resume orchestration of all stages
    Run {
        /// Maximum concurrent milestone pipelines
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Branch milestones merge into (defaults to the current branch)
        #[arg(long)]
        base_branch: Option<String>,

        /// Milestone list to use instead of .stageforge/milestones.json
        #[arg(long)]
        milestones: Option<PathBuf>,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// List milestones grouped by stage
    List,
    /// Show checkpoint progress and rate-limit state
    Status,
    /// Discard recorded progress
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// Remove stale milestone workspaces
    Cleanup {
        /// Remove every managed workspace, not just stale ones
        #[arg(long)]
        all: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default stageforge.toml file
    Init,
}

/// File logging is only set up for runs of an initialized project.
fn init_logging(cli: &Cli, project_dir: &Path) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use stageforge::config::STATE_DIR;
    use stageforge::settings::Settings;

    let state_dir = project_dir.join(STATE_DIR);
    let (log_dir, json) = match &cli.command {
        Commands::Run { .. } if state_dir.is_dir() => {
            let json = Settings::load_or_default(&state_dir)
                .map(|s| s.logging.json)
                .unwrap_or(false);
            (Some(state_dir.join("logs")), json)
        }
        _ => (None, false),
    };
    stageforge::logging::init_logging(cli.verbose, json, log_dir.as_deref())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _log_guard = init_logging(&cli, &project_dir)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run {
            max_parallel,
            base_branch,
            milestones,
            ui,
        } => {
            let args = cmd::RunArgs {
                max_parallel: *max_parallel,
                base_branch: base_branch.clone(),
                milestones: milestones.clone(),
                ui: ui.clone(),
            };
            cmd::cmd_run(project_dir, &cli, args).await?;
        }
        Commands::List => cmd::cmd_list(&project_dir, &cli)?,
        Commands::Status => cmd::cmd_status(&project_dir, &cli)?,
        Commands::Reset { force } => cmd::cmd_reset(&project_dir, &cli, *force)?,
        Commands::Cleanup { all } => cmd::cmd_cleanup(&project_dir, &cli, *all).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}

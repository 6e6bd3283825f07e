//! Staged milestone orchestration — `stageforge run`.

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{info, warn};

use stageforge::config::Config;
use stageforge::errors::OrchestratorError;
use stageforge::progress::{OrchestratorEvent, ProgressHub, render_markdown};
use stageforge::settings::CliOverrides;
use stageforge::ui::{StageUI, UiMode};

use super::super::Cli;

const REPORTER_DRAIN: std::time::Duration = std::time::Duration::from_secs(5);

pub struct RunArgs {
    pub max_parallel: Option<usize>,
    pub base_branch: Option<String>,
    pub milestones: Option<PathBuf>,
    pub ui: String,
}

/// Exclusive lock on `.stageforge/orchestrator.lock`, released on drop.
fn acquire_run_lock(path: &Path) -> Result<File> {
    use fs2::FileExt;

    let file = File::create(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
    if file.try_lock_exclusive().is_err() {
        bail!(
            "Another stageforge run holds {}. Wait for it to finish or stop it first.",
            path.display()
        );
    }
    Ok(file)
}

fn write_progress_file(path: &Path, markdown: &str) {
    if let Err(e) = std::fs::write(path, markdown) {
        warn!(path = %path.display(), error = %e, "Failed to write progress file");
    }
}

/// Render events and keep PROGRESS.md current until the hub goes away.
fn spawn_reporter(
    mut rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
    hub: Weak<ProgressHub>,
    mut ui: StageUI,
    progress_file: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            ui.handle_event(&event);
            let Some(hub) = hub.upgrade() else {
                continue;
            };
            let snapshot = hub.snapshot().await;
            write_progress_file(&progress_file, &render_markdown(&snapshot));
        }
        ui.finish();
    })
}

pub async fn cmd_run(project_dir: PathBuf, cli: &Cli, args: RunArgs) -> Result<()> {
    use stageforge::agent::ClaudeAgent;
    use stageforge::checkpoint::CheckpointStore;
    use stageforge::milestone::MilestonesFile;
    use stageforge::monitor::ResourceMonitor;
    use stageforge::orchestrator::{Collaborators, Orchestrator};
    use stageforge::retry::{RateLimitController, SystemClock};
    use stageforge::review::AgentReviewer;

    let overrides = CliOverrides {
        max_parallel: args.max_parallel,
        base_branch: args.base_branch.clone(),
    };
    let config = Config::new(project_dir, cli.verbose, &overrides)?;
    if !config.is_initialized() {
        bail!("Project not initialized. Run 'stageforge init' first, then describe your milestones.");
    }
    for warning in config.settings.validate() {
        warn!("{}", warning);
    }
    config.ensure_directories()?;
    let _lock = acquire_run_lock(&config.lock_file)?;

    let milestones_path = config.milestones_file(args.milestones.as_deref())?;
    let milestones = MilestonesFile::load(&milestones_path)?.into_milestones()?;
    if milestones.is_empty() {
        bail!("{} lists no milestones", milestones_path.display());
    }

    let settings = &config.settings;
    let checkpoint = Arc::new(CheckpointStore::open(&config.checkpoint_file)?);
    let initial = checkpoint.snapshot().await;
    let limiter = Arc::new(RateLimitController::with_store(
        settings.retry_policy(),
        Arc::new(SystemClock),
        config.retry_state_file.clone(),
    )?);
    let agent = Arc::new(ClaudeAgent::new(
        settings.agent.command.clone(),
        settings.agent.skip_permissions,
        &settings.agent.extra_args,
    ));
    let reviewer = Arc::new(AgentReviewer::new(agent.clone(), settings.review.resolve_todos));
    let base_branch = config.base_branch();

    let (tx, rx) = mpsc::unbounded_channel();
    let progress = Arc::new(ProgressHub::with_event_channel(tx));
    let done = milestones
        .keys()
        .filter(|id| initial.is_completed(id))
        .count();
    let ui = StageUI::new(milestones.len(), done, args.ui.parse().unwrap_or(UiMode::Full), cli.verbose);
    let reporter = spawn_reporter(
        rx,
        Arc::downgrade(&progress),
        ui,
        config.progress_file.clone(),
    );

    info!(
        milestones = milestones.len(),
        base = %base_branch,
        max_parallel = settings.execution.max_parallel_tasks,
        "Starting run"
    );

    let mut orchestrator = Orchestrator::new(
        settings.engine_config(),
        milestones,
        Collaborators {
            vcs: Arc::new(config.git_workspaces()),
            base_ref: base_branch,
            agent,
            reviewer,
            limiter,
            checkpoint,
            progress: progress.clone(),
        },
    );
    if settings.monitor.enabled {
        orchestrator = orchestrator.with_monitor(Arc::new(ResourceMonitor::new(
            settings.resource_thresholds(),
            config.project_dir.clone(),
        )));
    }

    let outcome = tokio::select! {
        result = orchestrator.run() => result,
        _ = tokio::signal::ctrl_c() => Err(OrchestratorError::Interrupted),
    };

    write_progress_file(&config.progress_file, &render_markdown(&progress.snapshot().await));
    drop(orchestrator);
    drop(progress);
    if matches!(outcome, Err(OrchestratorError::Interrupted)) {
        // Pipelines still hold the hub; don't wait for them.
        reporter.abort();
    } else if tokio::time::timeout(REPORTER_DRAIN, reporter).await.is_err() {
        warn!("Progress reporter did not drain in time");
    }

    match outcome {
        Ok(summary) => {
            println!();
            if summary.stages.is_empty() {
                println!("Nothing to do: every stage is already complete.");
            } else {
                let stages: Vec<String> = summary.stages.iter().map(ToString::to_string).collect();
                println!(
                    "{} Completed stage(s) {}; merged {} milestone(s).",
                    console::style("✓").green(),
                    stages.join(", "),
                    summary.merged.len()
                );
            }
            if summary.pruned > 0 {
                println!("Removed {} stale workspace(s).", summary.pruned);
            }
            Ok(())
        }
        Err(OrchestratorError::Interrupted) => {
            println!();
            println!("Interrupted. Run 'stageforge run' again to resume.");
            Err(OrchestratorError::Interrupted.into())
        }
        Err(e) => {
            println!();
            println!("{} {}", console::style("✗").red(), e);
            println!("Progress: {}", config.progress_file.display());
            Err(e.into())
        }
    }
}

//! Milestone listing, status, reset and workspace cleanup commands.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use stageforge::config::Config;
use stageforge::settings::CliOverrides;

use super::super::Cli;

fn load_config(project_dir: &Path, cli: &Cli) -> Result<Option<Config>> {
    let config = Config::new(project_dir.to_path_buf(), cli.verbose, &CliOverrides::default())?;
    if !config.is_initialized() {
        println!();
        println!("No milestones found. Run 'stageforge init' first to initialize the project.");
        println!();
        return Ok(None);
    }
    Ok(Some(config))
}

fn status_label(status: stageforge::milestone::MilestoneStatus) -> String {
    use stageforge::milestone::MilestoneStatus;

    let label = status.to_string();
    match status {
        MilestoneStatus::Completed => style(label).green().to_string(),
        MilestoneStatus::Failed => style(label).red().to_string(),
        MilestoneStatus::Pending => style(label).dim().to_string(),
        _ => style(label).yellow().to_string(),
    }
}

pub fn cmd_list(project_dir: &Path, cli: &Cli) -> Result<()> {
    use stageforge::milestone::MilestonesFile;

    let Some(config) = load_config(project_dir, cli)? else {
        return Ok(());
    };
    let path = config.milestones_file(None)?;
    let milestones = MilestonesFile::load(&path)?.into_milestones()?;

    println!();
    println!("Milestones loaded from: {}", path.display());

    let mut current_stage = None;
    for milestone in milestones.values() {
        if current_stage != Some(milestone.id.stage) {
            current_stage = Some(milestone.id.stage);
            println!();
            println!("{}", style(format!("Stage {}", milestone.id.stage)).bold());
            println!("  {:<6} {:<6} {:<12} Title", "Id", "Tasks", "Depends on");
            println!("  {:<6} {:<6} {:<12} -----", "------", "-----", "----------");
        }
        let deps: Vec<String> = milestone
            .dependencies
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "  {:<6} {:<6} {:<12} {}",
            milestone.id.to_string(),
            milestone.tasks.len(),
            if deps.is_empty() { "-".to_string() } else { deps.join(",") },
            milestone.title
        );
    }
    println!();

    let stages = milestones
        .keys()
        .map(|id| id.stage)
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    println!("{} milestones in {} stage(s)", milestones.len(), stages);
    println!();
    Ok(())
}

pub fn cmd_status(project_dir: &Path, cli: &Cli) -> Result<()> {
    use stageforge::checkpoint::CheckpointStore;
    use stageforge::milestone::{MilestoneStatus, MilestonesFile};
    use stageforge::retry::{CallClass, RetryState, ThrottleState};

    let Some(config) = load_config(project_dir, cli)? else {
        return Ok(());
    };

    let Some(checkpoint) = CheckpointStore::read(&config.checkpoint_file)? else {
        println!();
        println!("No run recorded yet. Use 'stageforge run' to start.");
        println!();
        return Ok(());
    };

    println!();
    println!("Stageforge Status");
    println!("=================");
    if let Some(run_id) = checkpoint.run_id {
        println!("Last run:      {}", run_id);
    }
    if let Some(updated) = checkpoint.updated_at {
        println!("Updated:       {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(stage) = checkpoint.current_stage {
        println!("Current stage: {}", stage);
    }
    let completed_stages: Vec<String> = checkpoint
        .completed_stages
        .iter()
        .map(ToString::to_string)
        .collect();
    println!(
        "Stages done:   {}",
        if completed_stages.is_empty() { "none".to_string() } else { completed_stages.join(", ") }
    );

    if let Ok(path) = config.milestones_file(None) {
        let milestones = MilestonesFile::load(&path)?.into_milestones()?;
        println!();
        println!("  {:<6} {:<18} {:<6} {:<7} Title", "Id", "Status", "Tasks", "Merged");
        for milestone in milestones.values() {
            let status = checkpoint.status_of(&milestone.id);
            let tasks_done = if status == MilestoneStatus::Completed {
                milestone.tasks.len()
            } else {
                milestone.tasks_done()
            };
            println!(
                "  {:<6} {:<18} {:<6} {:<7} {}",
                milestone.id.to_string(),
                status_label(status),
                format!("{}/{}", tasks_done, milestone.tasks.len()),
                if checkpoint.is_merged(&milestone.id) { "yes" } else { "-" },
                milestone.title
            );
            if let Some(reason) = checkpoint.failed.get(&milestone.id) {
                println!("         {}", style(reason).red());
                let review = checkpoint.reviews.get(&milestone.id).filter(|r| !r.passed());
                if let Some(review) = review {
                    println!("         last review: score {:.2}", review.score());
                    for issue in review.issues() {
                        println!("           - {}", issue);
                    }
                }
            }
        }
        println!();
        println!(
            "{}/{} milestones completed",
            checkpoint.completed.len(),
            milestones.len()
        );
    }

    let retry = RetryState::load(&config.retry_state_file)?;
    println!();
    println!("Rate limits:");
    for class in [CallClass::Agent, CallClass::Review] {
        let state = retry.class(class);
        let detail = match state.state {
            ThrottleState::Normal => style("normal").green().to_string(),
            other => format!(
                "{} ({} consecutive, backoff {}s)",
                style(other).yellow(),
                state.consecutive_failures,
                state.backoff().as_secs()
            ),
        };
        println!("  {:<7} {}", class.to_string(), detail);
    }
    println!();
    Ok(())
}

pub fn cmd_reset(project_dir: &Path, cli: &Cli, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let Some(config) = load_config(project_dir, cli)? else {
        return Ok(());
    };

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will reset all progress. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    for path in [
        &config.checkpoint_file,
        &config.retry_state_file,
        &config.progress_file,
    ] {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }
    println!("Progress reset. Workspaces are kept; use 'stageforge cleanup --all' to remove them.");
    Ok(())
}

pub async fn cmd_cleanup(project_dir: &Path, cli: &Cli, all: bool) -> Result<()> {
    use stageforge::checkpoint::CheckpointStore;
    use stageforge::milestone::MilestonesFile;
    use stageforge::workspace::WorkspaceManager;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    let Some(config) = load_config(project_dir, cli)? else {
        return Ok(());
    };
    let workspaces = WorkspaceManager::new(Arc::new(config.git_workspaces()), config.base_branch());

    let removed = if all {
        workspaces.destroy_all().await?
    } else {
        let path = config
            .milestones_file(None)
            .context("Cannot tell stale workspaces apart without a milestones file; use --all")?;
        let merged = CheckpointStore::read(&config.checkpoint_file)?
            .map(|cp| cp.merged)
            .unwrap_or_default();
        let tracked: BTreeSet<_> = MilestonesFile::load(&path)?
            .into_milestones()?
            .into_keys()
            .filter(|id| !merged.contains(id))
            .collect();
        workspaces.prune_stale(&tracked).await?
    };

    if removed.is_empty() {
        println!("No workspaces to remove.");
    } else {
        for workspace in &removed {
            println!("  removed {} ({})", workspace.milestone, workspace.path.display());
        }
        println!("Removed {} workspace(s).", removed.len());
    }
    Ok(())
}

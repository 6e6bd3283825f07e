//! `stageforge init`: create the state directory.
//!
//! ```text
//! .stageforge/
//! ├── stageforge.toml   # Settings (see `settings`)
//! ├── milestones.json   # Sample milestone list, edit before `run`
//! ├── .gitignore        # Keeps engine state out of commits
//! ├── logs/
//! └── worktrees/        # One git worktree per in-flight milestone
//! ```
//!
//! Existing files are never overwritten.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::STATE_DIR;
use crate::milestone::{MilestoneEntry, MilestoneId, MilestonesFile, Task, TaskPriority};
use crate::settings::{DEFAULT_TEMPLATE, SETTINGS_FILE};

#[derive(Debug)]
pub struct InitResult {
    pub state_dir: PathBuf,
    /// False when the directory already existed.
    pub created: bool,
    pub wrote_settings: bool,
    pub wrote_milestones: bool,
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(STATE_DIR).is_dir()
}

pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let state_dir = project_dir.join(STATE_DIR);
    let created = !state_dir.exists();

    for dir in [state_dir.join("logs"), state_dir.join("worktrees")] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    write_if_missing(&state_dir.join(".gitignore"), "*\n")?;
    let wrote_settings = write_if_missing(&state_dir.join(SETTINGS_FILE), DEFAULT_TEMPLATE)?;

    let milestones_path = state_dir.join("milestones.json");
    let has_milestones = ["milestones.json", "milestones.yaml", "milestones.yml"]
        .iter()
        .any(|name| state_dir.join(name).exists());
    let wrote_milestones = if has_milestones {
        false
    } else {
        sample_milestones().save(&milestones_path)?;
        true
    };

    Ok(InitResult {
        state_dir,
        created,
        wrote_settings,
        wrote_milestones,
    })
}

fn write_if_missing(path: &Path, content: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// Two-stage example: stage 2 builds on both stage 1 milestones.
pub fn sample_milestones() -> MilestonesFile {
    let entry = |stage, ordinal, title: &str, tasks: Vec<Task>, deps: Vec<MilestoneId>| {
        MilestoneEntry {
            stage,
            ordinal,
            title: title.to_string(),
            tasks,
            dependencies: deps,
        }
    };
    MilestonesFile {
        milestones: vec![
            entry(
                1,
                1,
                "Project skeleton",
                vec![
                    Task::new("Create the crate layout and a README", TaskPriority::High),
                    Task::new("Add a CI workflow that runs the tests", TaskPriority::Medium),
                ],
                vec![],
            ),
            entry(
                1,
                2,
                "Configuration loading",
                vec![Task::new(
                    "Read settings from a TOML file with defaults",
                    TaskPriority::High,
                )],
                vec![],
            ),
            entry(
                2,
                1,
                "Command line interface",
                vec![Task::new(
                    "Expose the configured operations as subcommands",
                    TaskPriority::Medium,
                )],
                vec![MilestoneId::new(1, 1), MilestoneId::new(1, 2)],
            ),
        ],
    }
}

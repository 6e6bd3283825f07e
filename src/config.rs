use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::settings::{CliOverrides, SETTINGS_FILE, Settings};
use crate::workspace::GitWorkspaces;

pub const STATE_DIR: &str = ".stageforge";

/// Milestone list names tried in order when none is given explicitly.
const MILESTONE_FILES: [&str; 3] = ["milestones.json", "milestones.yaml", "milestones.yml"];

/// Runtime configuration: resolved settings plus every path the engine
/// reads or writes under `<project>/.stageforge/`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub settings_file: PathBuf,
    pub checkpoint_file: PathBuf,
    pub retry_state_file: PathBuf,
    pub log_dir: PathBuf,
    pub progress_file: PathBuf,
    pub lock_file: PathBuf,
    pub settings: Settings,
    pub verbose: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool, cli: &CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let settings = Settings::resolve(&state_dir, cli)?;

        Ok(Self {
            settings_file: state_dir.join(SETTINGS_FILE),
            checkpoint_file: state_dir.join("checkpoint.json"),
            retry_state_file: state_dir.join("retry_state.json"),
            log_dir: state_dir.join("logs"),
            progress_file: state_dir.join("PROGRESS.md"),
            lock_file: state_dir.join("orchestrator.lock"),
            project_dir,
            state_dir,
            settings,
            verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(self.worktree_root())
            .context("Failed to create worktree directory")?;
        // Keep engine state out of milestone commits.
        let ignore = self.state_dir.join(".gitignore");
        if !ignore.exists() {
            std::fs::write(&ignore, "*\n").context("Failed to write .stageforge/.gitignore")?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.is_dir()
    }

    pub fn worktree_root(&self) -> PathBuf {
        self.project_dir.join(&self.settings.git.worktree_dir)
    }

    /// Explicit base branch, else whatever is checked out.
    pub fn base_branch(&self) -> String {
        self.settings
            .git
            .base_branch
            .clone()
            .unwrap_or_else(|| GitWorkspaces::current_branch(&self.project_dir))
    }

    /// The milestone list: `explicit` when given, else the first of
    /// `milestones.{json,yaml,yml}` found in the state directory.
    pub fn milestones_file(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Milestones file not found: {}", path.display());
            }
            return Ok(path.to_path_buf());
        }
        MILESTONE_FILES
            .iter()
            .map(|name| self.state_dir.join(name))
            .find(|p| p.exists())
            .with_context(|| {
                format!(
                    "No milestones file in {}. Run 'stageforge init' or pass --milestones.",
                    self.state_dir.display()
                )
            })
    }

    pub fn git_workspaces(&self) -> GitWorkspaces {
        GitWorkspaces::new(
            self.project_dir.clone(),
            self.worktree_root(),
            self.settings.git.branch_prefix.clone(),
        )
    }
}

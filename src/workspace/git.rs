//! Git worktree backend.
//!
//! Worktree creation, merge and removal shell out to the `git` CLI; commits
//! and health checks go through `git2`.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{IndexAddOption, Repository, Signature};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{MergeResult, VcsBackend, WorkspaceHealth, WorkspaceRef};
use crate::milestone::MilestoneId;

const DIR_PREFIX: &str = "milestone-";
const AUTHOR_NAME: &str = "stageforge";
const AUTHOR_EMAIL: &str = "stageforge@localhost";

/// Workspaces as git worktrees under `worktree_root`, one branch each.
#[derive(Debug, Clone)]
pub struct GitWorkspaces {
    repo_dir: PathBuf,
    worktree_root: PathBuf,
    branch_prefix: String,
}

impl GitWorkspaces {
    pub fn new(repo_dir: PathBuf, worktree_root: PathBuf, branch_prefix: impl Into<String>) -> Self {
        Self {
            repo_dir,
            worktree_root,
            branch_prefix: branch_prefix.into(),
        }
    }

    /// Branch checked out in `repo_dir`, falling back to "main" when HEAD is detached or unborn.
    pub fn current_branch(repo_dir: &Path) -> String {
        Repository::open(repo_dir)
            .ok()
            .and_then(|repo| {
                repo.head()
                    .ok()
                    .and_then(|head| head.shorthand().map(String::from))
            })
            .filter(|name| name != "HEAD")
            .unwrap_or_else(|| "main".to_string())
    }

    fn workspace_for(&self, milestone: MilestoneId) -> WorkspaceRef {
        WorkspaceRef {
            milestone,
            branch: format!("{}{}", self.branch_prefix, milestone.slug()),
            path: self
                .worktree_root
                .join(format!("{}{}", DIR_PREFIX, milestone.slug())),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output> {
        debug!(dir = %dir.display(), args = ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.git(dir, args).await?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn conflicted_paths(&self) -> Result<Vec<PathBuf>> {
        let out = self
            .git_ok(&self.repo_dir, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

/// Stage every change (including deletions) and commit when the tree moved.
fn commit_all(dir: &Path, message: &str, allow_empty: bool) -> Result<Option<String>> {
    let repo = Repository::open(dir)
        .with_context(|| format!("Failed to open repository at {}", dir.display()))?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());

    if !allow_empty
        && let Some(parent) = &parent
        && parent.tree_id() == tree_id
    {
        return Ok(None);
    }

    let sig = Signature::now(AUTHOR_NAME, AUTHOR_EMAIL)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(Some(oid.to_string()))
}

#[async_trait]
impl VcsBackend for GitWorkspaces {
    async fn create_isolated_workspace(
        &self,
        milestone: MilestoneId,
        base_ref: &str,
    ) -> Result<WorkspaceRef> {
        let workspace = self.workspace_for(milestone);
        if workspace.path.exists() {
            bail!("Workspace directory already exists: {}", workspace.path.display());
        }
        tokio::fs::create_dir_all(&self.worktree_root)
            .await
            .with_context(|| format!("Failed to create {}", self.worktree_root.display()))?;

        let path = workspace
            .path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        self.git_ok(
            &self.repo_dir,
            &["worktree", "add", "-b", &workspace.branch, path, base_ref],
        )
        .await
        .context("Git worktree creation failed")?;

        Ok(workspace)
    }

    async fn commit(&self, workspace: &WorkspaceRef, message: &str) -> Result<Option<String>> {
        let dir = workspace.path.clone();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || commit_all(&dir, &message, false))
            .await
            .context("Commit task panicked")?
    }

    async fn merge(
        &self,
        workspace: &WorkspaceRef,
        base_ref: &str,
        message: &str,
    ) -> Result<MergeResult> {
        let original = self
            .git_ok(&self.repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .context("Failed to determine current branch before merge")?;

        if original != base_ref {
            self.git_ok(&self.repo_dir, &["checkout", base_ref])
                .await
                .context("Failed to checkout base branch for merge")?;
        }

        let output = self
            .git(
                &self.repo_dir,
                &["merge", "--no-ff", "-m", message, &workspace.branch],
            )
            .await?;

        let result = if output.status.success() {
            let commit = self
                .git_ok(&self.repo_dir, &["rev-parse", "HEAD"])
                .await
                .ok();
            Ok(MergeResult::Merged { commit })
        } else {
            let paths = self.conflicted_paths().await.unwrap_or_default();
            let abort = self.git(&self.repo_dir, &["merge", "--abort"]).await;
            if let Err(e) = &abort {
                warn!(error = %e, "git merge --abort failed");
            }
            if paths.is_empty() {
                Err(anyhow::anyhow!(
                    "git merge of {} failed: {}",
                    workspace.branch,
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
            } else {
                Ok(MergeResult::Conflict { paths })
            }
        };

        if original != base_ref && original != "HEAD" {
            if let Err(e) = self.git_ok(&self.repo_dir, &["checkout", &original]).await {
                warn!(error = %e, branch = %original, "Failed to restore original branch");
            }
        }

        result
    }

    async fn destroy(&self, workspace: &WorkspaceRef) -> Result<()> {
        if workspace.path.exists() {
            let path = workspace
                .path
                .to_str()
                .context("Worktree path contains invalid UTF-8")?;
            let removed = self
                .git_ok(&self.repo_dir, &["worktree", "remove", "--force", path])
                .await;
            if let Err(e) = removed {
                warn!(error = %e, "git worktree remove failed, deleting directory");
                tokio::fs::remove_dir_all(&workspace.path)
                    .await
                    .with_context(|| format!("Failed to remove {}", workspace.path.display()))?;
            }
        }
        // Drop registrations whose directory is gone.
        if let Err(e) = self.git_ok(&self.repo_dir, &["worktree", "prune"]).await {
            warn!(error = %e, "git worktree prune failed");
        }

        let branch_exists = self
            .git(
                &self.repo_dir,
                &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", workspace.branch)],
            )
            .await?
            .status
            .success();
        if branch_exists {
            self.git_ok(&self.repo_dir, &["branch", "-D", &workspace.branch])
                .await?;
        }
        Ok(())
    }

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceRef>> {
        if !self.worktree_root.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.worktree_root)
            .await
            .with_context(|| format!("Failed to list {}", self.worktree_root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(slug) = name.strip_prefix(DIR_PREFIX) else {
                continue;
            };
            match slug.parse::<MilestoneId>() {
                Ok(id) => found.push(self.workspace_for(id)),
                Err(_) => debug!(name = %name, "Ignoring unrecognized worktree directory"),
            }
        }
        found.sort_by_key(|ws| ws.milestone);
        Ok(found)
    }

    async fn check_health(&self, workspace: &WorkspaceRef) -> Result<WorkspaceHealth> {
        if !workspace.path.exists() {
            return Ok(WorkspaceHealth::Stale {
                reason: "directory missing".to_string(),
            });
        }
        let repo = match Repository::open(&workspace.path) {
            Ok(repo) => repo,
            Err(e) => {
                return Ok(WorkspaceHealth::Stale {
                    reason: format!("not a git worktree: {}", e.message()),
                });
            }
        };
        let head = repo
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(String::from));
        Ok(match head {
            Some(branch) if branch == workspace.branch => WorkspaceHealth::Healthy,
            Some(branch) => WorkspaceHealth::Stale {
                reason: format!("on branch {} instead of {}", branch, workspace.branch),
            },
            None => WorkspaceHealth::Stale {
                reason: "HEAD unreadable".to_string(),
            },
        })
    }

    async fn commit_base(&self, base_ref: &str, message: &str) -> Result<String> {
        let current = Self::current_branch(&self.repo_dir);
        if current != base_ref {
            bail!(
                "Base line checkout is on {} instead of {}; refusing to commit",
                current,
                base_ref
            );
        }
        let dir = self.repo_dir.clone();
        let message = message.to_string();
        let commit = tokio::task::spawn_blocking(move || commit_all(&dir, &message, true))
            .await
            .context("Commit task panicked")??;
        commit.context("Empty commit was not recorded")
    }

    fn base_dir(&self) -> PathBuf {
        self.repo_dir.clone()
    }
}

//! Isolated per-milestone workspaces.
//!
//! Each milestone gets exactly one workspace: a branch plus a working
//! directory forked from the base line at creation time. The
//! [`WorkspaceManager`] enforces the 1:1 binding; the [`VcsBackend`] trait
//! is the seam to the version-control system ([`GitWorkspaces`] in
//! production, an in-memory double in tests).

mod git;

pub use git::GitWorkspaces;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::milestone::MilestoneId;

/// Handle to a workspace owned by one milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub milestone: MilestoneId,
    pub branch: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceHealth {
    Healthy,
    Stale { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged { commit: Option<String> },
    Conflict { paths: Vec<PathBuf> },
}

/// Version-control operations needed for isolation and integration.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// Fork a new branch and working directory from `base_ref`.
    async fn create_isolated_workspace(
        &self,
        milestone: MilestoneId,
        base_ref: &str,
    ) -> Result<WorkspaceRef>;

    /// Commit everything in the workspace. `None` when there was nothing to commit.
    async fn commit(&self, workspace: &WorkspaceRef, message: &str) -> Result<Option<String>>;

    /// Merge the workspace branch into `base_ref`, aborting cleanly on conflict.
    async fn merge(
        &self,
        workspace: &WorkspaceRef,
        base_ref: &str,
        message: &str,
    ) -> Result<MergeResult>;

    /// Remove the workspace and its branch. Succeeds if it is already gone.
    async fn destroy(&self, workspace: &WorkspaceRef) -> Result<()>;

    /// Workspaces currently present on disk.
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceRef>>;

    async fn check_health(&self, workspace: &WorkspaceRef) -> Result<WorkspaceHealth>;

    /// Record a commit on the base line itself; empty commits are allowed.
    async fn commit_base(&self, base_ref: &str, message: &str) -> Result<String>;

    /// Directory holding the base line checkout.
    fn base_dir(&self) -> PathBuf;
}

/// Tracks which milestone owns which workspace.
pub struct WorkspaceManager {
    vcs: Arc<dyn VcsBackend>,
    base_ref: String,
    active: Mutex<BTreeMap<MilestoneId, WorkspaceRef>>,
}

impl WorkspaceManager {
    pub fn new(vcs: Arc<dyn VcsBackend>, base_ref: impl Into<String>) -> Self {
        Self {
            vcs,
            base_ref: base_ref.into(),
            active: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn base_ref(&self) -> &str {
        &self.base_ref
    }

    pub fn vcs(&self) -> &Arc<dyn VcsBackend> {
        &self.vcs
    }

    /// Create a fresh workspace for `milestone`.
    ///
    /// Fails with `WorkspaceConflict` when one already exists for it, either
    /// held by this run or left on disk.
    pub async fn create(&self, milestone: MilestoneId) -> Result<WorkspaceRef, PipelineError> {
        let mut active = self.active.lock().await;
        if active.contains_key(&milestone) || self.find_on_disk(milestone).await?.is_some() {
            return Err(PipelineError::WorkspaceConflict { milestone });
        }
        let workspace = self
            .vcs
            .create_isolated_workspace(milestone, &self.base_ref)
            .await
            .map_err(PipelineError::Vcs)?;
        info!(milestone = %milestone, path = %workspace.path.display(), "Workspace created");
        active.insert(milestone, workspace.clone());
        Ok(workspace)
    }

    /// Take ownership of the milestone's workspace, adopting a healthy one
    /// left by an earlier run and replacing a stale one.
    pub async fn acquire(&self, milestone: MilestoneId) -> Result<WorkspaceRef, PipelineError> {
        {
            let mut active = self.active.lock().await;
            if active.contains_key(&milestone) {
                return Err(PipelineError::WorkspaceConflict { milestone });
            }
            if let Some(existing) = self.find_on_disk(milestone).await? {
                match self.validate(&existing).await? {
                    WorkspaceHealth::Healthy => {
                        info!(milestone = %milestone, "Adopting existing workspace");
                        active.insert(milestone, existing.clone());
                        return Ok(existing);
                    }
                    WorkspaceHealth::Stale { reason } => {
                        warn!(milestone = %milestone, reason = %reason, "Replacing stale workspace");
                        self.vcs.destroy(&existing).await.map_err(PipelineError::Vcs)?;
                    }
                }
            }
        }
        self.create(milestone).await
    }

    pub async fn validate(&self, workspace: &WorkspaceRef) -> Result<WorkspaceHealth, PipelineError> {
        self.vcs
            .check_health(workspace)
            .await
            .map_err(PipelineError::Vcs)
    }

    /// Remove a workspace. Idempotent.
    pub async fn destroy(&self, workspace: &WorkspaceRef) -> Result<()> {
        self.vcs.destroy(workspace).await?;
        self.active.lock().await.remove(&workspace.milestone);
        debug!(milestone = %workspace.milestone, "Workspace destroyed");
        Ok(())
    }

    /// Workspace of a milestone, whether held by this run or left on disk.
    pub async fn locate(&self, milestone: MilestoneId) -> Result<Option<WorkspaceRef>> {
        if let Some(ws) = self.active.lock().await.get(&milestone) {
            return Ok(Some(ws.clone()));
        }
        Ok(self
            .vcs
            .list_workspaces()
            .await?
            .into_iter()
            .find(|ws| ws.milestone == milestone))
    }

    /// Milestones that currently hold a workspace in this run.
    pub async fn active(&self) -> BTreeMap<MilestoneId, WorkspaceRef> {
        self.active.lock().await.clone()
    }

    /// Remove on-disk workspaces that belong to no tracked milestone.
    pub async fn prune_stale(&self, tracked: &BTreeSet<MilestoneId>) -> Result<Vec<WorkspaceRef>> {
        let mut pruned = Vec::new();
        for workspace in self.vcs.list_workspaces().await? {
            if tracked.contains(&workspace.milestone) {
                continue;
            }
            info!(
                milestone = %workspace.milestone,
                path = %workspace.path.display(),
                "Pruning stale workspace"
            );
            self.destroy(&workspace).await?;
            pruned.push(workspace);
        }
        Ok(pruned)
    }

    /// Remove every workspace on disk.
    pub async fn destroy_all(&self) -> Result<Vec<WorkspaceRef>> {
        self.prune_stale(&BTreeSet::new()).await
    }

    async fn find_on_disk(&self, milestone: MilestoneId) -> Result<Option<WorkspaceRef>, PipelineError> {
        Ok(self
            .vcs
            .list_workspaces()
            .await
            .map_err(PipelineError::Vcs)?
            .into_iter()
            .find(|ws| ws.milestone == milestone))
    }
}

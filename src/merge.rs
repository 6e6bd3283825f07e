//! Sequential integration of completed workspaces into the base line.
//!
//! The base line is only ever written here. Merges run one at a time in
//! ascending milestone identity, whatever order the pipelines finished in,
//! so the resulting history is the same on every run.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::errors::OrchestratorError;
use crate::milestone::{Milestone, MilestoneId, MilestoneStatus};
use crate::progress::{OrchestratorEvent, ProgressHub};
use crate::workspace::{MergeResult, WorkspaceManager};

pub struct MergeIntegrator {
    workspaces: Arc<WorkspaceManager>,
    checkpoint: Arc<CheckpointStore>,
    progress: Arc<ProgressHub>,
    commit_stage_completion: bool,
}

impl MergeIntegrator {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        checkpoint: Arc<CheckpointStore>,
        progress: Arc<ProgressHub>,
    ) -> Self {
        Self {
            workspaces,
            checkpoint,
            progress,
            commit_stage_completion: true,
        }
    }

    pub fn with_stage_commit(mut self, enabled: bool) -> Self {
        self.commit_stage_completion = enabled;
        self
    }

    /// Merge every completed, not yet merged milestone of `stage`.
    ///
    /// Milestones in any other status are left alone. The first conflict
    /// halts the stage: earlier merges stay, the conflicting milestone and
    /// everything after it are reported unmerged. Returns the milestones
    /// merged by this call.
    pub async fn merge_stage(
        &self,
        stage: u32,
        milestones: &BTreeMap<MilestoneId, Milestone>,
    ) -> Result<Vec<MilestoneId>, OrchestratorError> {
        let merged_before = self.checkpoint.snapshot().await.merged;
        let candidates: Vec<&Milestone> = milestones
            .values()
            .filter(|m| m.id.stage == stage)
            .filter(|m| m.status == MilestoneStatus::Completed)
            .filter(|m| !merged_before.contains(&m.id))
            .collect();

        let mut merged = Vec::new();
        for (index, milestone) in candidates.iter().enumerate() {
            let id = milestone.id;
            let workspace = self.workspaces.locate(id).await?.ok_or_else(|| {
                anyhow::anyhow!("No workspace found for completed milestone {}", id)
            })?;

            let message = format!("Merge milestone {}: {}", id, milestone.title);
            match self
                .workspaces
                .vcs()
                .merge(&workspace, self.workspaces.base_ref(), &message)
                .await?
            {
                MergeResult::Merged { commit } => {
                    self.checkpoint.mark_merged(id).await?;
                    info!(milestone = %id, commit = ?commit, "Milestone merged");
                    self.progress
                        .emit(OrchestratorEvent::Merged { milestone: id })
                        .await;
                    if let Err(e) = self.workspaces.destroy(&workspace).await {
                        warn!(milestone = %id, error = %e, "Failed to remove merged workspace");
                    }
                    merged.push(id);
                }
                MergeResult::Conflict { paths } => {
                    let unmerged: Vec<MilestoneId> =
                        candidates[index..].iter().map(|m| m.id).collect();
                    warn!(
                        stage,
                        milestone = %id,
                        paths = ?paths,
                        unmerged = ?unmerged,
                        "Merge conflict, halting stage"
                    );
                    self.progress
                        .emit(OrchestratorEvent::MergeConflict {
                            milestone: id,
                            paths: paths.clone(),
                        })
                        .await;
                    return Err(OrchestratorError::MergeConflict {
                        stage,
                        milestone: id,
                        paths,
                        unmerged,
                    });
                }
            }
        }
        Ok(merged)
    }

    /// Record the stage's completion on the base line, when enabled.
    pub async fn finalize_stage(
        &self,
        stage: u32,
        milestones: &BTreeMap<MilestoneId, Milestone>,
    ) -> Result<Option<String>, OrchestratorError> {
        if !self.commit_stage_completion {
            return Ok(None);
        }
        let titles: Vec<&str> = milestones
            .values()
            .filter(|m| m.id.stage == stage)
            .map(|m| m.title.as_str())
            .collect();
        let message = format!("Complete stage {}: {}", stage, titles.join(", "));
        let commit = self
            .workspaces
            .vcs()
            .commit_base(self.workspaces.base_ref(), &message)
            .await?;
        info!(stage, commit = %commit, "Stage completion recorded");
        Ok(Some(commit))
    }
}

//! Execution checkpoint: what has run, what is in flight, what is merged.
//!
//! The checkpoint is the resume record. A milestone listed in `completed`
//! is never executed again; anything in `in_flight` at startup was cut off
//! mid-pipeline and runs again from the start of its pipeline. The last
//! review of each milestone is kept so a failed one can be inspected after
//! the run exits.
//!
//! All writers go through [`CheckpointStore`], which serializes mutations
//! behind one mutex and rewrites the file atomically after each of them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::milestone::{MilestoneId, MilestoneStatus};
use crate::review::ReviewReport;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    /// Run that last wrote this record.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub current_stage: Option<u32>,
    #[serde(default)]
    pub completed: BTreeSet<MilestoneId>,
    #[serde(default)]
    pub in_flight: BTreeMap<MilestoneId, MilestoneStatus>,
    #[serde(default)]
    pub failed: BTreeMap<MilestoneId, String>,
    #[serde(default)]
    pub merged: BTreeSet<MilestoneId>,
    #[serde(default)]
    pub completed_stages: BTreeSet<u32>,
    /// Latest review report per milestone.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reviews: BTreeMap<MilestoneId, ReviewReport>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExecutionCheckpoint {
    pub fn is_completed(&self, id: &MilestoneId) -> bool {
        self.completed.contains(id)
    }

    pub fn is_merged(&self, id: &MilestoneId) -> bool {
        self.merged.contains(id)
    }

    pub fn is_stage_completed(&self, stage: u32) -> bool {
        self.completed_stages.contains(&stage)
    }

    /// Last known status of a milestone according to this record.
    pub fn status_of(&self, id: &MilestoneId) -> MilestoneStatus {
        if self.completed.contains(id) {
            MilestoneStatus::Completed
        } else if self.failed.contains_key(id) {
            MilestoneStatus::Failed
        } else {
            self.in_flight.get(id).copied().unwrap_or_default()
        }
    }

    /// Apply a pipeline status transition.
    pub fn record(&mut self, id: MilestoneId, status: MilestoneStatus, reason: Option<&str>) {
        match status {
            MilestoneStatus::Completed => {
                self.in_flight.remove(&id);
                self.failed.remove(&id);
                self.completed.insert(id);
            }
            MilestoneStatus::Failed => {
                self.in_flight.remove(&id);
                self.failed
                    .insert(id, reason.unwrap_or("failed").to_string());
            }
            MilestoneStatus::Pending => {
                self.in_flight.remove(&id);
            }
            other => {
                self.failed.remove(&id);
                self.in_flight.insert(id, other);
            }
        }
    }
}

/// Single-writer owner of the on-disk checkpoint.
pub struct CheckpointStore {
    path: Option<PathBuf>,
    run_id: Uuid,
    state: Mutex<ExecutionCheckpoint>,
}

impl CheckpointStore {
    /// Load the checkpoint at `path`, or start empty when it does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let state = Self::read(path)?.unwrap_or_default();
        Ok(Self {
            path: Some(path.to_path_buf()),
            run_id: Uuid::new_v4(),
            state: Mutex::new(state),
        })
    }

    /// Store that never touches disk.
    pub fn in_memory(initial: ExecutionCheckpoint) -> Self {
        Self {
            path: None,
            run_id: Uuid::new_v4(),
            state: Mutex::new(initial),
        }
    }

    /// Read a checkpoint file without taking ownership of it.
    pub fn read(path: &Path) -> Result<Option<ExecutionCheckpoint>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn snapshot(&self) -> ExecutionCheckpoint {
        self.state.lock().await.clone()
    }

    /// Mutate under the lock and persist before releasing it.
    pub async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutionCheckpoint),
    {
        let mut state = self.state.lock().await;
        mutate(&mut state);
        state.run_id = Some(self.run_id);
        state.updated_at = Some(Utc::now());
        if let Some(path) = &self.path {
            crate::util::write_json_atomic(path, &*state)?;
            debug!(path = %path.display(), "Checkpoint written");
        }
        Ok(())
    }

    pub async fn record(
        &self,
        id: MilestoneId,
        status: MilestoneStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        self.update(|cp| cp.record(id, status, reason)).await
    }

    pub async fn record_review(&self, id: MilestoneId, report: &ReviewReport) -> Result<()> {
        self.update(|cp| {
            cp.reviews.insert(id, report.clone());
        })
        .await
    }

    pub async fn begin_stage(&self, stage: u32) -> Result<()> {
        self.update(|cp| cp.current_stage = Some(stage)).await
    }

    pub async fn mark_merged(&self, id: MilestoneId) -> Result<()> {
        self.update(|cp| {
            cp.merged.insert(id);
        })
        .await
    }

    pub async fn complete_stage(&self, stage: u32) -> Result<()> {
        self.update(|cp| {
            cp.completed_stages.insert(stage);
        })
        .await
    }
}

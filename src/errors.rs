//! Typed error hierarchy for the orchestrator.
//!
//! Two enums split errors by how far they propagate:
//! - `PipelineError` — milestone-local failures, converted into milestone
//!   status transitions and never allowed to take down the worker pool
//! - `OrchestratorError` — stage-integration and scheduler failures that
//!   reach the top level and stop the run

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::milestone::MilestoneId;
use crate::retry::CallClass;

/// Errors raised inside a single milestone pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Workspace for milestone {milestone} already exists")]
    WorkspaceConflict { milestone: MilestoneId },

    #[error("Agent call timed out after {}s", timeout.as_secs())]
    AgentTimeout { timeout: Duration },

    #[error("Agent call throttled ({class})")]
    AgentThrottled { class: CallClass },

    #[error(
        "Rate limit blocked for {class} after {attempts} attempts; wait window {}s",
        wait.as_secs()
    )]
    RateLimitBlocked {
        class: CallClass,
        attempts: u32,
        wait: Duration,
    },

    #[error("Quality gate exhausted after {iterations} iterations (last score {score:.2})")]
    QualityGateExhausted { iterations: u32, score: f64 },

    #[error("Agent failed: {message}")]
    AgentFailed { message: String },

    #[error("Version control error: {0}")]
    Vcs(#[source] anyhow::Error),

    #[error("Failed to record checkpoint: {message}")]
    Checkpoint { message: String },
}

/// Errors that halt orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(
        "Merge conflict in stage {stage} merging milestone {milestone} ({}); unmerged: {}",
        join_paths(paths),
        join_display(unmerged)
    )]
    MergeConflict {
        stage: u32,
        milestone: MilestoneId,
        paths: Vec<PathBuf>,
        unmerged: Vec<MilestoneId>,
    },

    #[error(
        "Scheduler blocked in stage {stage} after {passes} passes; waiting: {}",
        join_display(waiting)
    )]
    SchedulerBlocked {
        stage: u32,
        passes: u32,
        waiting: Vec<MilestoneId>,
    },

    #[error("Stage {stage} incomplete; failed milestones: {}", join_display(failed))]
    StageIncomplete { stage: u32, failed: Vec<MilestoneId> },

    #[error("Stage {stage} quality gate failed (score {score:.2})")]
    StageGateFailed { stage: u32, score: f64 },

    #[error("Milestone {milestone} depends on unknown milestone {dependency}")]
    UnknownDependency {
        milestone: MilestoneId,
        dependency: MilestoneId,
    },

    #[error("Another orchestrator holds the lock at {path}")]
    AlreadyRunning { path: PathBuf },

    #[error("Interrupted")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    if items.is_empty() {
        return "none".to_string();
    }
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_paths(paths: &[PathBuf]) -> String {
    let shown: Vec<_> = paths.iter().map(|p| p.display()).collect();
    join_display(&shown)
}

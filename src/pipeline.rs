//! Per-milestone pipeline: workspace → agent → quality gate → commit.
//!
//! A pipeline never returns an error. Every failure becomes a transition to
//! `Failed` with a recorded reason, and the workspace is kept for inspection.
//! Each status transition and each review report is written to the checkpoint
//! before it is applied and published. A checkpoint write that fails fails the
//! milestone, so nothing is reported further along than the file on disk.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::agent::prompt::milestone_prompt;
use crate::agent::{AgentReply, AgentRequest, AgentRunner};
use crate::checkpoint::CheckpointStore;
use crate::errors::PipelineError;
use crate::milestone::{Milestone, MilestoneStatus};
use crate::progress::{OrchestratorEvent, ProgressHub};
use crate::retry::{CallClass, RateLimitController};
use crate::review::{
    Deadline, GateFailure, GateObserver, GateRun, QualityGate, ReviewReport, ReviewScope,
};
use crate::util::truncate_chars;
use crate::workspace::{WorkspaceManager, WorkspaceRef};

const SUMMARY_LIMIT: usize = 2000;

#[derive(Clone)]
pub struct MilestonePipeline {
    workspaces: Arc<WorkspaceManager>,
    agent: Arc<dyn AgentRunner>,
    limiter: Arc<RateLimitController>,
    checkpoint: Arc<CheckpointStore>,
    progress: Arc<ProgressHub>,
    gate: Option<Arc<QualityGate>>,
    task_timeout: Duration,
}

impl MilestonePipeline {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        agent: Arc<dyn AgentRunner>,
        limiter: Arc<RateLimitController>,
        checkpoint: Arc<CheckpointStore>,
        progress: Arc<ProgressHub>,
        task_timeout: Duration,
    ) -> Self {
        Self {
            workspaces,
            agent,
            limiter,
            checkpoint,
            progress,
            gate: None,
            task_timeout,
        }
    }

    /// Review each milestone through `gate` before committing.
    pub fn with_gate(mut self, gate: Arc<QualityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Drive one milestone to `Completed` or `Failed`.
    pub async fn run(&self, milestone: Milestone) -> Milestone {
        let id = milestone.id;
        let deadline = Deadline::after(self.task_timeout);
        let lifecycle = Lifecycle {
            pipeline: self,
            milestone: Mutex::new(milestone),
        };

        let outcome = match self.drive(&lifecycle, deadline).await {
            Ok(()) => lifecycle.enter(MilestoneStatus::Completed, None).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => info!(milestone = %id, "Milestone completed"),
            Err(e) => {
                warn!(milestone = %id, error = %e, "Milestone failed");
                lifecycle.fail(e.to_string()).await;
            }
        }
        lifecycle.into_inner()
    }

    async fn drive(&self, life: &Lifecycle<'_>, deadline: Deadline) -> Result<(), PipelineError> {
        let id = life.lock().id;
        let workspace = self.workspaces.acquire(id).await?;
        life.lock().workspace = Some(workspace.clone());
        life.enter(MilestoneStatus::Running, None).await?;

        let reply = self.invoke_agent(life, &workspace, deadline).await?;

        if let Some(gate) = &self.gate {
            life.enter(MilestoneStatus::AwaitingReview, None).await?;
            let result = gate
                .run(
                    GateRun {
                        scope: ReviewScope::Milestone(id),
                        working_dir: workspace.path.clone(),
                        deadline: Some(deadline),
                        allow_fix: true,
                    },
                    life,
                )
                .await;
            if let Some(failure) = result.failure {
                return Err(match failure {
                    GateFailure::Exhausted => PipelineError::QualityGateExhausted {
                        iterations: result.iterations,
                        score: result.report.score(),
                    },
                    GateFailure::TimedOut => PipelineError::AgentTimeout {
                        timeout: deadline.budget,
                    },
                    GateFailure::ReviewUnavailable(message)
                    | GateFailure::RemediationFailed(message) => {
                        PipelineError::AgentFailed { message }
                    }
                    GateFailure::Aborted(message) => PipelineError::Checkpoint { message },
                });
            }
        }

        let message = commit_message(&life.lock(), &reply.summary);
        let commit = self
            .workspaces
            .vcs()
            .commit(&workspace, &message)
            .await
            .map_err(PipelineError::Vcs)?;
        info!(milestone = %id, commit = ?commit, "Milestone committed");
        Ok(())
    }

    async fn invoke_agent(
        &self,
        life: &Lifecycle<'_>,
        workspace: &WorkspaceRef,
        deadline: Deadline,
    ) -> Result<AgentReply, PipelineError> {
        let request = AgentRequest {
            prompt: milestone_prompt(&life.lock()),
            working_dir: workspace.path.clone(),
            timeout: self.task_timeout,
        };
        let call = self
            .limiter
            .execute(CallClass::Agent, || self.agent.run(request.clone()));

        match tokio::time::timeout_at(deadline.at, call).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(gate) = &self.gate {
                    let report = {
                        let milestone = life.lock();
                        ReviewReport::timed_out(
                            ReviewScope::Milestone(milestone.id),
                            gate.config().threshold,
                            milestone.latest_review(),
                            deadline.budget,
                        )
                    };
                    if let Err(e) = life.record_review(&report).await {
                        warn!(error = %e, "Timed-out review not recorded");
                    }
                }
                Err(PipelineError::AgentTimeout {
                    timeout: deadline.budget,
                })
            }
        }
    }
}

fn commit_message(milestone: &Milestone, summary: &str) -> String {
    let header = format!("Milestone {}: {}", milestone.id, milestone.title);
    let summary = summary.trim();
    if summary.is_empty() {
        header
    } else {
        format!("{}\n\n{}", header, truncate_chars(summary, SUMMARY_LIMIT))
    }
}

/// The milestone a pipeline is driving, plus transition bookkeeping.
struct Lifecycle<'a> {
    pipeline: &'a MilestonePipeline,
    milestone: Mutex<Milestone>,
}

impl Lifecycle<'_> {
    fn lock(&self) -> MutexGuard<'_, Milestone> {
        self.milestone.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn into_inner(self) -> Milestone {
        self.milestone.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist a transition, apply it, then publish it.
    async fn enter(&self, status: MilestoneStatus, reason: Option<String>) -> Result<(), PipelineError> {
        let id = {
            let milestone = self.lock();
            if milestone.status == status {
                return Ok(());
            }
            if !milestone.status.can_transition_to(status) {
                error!(
                    milestone = %milestone.id,
                    from = %milestone.status,
                    to = %status,
                    "Rejected status transition"
                );
                return Ok(());
            }
            milestone.id
        };
        self.pipeline
            .checkpoint
            .record(id, status, reason.as_deref())
            .await
            .map_err(checkpoint_error)?;
        if let Err(e) = self.lock().advance(status) {
            error!(error = %e, "Rejected status transition");
        }
        self.pipeline
            .progress
            .emit(OrchestratorEvent::StatusChanged {
                milestone: id,
                status,
                reason,
            })
            .await;
        Ok(())
    }

    /// Record `Failed`. The milestone is failed in memory even when the
    /// checkpoint cannot be written.
    async fn fail(&self, reason: String) {
        if let Err(e) = self.enter(MilestoneStatus::Failed, Some(reason)).await {
            let mut milestone = self.lock();
            error!(milestone = %milestone.id, error = %e, "Failure not recorded in checkpoint");
            milestone.status = MilestoneStatus::Failed;
        }
    }

    /// Append a report to the history, persist it, then publish it.
    async fn record_review(&self, report: &ReviewReport) -> Result<(), PipelineError> {
        let id = {
            let mut milestone = self.lock();
            milestone.review_history.push(report.clone());
            milestone.id
        };
        self.pipeline
            .checkpoint
            .record_review(id, report)
            .await
            .map_err(checkpoint_error)?;
        self.pipeline
            .progress
            .emit(OrchestratorEvent::Reviewed {
                report: Box::new(report.clone()),
            })
            .await;
        Ok(())
    }
}

fn checkpoint_error(e: anyhow::Error) -> PipelineError {
    PipelineError::Checkpoint {
        message: format!("{:#}", e),
    }
}

#[async_trait]
impl GateObserver for Lifecycle<'_> {
    async fn reviewing(&self, _iteration: u32) -> anyhow::Result<()> {
        self.enter(MilestoneStatus::AwaitingReview, None).await.map_err(Into::into)
    }

    async fn reviewed(&self, report: &ReviewReport) -> anyhow::Result<()> {
        self.record_review(report).await.map_err(Into::into)
    }

    async fn fixing(&self, _iteration: u32) -> anyhow::Result<()> {
        self.enter(MilestoneStatus::Fixing, None).await.map_err(Into::into)
    }
}

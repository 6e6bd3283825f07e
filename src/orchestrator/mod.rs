//! Top-level stage loop.
//!
//! ```text
//! next_stage ─▶ run_stage (parallel pipelines) ─▶ merge_stage (sequential)
//!      ▲                                               │
//!      └──── complete_stage ◀── finalize ◀── stage gate ┘
//! ```
//!
//! Stages never overlap: the next one is selected only after the previous
//! one is merged, reviewed and recorded as completed in the checkpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use async_trait::async_trait;

use crate::agent::AgentRunner;
use crate::checkpoint::CheckpointStore;
use crate::errors::OrchestratorError;
use crate::executor::StageExecutor;
use crate::merge::MergeIntegrator;
use crate::milestone::{Milestone, MilestoneId, MilestoneStatus};
use crate::monitor::ResourceMonitor;
use crate::pipeline::MilestonePipeline;
use crate::progress::{OrchestratorEvent, ProgressHub};
use crate::retry::RateLimitController;
use crate::review::{
    Deadline, GateConfig, GateObserver, GateRun, QualityGate, ReviewReport, ReviewScope, Reviewer,
};
use crate::scheduler::StageScheduler;
use crate::workspace::{VcsBackend, WorkspaceManager};

/// Runtime knobs of the engine, resolved from settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_parallel: usize,
    /// Whole-pipeline budget per milestone, review loop included.
    pub task_timeout: Duration,
    pub max_blocked_passes: u32,
    pub review_enabled: bool,
    /// Re-review the merged base line after each stage.
    pub stage_review: bool,
    pub gate: GateConfig,
    pub commit_stage_completion: bool,
    pub resource_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            task_timeout: Duration::from_secs(1800),
            max_blocked_passes: 3,
            review_enabled: true,
            stage_review: true,
            gate: GateConfig::default(),
            commit_stage_completion: true,
            resource_poll: Duration::from_secs(30),
        }
    }
}

/// External collaborators and shared stores the engine runs against.
pub struct Collaborators {
    pub vcs: Arc<dyn VcsBackend>,
    pub base_ref: String,
    pub agent: Arc<dyn AgentRunner>,
    pub reviewer: Arc<dyn Reviewer>,
    pub limiter: Arc<RateLimitController>,
    pub checkpoint: Arc<CheckpointStore>,
    pub progress: Arc<ProgressHub>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Stages completed by this run.
    pub stages: Vec<u32>,
    /// Milestones merged by this run, in merge order.
    pub merged: Vec<MilestoneId>,
    /// Stale workspaces removed at startup.
    pub pruned: usize,
}

pub struct Orchestrator {
    config: EngineConfig,
    milestones: BTreeMap<MilestoneId, Milestone>,
    scheduler: StageScheduler,
    executor: StageExecutor,
    merger: MergeIntegrator,
    stage_gate: Option<Arc<QualityGate>>,
    workspaces: Arc<WorkspaceManager>,
    checkpoint: Arc<CheckpointStore>,
    progress: Arc<ProgressHub>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        milestones: BTreeMap<MilestoneId, Milestone>,
        parts: Collaborators,
    ) -> Self {
        let workspaces = Arc::new(WorkspaceManager::new(parts.vcs, parts.base_ref));
        let gate = config.review_enabled.then(|| {
            Arc::new(QualityGate::new(
                config.gate.clone(),
                parts.reviewer.clone(),
                parts.agent.clone(),
                parts.limiter.clone(),
            ))
        });

        let mut pipeline = MilestonePipeline::new(
            workspaces.clone(),
            parts.agent,
            parts.limiter,
            parts.checkpoint.clone(),
            parts.progress.clone(),
            config.task_timeout,
        );
        if let Some(gate) = &gate {
            pipeline = pipeline.with_gate(gate.clone());
        }

        let executor = StageExecutor::new(pipeline, parts.progress.clone(), config.max_parallel);
        let merger = MergeIntegrator::new(
            workspaces.clone(),
            parts.checkpoint.clone(),
            parts.progress.clone(),
        )
        .with_stage_commit(config.commit_stage_completion);
        let stage_gate = if config.stage_review { gate } else { None };

        Self {
            scheduler: StageScheduler::new(&milestones, config.max_blocked_passes),
            config,
            milestones,
            executor,
            merger,
            stage_gate,
            workspaces,
            checkpoint: parts.checkpoint,
            progress: parts.progress,
        }
    }

    /// Hold back new pipelines while `monitor` reports overload.
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.executor = self
            .executor
            .with_monitor(monitor, self.config.resource_poll);
        self
    }

    pub fn progress(&self) -> &Arc<ProgressHub> {
        &self.progress
    }

    /// Run or resume until every stage is completed.
    pub async fn run(&self) -> Result<RunSummary, OrchestratorError> {
        let tracked: BTreeSet<MilestoneId> = self.milestones.keys().copied().collect();
        let pruned = self.workspaces.prune_stale(&tracked).await?;
        let mut summary = RunSummary {
            pruned: pruned.len(),
            ..Default::default()
        };

        let initial = self.checkpoint.snapshot().await;
        let mut known = self.milestones.clone();
        for milestone in known.values_mut() {
            milestone.status = initial.status_of(&milestone.id);
            if milestone.status == MilestoneStatus::Completed {
                milestone.mark_tasks_completed();
            }
            if let Some(report) = initial.reviews.get(&milestone.id) {
                milestone.review_history.push(report.clone());
            }
        }
        self.progress
            .register(known.values(), &initial.merged, &initial.completed_stages)
            .await;
        if !initial.in_flight.is_empty() {
            info!(
                milestones = ?initial.in_flight.keys().collect::<Vec<_>>(),
                "Resuming interrupted milestones"
            );
        }

        loop {
            let checkpoint = self.checkpoint.snapshot().await;
            let Some(stage) = self.scheduler.next_stage(&checkpoint) else {
                break;
            };
            if summary.stages.contains(&stage.number) {
                return Err(anyhow::anyhow!("Stage {} did not settle after completion", stage.number).into());
            }

            info!(stage = stage.number, milestones = stage.milestones.len(), "Starting stage");
            self.checkpoint.begin_stage(stage.number).await?;
            self.progress
                .emit(OrchestratorEvent::StageStarted {
                    stage: stage.number,
                    milestones: stage.milestones.clone(),
                })
                .await;

            let members: BTreeMap<MilestoneId, Milestone> = stage
                .milestones
                .iter()
                .filter_map(|id| known.get(id).map(|m| (*id, m.clone())))
                .collect();
            let report = self
                .executor
                .run_stage(&stage, &self.scheduler, members, &checkpoint.completed)
                .await?;

            let merged = self.merger.merge_stage(stage.number, &report.milestones).await?;
            summary.merged.extend(merged);

            let failed = report.failed();
            if !failed.is_empty() {
                return Err(OrchestratorError::StageIncomplete {
                    stage: stage.number,
                    failed,
                });
            }
            if !report.blocked.is_empty() {
                return Err(OrchestratorError::SchedulerBlocked {
                    stage: stage.number,
                    passes: report.stalled_passes,
                    waiting: report.blocked,
                });
            }

            self.review_stage(stage.number).await?;
            self.merger
                .finalize_stage(stage.number, &report.milestones)
                .await?;
            self.checkpoint.complete_stage(stage.number).await?;
            self.progress
                .emit(OrchestratorEvent::StageCompleted {
                    stage: stage.number,
                })
                .await;
            info!(stage = stage.number, "Stage completed");
            summary.stages.push(stage.number);
        }

        self.progress
            .emit(OrchestratorEvent::RunCompleted {
                stages: summary.stages.clone(),
            })
            .await;
        Ok(summary)
    }

    /// Review the merged base line. Never remediates.
    async fn review_stage(&self, stage: u32) -> Result<(), OrchestratorError> {
        let Some(gate) = &self.stage_gate else {
            return Ok(());
        };
        let observer = StageObserver {
            progress: &self.progress,
        };
        let result = gate
            .run(
                GateRun {
                    scope: ReviewScope::Stage(stage),
                    working_dir: self.workspaces.vcs().base_dir(),
                    deadline: Some(Deadline::after(self.config.task_timeout)),
                    allow_fix: false,
                },
                &observer,
            )
            .await;
        if result.passed() {
            return Ok(());
        }
        warn!(stage, score = result.report.score(), "Stage quality gate failed");
        Err(OrchestratorError::StageGateFailed {
            stage,
            score: result.report.score(),
        })
    }
}

struct StageObserver<'a> {
    progress: &'a ProgressHub,
}

#[async_trait]
impl GateObserver for StageObserver<'_> {
    async fn reviewed(&self, report: &ReviewReport) -> anyhow::Result<()> {
        self.progress
            .emit(OrchestratorEvent::Reviewed {
                report: Box::new(report.clone()),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CallOutcome;
    use crate::checkpoint::ExecutionCheckpoint;
    use crate::milestone::Task;
    use crate::retry::{ManualClock, RetryPolicy};
    use crate::test_support::{Journal, MemoryVcs, ScriptedAgent, ScriptedReviewer};

    fn id(s: &str) -> MilestoneId {
        s.parse().unwrap()
    }

    fn milestones(specs: &[&str]) -> BTreeMap<MilestoneId, Milestone> {
        specs
            .iter()
            .map(|name| {
                let m = Milestone::new(
                    id(name),
                    format!("Milestone {}", name),
                    vec![Task::new("implement it", Default::default())],
                );
                (m.id, m)
            })
            .collect()
    }

    struct Harness {
        journal: Arc<Journal>,
        vcs: Arc<MemoryVcs>,
        agent: Arc<ScriptedAgent>,
        reviewer: Arc<ScriptedReviewer>,
        clock: Arc<ManualClock>,
        checkpoint: Arc<CheckpointStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self::resuming(ExecutionCheckpoint::default())
        }

        fn resuming(checkpoint: ExecutionCheckpoint) -> Self {
            let journal = Arc::new(Journal::default());
            Self {
                vcs: Arc::new(MemoryVcs::sharing(journal.clone())),
                agent: Arc::new(ScriptedAgent::sharing(journal.clone())),
                reviewer: Arc::new(ScriptedReviewer::default()),
                clock: Arc::new(ManualClock::default()),
                checkpoint: Arc::new(CheckpointStore::in_memory(checkpoint)),
                journal,
            }
        }

        fn orchestrator(
            &self,
            config: EngineConfig,
            milestones: BTreeMap<MilestoneId, Milestone>,
        ) -> Orchestrator {
            let limiter = Arc::new(RateLimitController::new(
                RetryPolicy::default(),
                self.clock.clone(),
            ));
            Orchestrator::new(
                config,
                milestones,
                Collaborators {
                    vcs: self.vcs.clone(),
                    base_ref: "main".into(),
                    agent: self.agent.clone(),
                    reviewer: self.reviewer.clone(),
                    limiter,
                    checkpoint: self.checkpoint.clone(),
                    progress: Arc::new(ProgressHub::new()),
                },
            )
        }
    }

    fn parallel(p: usize) -> EngineConfig {
        EngineConfig {
            max_parallel: p,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_next_stage_starts_only_after_previous_is_merged() {
        let h = Harness::new();
        h.agent.set_delay(id("1B"), Duration::from_millis(50));
        let orch = h.orchestrator(parallel(4), milestones(&["1A", "1B", "2A", "2B"]));

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.stages, vec![1, 2]);
        assert_eq!(summary.merged, vec![id("1A"), id("1B"), id("2A"), id("2B")]);

        let stage_one_done = h.journal.position("merge 1B").unwrap();
        let stage_one_closed = h
            .journal
            .position("base-commit Complete stage 1: Milestone 1A, Milestone 1B")
            .unwrap();
        let first_stage_two = h
            .journal
            .position("agent 2A")
            .min(h.journal.position("agent 2B"))
            .unwrap();
        assert!(stage_one_done < stage_one_closed);
        assert!(stage_one_closed < first_stage_two);

        // One workspace per milestone, each reclaimed after its merge.
        assert_eq!(h.vcs.created_count(), 4);
        assert_eq!(h.vcs.destroyed(), summary.merged);

        let cp = h.checkpoint.snapshot().await;
        assert_eq!(cp.completed_stages, [1, 2].into_iter().collect());
    }

    #[tokio::test]
    async fn test_merge_order_ignores_completion_order() {
        let h = Harness::new();
        // Finish order 1A, 1C, 1B.
        h.agent.set_delay(id("1B"), Duration::from_millis(150));
        h.agent.set_delay(id("1C"), Duration::from_millis(50));
        let orch = h.orchestrator(parallel(3), milestones(&["1A", "1B", "1C"]));

        orch.run().await.unwrap();
        assert_eq!(h.vcs.merged(), vec![id("1A"), id("1B"), id("1C")]);
    }

    #[tokio::test]
    async fn test_resume_reruns_only_in_flight_milestone() {
        let mut checkpoint = ExecutionCheckpoint::default();
        checkpoint.current_stage = Some(1);
        checkpoint.completed.insert(id("1A"));
        checkpoint.in_flight.insert(id("1B"), MilestoneStatus::Running);
        let h = Harness::resuming(checkpoint);
        // Both workspaces survived the crash.
        h.vcs.create_isolated_workspace(id("1A"), "main").await.unwrap();
        h.vcs.create_isolated_workspace(id("1B"), "main").await.unwrap();

        let orch = h.orchestrator(parallel(2), milestones(&["1A", "1B"]));
        let summary = orch.run().await.unwrap();

        assert_eq!(h.agent.calls(), vec![Some(id("1B"))]);
        assert_eq!(h.agent.calls_for(id("1A")), 0);
        assert_eq!(summary.merged, vec![id("1A"), id("1B")]);
        // 1B's surviving workspace was adopted, not recreated.
        assert_eq!(h.vcs.created_count(), 2);
    }

    #[tokio::test]
    async fn test_throttle_once_with_single_worker() {
        let h = Harness::new();
        h.agent.script(
            id("1A"),
            vec![CallOutcome::Throttled {
                detail: "rate limit exceeded".into(),
            }],
        );
        let orch = h.orchestrator(parallel(1), milestones(&["1A", "1B"]));

        let summary = orch.run().await.unwrap();
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(30)]);
        assert_eq!(
            h.agent.calls(),
            vec![Some(id("1A")), Some(id("1A")), Some(id("1B"))]
        );
        assert_eq!(summary.merged, vec![id("1A"), id("1B")]);
        let cp = h.checkpoint.snapshot().await;
        assert!(cp.is_completed(&id("1A")) && cp.is_completed(&id("1B")));
    }

    #[tokio::test]
    async fn test_failed_milestone_halts_stage_after_merging_the_rest() {
        let h = Harness::new();
        h.reviewer
            .script(ReviewScope::Milestone(id("1A")), &[0.3, 0.4, 0.5]);
        let orch = h.orchestrator(parallel(2), milestones(&["1A", "1B", "2A"]));

        let err = orch.run().await.unwrap_err();
        match err {
            OrchestratorError::StageIncomplete { stage, failed } => {
                assert_eq!(stage, 1);
                assert_eq!(failed, vec![id("1A")]);
            }
            other => panic!("expected StageIncomplete, got {:?}", other),
        }
        assert_eq!(h.vcs.merged(), vec![id("1B")]);
        assert!(h.vcs.has_workspace(id("1A")));
        assert_eq!(h.agent.calls_for(id("2A")), 0);

        let snapshot = orch.progress().snapshot().await;
        let failed = &snapshot.milestones[&id("1A")];
        assert_eq!(failed.status, MilestoneStatus::Failed);
        assert_eq!(failed.latest_review.as_ref().map(|r| r.score()), Some(0.5));
        assert_eq!(failed.tasks_done, 0);
        assert_eq!(snapshot.milestones[&id("1B")].tasks_done, 1);

        // The failing report outlives the run.
        let cp = h.checkpoint.snapshot().await;
        assert_eq!(cp.reviews[&id("1A")].score(), 0.5);
        assert!(!cp.reviews[&id("1A")].passed());
    }

    #[tokio::test]
    async fn test_timed_out_milestone_publishes_its_report() {
        let h = Harness::new();
        h.agent.set_delay(id("1A"), Duration::from_secs(30));
        let config = EngineConfig {
            task_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let orch = h.orchestrator(config, milestones(&["1A"]));

        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StageIncomplete { .. }));

        let snapshot = orch.progress().snapshot().await;
        let entry = &snapshot.milestones[&id("1A")];
        assert_eq!(entry.status, MilestoneStatus::Failed);
        let report = entry.latest_review.as_ref().unwrap();
        assert_eq!(report.issues_of(crate::review::IssueKind::Timeout).count(), 1);
    }

    #[tokio::test]
    async fn test_resume_restores_last_review_and_completed_tasks() {
        let mut cp = ExecutionCheckpoint::default();
        cp.completed.insert(id("1A"));
        cp.merged.insert(id("1A"));
        cp.completed_stages.insert(1);
        let old = ReviewReport::new(ReviewScope::Milestone(id("2A")), 0.3, 0.8, vec![]);
        cp.failed.insert(id("2A"), "quality gate exhausted".into());
        cp.reviews.insert(id("2A"), old);
        let h = Harness::resuming(cp);
        // The rerun of 2A fails before any new review.
        let error = CallOutcome::Error {
            message: "exit code 1".into(),
        };
        h.agent
            .script(id("2A"), vec![error.clone(), error.clone(), error]);
        let orch = h.orchestrator(parallel(1), milestones(&["1A", "2A"]));

        orch.run().await.unwrap_err();
        let snapshot = orch.progress().snapshot().await;
        assert_eq!(snapshot.milestones[&id("1A")].tasks_done, 1);
        let restored = snapshot.milestones[&id("2A")].latest_review.as_ref().unwrap();
        assert_eq!(restored.score(), 0.3);
    }

    #[tokio::test]
    async fn test_merge_conflict_keeps_earlier_merges_and_stops() {
        let h = Harness::new();
        h.vcs.inject_conflict(id("1B"), &["src/lib.rs"]);
        let orch = h.orchestrator(parallel(3), milestones(&["1A", "1B", "1C", "2A"]));

        let err = orch.run().await.unwrap_err();
        match err {
            OrchestratorError::MergeConflict {
                milestone,
                unmerged,
                ..
            } => {
                assert_eq!(milestone, id("1B"));
                assert_eq!(unmerged, vec![id("1B"), id("1C")]);
            }
            other => panic!("expected MergeConflict, got {:?}", other),
        }
        let cp = h.checkpoint.snapshot().await;
        assert!(cp.is_merged(&id("1A")));
        assert!(!cp.is_merged(&id("1B")));
        assert!(cp.completed_stages.is_empty());
        assert_eq!(h.agent.calls_for(id("2A")), 0);
    }

    #[tokio::test]
    async fn test_stage_gate_failure_blocks_next_stage_without_fixing() {
        let h = Harness::new();
        h.reviewer.script(ReviewScope::Stage(1), &[0.5]);
        let orch = h.orchestrator(parallel(2), milestones(&["1A", "2A"]));

        let err = orch.run().await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::StageGateFailed { stage: 1, score } if score == 0.5
        ));
        assert_eq!(h.reviewer.calls_for(ReviewScope::Stage(1)), 1);
        assert_eq!(h.agent.calls(), vec![Some(id("1A"))]);
        assert!(h.checkpoint.snapshot().await.is_merged(&id("1A")));

        // The next run re-reviews the merged stage without re-running 1A.
        let summary = h
            .orchestrator(parallel(2), milestones(&["1A", "2A"]))
            .run()
            .await
            .unwrap();
        assert_eq!(summary.stages, vec![1, 2]);
        assert_eq!(h.agent.calls_for(id("1A")), 1);
    }

    #[tokio::test]
    async fn test_dependency_cycle_reports_scheduler_blocked() {
        let h = Harness::new();
        let mut ms = milestones(&["1A", "1B"]);
        ms.get_mut(&id("1A")).unwrap().dependencies.insert(id("1B"));
        ms.get_mut(&id("1B")).unwrap().dependencies.insert(id("1A"));
        let orch = h.orchestrator(parallel(2), ms);

        let err = orch.run().await.unwrap_err();
        match err {
            OrchestratorError::SchedulerBlocked {
                stage,
                passes,
                waiting,
            } => {
                assert_eq!(stage, 1);
                assert_eq!(passes, 3);
                assert_eq!(waiting, vec![id("1A"), id("1B")]);
            }
            other => panic!("expected SchedulerBlocked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completed_run_is_not_replayed() {
        let h = Harness::new();
        h.orchestrator(parallel(2), milestones(&["1A", "2A"]))
            .run()
            .await
            .unwrap();
        let calls = h.agent.call_count();

        let summary = h
            .orchestrator(parallel(2), milestones(&["1A", "2A"]))
            .run()
            .await
            .unwrap();
        assert!(summary.stages.is_empty());
        assert_eq!(h.agent.call_count(), calls);
    }

    #[tokio::test]
    async fn test_untracked_workspaces_are_pruned_at_startup() {
        let h = Harness::new();
        h.vcs.create_isolated_workspace(id("7Z"), "main").await.unwrap();
        let summary = h
            .orchestrator(parallel(1), milestones(&["1A"]))
            .run()
            .await
            .unwrap();
        assert_eq!(summary.pruned, 1);
        assert!(!h.vcs.has_workspace(id("7Z")));
    }
}

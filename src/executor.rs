//! Bounded worker pool running one stage's milestone pipelines.

use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::milestone::{Milestone, MilestoneId, MilestoneStatus};
use crate::monitor::{ResourceMonitor, ResourceStatus};
use crate::pipeline::MilestonePipeline;
use crate::progress::{OrchestratorEvent, ProgressHub};
use crate::scheduler::{Stage, StageScheduler};

/// What happened to every milestone of a stage.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub stage: u32,
    /// Final state of each milestone, including ones completed by an earlier run.
    pub milestones: BTreeMap<MilestoneId, Milestone>,
    /// Milestones that never became ready.
    pub blocked: Vec<MilestoneId>,
    /// Scheduling passes without progress before giving up on `blocked`.
    pub stalled_passes: u32,
}

impl StageReport {
    pub fn ids_with(&self, status: MilestoneStatus) -> Vec<MilestoneId> {
        self.milestones
            .values()
            .filter(|m| m.status == status)
            .map(|m| m.id)
            .collect()
    }

    pub fn failed(&self) -> Vec<MilestoneId> {
        self.ids_with(MilestoneStatus::Failed)
    }
}

pub struct StageExecutor {
    pipeline: MilestonePipeline,
    progress: Arc<ProgressHub>,
    max_parallel: usize,
    monitor: Option<Arc<ResourceMonitor>>,
    resource_poll: Duration,
}

impl StageExecutor {
    pub fn new(pipeline: MilestonePipeline, progress: Arc<ProgressHub>, max_parallel: usize) -> Self {
        Self {
            pipeline,
            progress,
            max_parallel: max_parallel.max(1),
            monitor: None,
            resource_poll: Duration::from_secs(30),
        }
    }

    /// Hold back new pipelines while `monitor` reports overload.
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>, poll: Duration) -> Self {
        self.monitor = Some(monitor);
        self.resource_poll = poll;
        self
    }

    /// Run every not-yet-completed milestone of `stage`.
    ///
    /// `milestones` holds the stage's milestones; those in `completed` are
    /// reported as completed without running again. Pipelines start in
    /// identity order with at most `max_parallel` in flight; they finish in
    /// whatever order they finish.
    pub async fn run_stage(
        &self,
        stage: &Stage,
        scheduler: &StageScheduler,
        mut milestones: BTreeMap<MilestoneId, Milestone>,
        completed: &BTreeSet<MilestoneId>,
    ) -> Result<StageReport, OrchestratorError> {
        let mut report = StageReport {
            stage: stage.number,
            ..Default::default()
        };
        let mut completed = completed.clone();
        let mut pending: BTreeSet<MilestoneId> = BTreeSet::new();

        for id in &stage.milestones {
            let Some(mut milestone) = milestones.remove(id) else {
                continue;
            };
            if completed.contains(id) {
                milestone.status = MilestoneStatus::Completed;
                report.milestones.insert(*id, milestone);
            } else {
                // Interrupted pipelines restart from the top; failed ones retry.
                if milestone.status != MilestoneStatus::Failed {
                    milestone.status = MilestoneStatus::Pending;
                }
                milestones.insert(*id, milestone);
                pending.insert(*id);
            }
        }

        info!(
            stage = stage.number,
            pending = pending.len(),
            skipped = report.milestones.len(),
            max_parallel = self.max_parallel,
            "Executing stage"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let (result_tx, mut result_rx) = mpsc::channel::<Milestone>(stage.milestones.len().max(1));
        let mut active: HashMap<MilestoneId, JoinHandle<()>> = HashMap::new();
        let mut announced_deferrals: BTreeSet<MilestoneId> = BTreeSet::new();
        let mut stalled = 0u32;

        loop {
            let plan = scheduler.plan(&pending, &completed);

            for (id, waiting_on) in &plan.deferred {
                if announced_deferrals.insert(*id) {
                    debug!(milestone = %id, waiting_on = ?waiting_on, "Milestone deferred");
                    self.progress
                        .emit(OrchestratorEvent::Deferred {
                            milestone: *id,
                            waiting_on: waiting_on.clone(),
                        })
                        .await;
                }
            }

            for id in plan.ready {
                let Some(milestone) = milestones.remove(&id) else {
                    continue;
                };
                pending.remove(&id);
                self.wait_for_resources().await;

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(anyhow::Error::from)?;
                let pipeline = self.pipeline.clone();
                let result_tx = result_tx.clone();
                debug!(milestone = %id, "Starting pipeline");

                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    let fallback = milestone.clone();
                    let finished = match AssertUnwindSafe(pipeline.run(milestone))
                        .catch_unwind()
                        .await
                    {
                        Ok(finished) => finished,
                        Err(_) => {
                            warn!(milestone = %id, "Pipeline panicked");
                            let mut failed = fallback;
                            failed.status = MilestoneStatus::Failed;
                            failed
                        }
                    };
                    result_tx.send(finished).await.ok();
                });
                active.insert(id, handle);
            }

            if active.is_empty() {
                if pending.is_empty() {
                    break;
                }
                // Passes are synchronous: with nothing in flight no completion
                // can arrive, so each further pass replans the same state.
                // `max_blocked_passes` bounds how many are tried, not how long.
                stalled += 1;
                if stalled >= scheduler.max_blocked_passes() {
                    warn!(
                        stage = stage.number,
                        passes = stalled,
                        waiting = ?pending,
                        "No milestone can make progress"
                    );
                    report.blocked = pending.iter().copied().collect();
                    report.stalled_passes = stalled;
                    break;
                }
                continue;
            }
            stalled = 0;

            match result_rx.recv().await {
                Some(milestone) => {
                    if let Some(handle) = active.remove(&milestone.id) {
                        handle.await.ok();
                    }
                    if milestone.status == MilestoneStatus::Completed {
                        completed.insert(milestone.id);
                    }
                    report.milestones.insert(milestone.id, milestone);
                }
                None => break,
            }
        }

        for id in report.blocked.iter() {
            if let Some(milestone) = milestones.remove(id) {
                report.milestones.insert(*id, milestone);
            }
        }

        info!(
            stage = stage.number,
            completed = report.ids_with(MilestoneStatus::Completed).len(),
            failed = report.failed().len(),
            blocked = report.blocked.len(),
            "Stage execution finished"
        );
        Ok(report)
    }

    async fn wait_for_resources(&self) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        loop {
            match monitor.check() {
                ResourceStatus::Ok => return,
                ResourceStatus::Overloaded(reasons) => {
                    warn!(reasons = ?reasons, "System overloaded, delaying new pipeline");
                    self.progress
                        .emit(OrchestratorEvent::ResourceWait { reasons })
                        .await;
                    tokio::time::sleep(self.resource_poll).await;
                }
            }
        }
    }
}

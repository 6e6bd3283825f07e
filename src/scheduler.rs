//! Stage scheduler: which stage runs next, and which of its milestones are ready.
//!
//! Stages run strictly in ascending order. A stage is finished only when it is
//! recorded as completed in the checkpoint *and* every one of its milestones
//! is completed and merged, so adding a milestone to an old stage reopens it.
//! Inside a stage, a milestone whose dependencies are not yet completed is
//! deferred to a later scheduling pass rather than failed.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::checkpoint::ExecutionCheckpoint;
use crate::milestone::{Milestone, MilestoneId};

/// A ready stage and its milestones in identity order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub number: u32,
    pub milestones: Vec<MilestoneId>,
}

/// One scheduling pass over a stage's pending milestones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagePlan {
    /// Dependencies satisfied; start these in this order.
    pub ready: Vec<MilestoneId>,
    /// Waiting on the listed milestones.
    pub deferred: Vec<(MilestoneId, Vec<MilestoneId>)>,
}

impl StagePlan {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.deferred.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StageScheduler {
    stages: BTreeMap<u32, Vec<MilestoneId>>,
    dependencies: BTreeMap<MilestoneId, BTreeSet<MilestoneId>>,
    max_blocked_passes: u32,
}

impl StageScheduler {
    pub fn new(milestones: &BTreeMap<MilestoneId, Milestone>, max_blocked_passes: u32) -> Self {
        let mut stages: BTreeMap<u32, Vec<MilestoneId>> = BTreeMap::new();
        for id in milestones.keys() {
            stages.entry(id.stage).or_default().push(*id);
        }
        let dependencies = milestones
            .values()
            .map(|m| (m.id, m.dependencies.clone()))
            .collect();
        Self {
            stages,
            dependencies,
            max_blocked_passes: max_blocked_passes.max(1),
        }
    }

    pub fn stage_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.stages.keys().copied()
    }

    pub fn max_blocked_passes(&self) -> u32 {
        self.max_blocked_passes
    }

    /// Whether every milestone of `stage` is completed and merged and the
    /// stage itself has been closed.
    pub fn is_stage_finished(&self, stage: u32, checkpoint: &ExecutionCheckpoint) -> bool {
        checkpoint.is_stage_completed(stage)
            && self.stages.get(&stage).is_none_or(|ids| {
                ids.iter()
                    .all(|id| checkpoint.is_completed(id) && checkpoint.is_merged(id))
            })
    }

    /// The lowest stage that is not finished, or `None` when all are.
    ///
    /// Every strictly earlier stage is finished by construction, which is
    /// what makes the returned stage ready.
    pub fn next_stage(&self, checkpoint: &ExecutionCheckpoint) -> Option<Stage> {
        let (number, ids) = self
            .stages
            .iter()
            .find(|(stage, _)| !self.is_stage_finished(**stage, checkpoint))?;
        debug!(stage = number, milestones = ids.len(), "Next stage selected");
        Some(Stage {
            number: *number,
            milestones: ids.clone(),
        })
    }

    /// Split `pending` into milestones that can start now and deferred ones.
    pub fn plan(
        &self,
        pending: &BTreeSet<MilestoneId>,
        completed: &BTreeSet<MilestoneId>,
    ) -> StagePlan {
        let mut plan = StagePlan::default();
        for id in pending {
            let waiting_on: Vec<MilestoneId> = self
                .dependencies
                .get(id)
                .map(|deps| deps.iter().filter(|d| !completed.contains(d)).copied().collect())
                .unwrap_or_default();
            if waiting_on.is_empty() {
                plan.ready.push(*id);
            } else {
                plan.deferred.push((*id, waiting_on));
            }
        }
        plan
    }
}

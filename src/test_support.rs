//! Scripted collaborators for engine tests.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::agent::{AgentOutcome, AgentReply, AgentRequest, AgentRunner, CallOutcome};
use crate::milestone::MilestoneId;
use crate::review::{ReviewReport, ReviewRequest, ReviewScope, Reviewer};
use crate::workspace::{MergeResult, VcsBackend, WorkspaceHealth, WorkspaceRef};

const WORKTREE_ROOT: &str = "/mem/worktrees";
const BASE_DIR: &str = "/mem/base";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ordered record of what the doubles observed, shared between them.
#[derive(Debug, Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn push(&self, entry: String) {
        lock(&self.0).push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e == entry)
    }
}

fn milestone_for(dir: &Path) -> Option<MilestoneId> {
    dir.file_name()?
        .to_str()?
        .strip_prefix("milestone-")?
        .parse()
        .ok()
}

#[derive(Default)]
struct VcsState {
    workspaces: BTreeMap<MilestoneId, WorkspaceRef>,
    stale: BTreeSet<MilestoneId>,
    conflicts: BTreeMap<MilestoneId, Vec<PathBuf>>,
    created: usize,
    destroyed: Vec<MilestoneId>,
    commits: Vec<MilestoneId>,
    merged: Vec<MilestoneId>,
    base_commits: Vec<String>,
}

/// Version control kept entirely in memory.
#[derive(Default)]
pub struct MemoryVcs {
    state: Mutex<VcsState>,
    journal: Arc<Journal>,
}

impl MemoryVcs {
    pub fn sharing(journal: Arc<Journal>) -> Self {
        Self {
            state: Mutex::default(),
            journal,
        }
    }

    pub fn created_count(&self) -> usize {
        lock(&self.state).created
    }

    pub fn mark_stale(&self, milestone: MilestoneId) {
        lock(&self.state).stale.insert(milestone);
    }

    pub fn inject_conflict(&self, milestone: MilestoneId, paths: &[&str]) {
        lock(&self.state)
            .conflicts
            .insert(milestone, paths.iter().map(PathBuf::from).collect());
    }

    pub fn destroyed(&self) -> Vec<MilestoneId> {
        lock(&self.state).destroyed.clone()
    }

    pub fn commits(&self) -> Vec<MilestoneId> {
        lock(&self.state).commits.clone()
    }

    pub fn merged(&self) -> Vec<MilestoneId> {
        lock(&self.state).merged.clone()
    }

    pub fn base_commits(&self) -> Vec<String> {
        lock(&self.state).base_commits.clone()
    }

    pub fn has_workspace(&self, milestone: MilestoneId) -> bool {
        lock(&self.state).workspaces.contains_key(&milestone)
    }
}

#[async_trait]
impl VcsBackend for MemoryVcs {
    async fn create_isolated_workspace(
        &self,
        milestone: MilestoneId,
        _base_ref: &str,
    ) -> Result<WorkspaceRef> {
        let mut state = lock(&self.state);
        if state.workspaces.contains_key(&milestone) {
            bail!("workspace for {} already exists", milestone);
        }
        let workspace = WorkspaceRef {
            milestone,
            branch: format!("milestone/{}", milestone.slug()),
            path: PathBuf::from(WORKTREE_ROOT).join(format!("milestone-{}", milestone.slug())),
        };
        state.workspaces.insert(milestone, workspace.clone());
        state.stale.remove(&milestone);
        state.created += 1;
        Ok(workspace)
    }

    async fn commit(&self, workspace: &WorkspaceRef, _message: &str) -> Result<Option<String>> {
        let mut state = lock(&self.state);
        state.commits.push(workspace.milestone);
        Ok(Some(format!("commit-{}", state.commits.len())))
    }

    async fn merge(
        &self,
        workspace: &WorkspaceRef,
        _base_ref: &str,
        _message: &str,
    ) -> Result<MergeResult> {
        let mut state = lock(&self.state);
        if let Some(paths) = state.conflicts.get(&workspace.milestone) {
            return Ok(MergeResult::Conflict {
                paths: paths.clone(),
            });
        }
        state.merged.push(workspace.milestone);
        self.journal.push(format!("merge {}", workspace.milestone));
        Ok(MergeResult::Merged {
            commit: Some(format!("merge-{}", workspace.milestone)),
        })
    }

    async fn destroy(&self, workspace: &WorkspaceRef) -> Result<()> {
        let mut state = lock(&self.state);
        if state.workspaces.remove(&workspace.milestone).is_some() {
            state.destroyed.push(workspace.milestone);
        }
        Ok(())
    }

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceRef>> {
        Ok(lock(&self.state).workspaces.values().cloned().collect())
    }

    async fn check_health(&self, workspace: &WorkspaceRef) -> Result<WorkspaceHealth> {
        let state = lock(&self.state);
        if state.stale.contains(&workspace.milestone) {
            return Ok(WorkspaceHealth::Stale {
                reason: "marked stale".into(),
            });
        }
        if !state.workspaces.contains_key(&workspace.milestone) {
            return Ok(WorkspaceHealth::Stale {
                reason: "missing".into(),
            });
        }
        Ok(WorkspaceHealth::Healthy)
    }

    async fn commit_base(&self, _base_ref: &str, message: &str) -> Result<String> {
        let mut state = lock(&self.state);
        state.base_commits.push(message.to_string());
        self.journal.push(format!("base-commit {}", message));
        Ok(format!("base-{}", state.base_commits.len()))
    }

    fn base_dir(&self) -> PathBuf {
        PathBuf::from(BASE_DIR)
    }
}

#[derive(Default)]
struct AgentScript {
    outcomes: HashMap<MilestoneId, VecDeque<AgentOutcome>>,
    delays: HashMap<MilestoneId, Duration>,
    calls: Vec<Option<MilestoneId>>,
}

/// Agent whose outcomes are queued per milestone; anything unscripted succeeds.
#[derive(Default)]
pub struct ScriptedAgent {
    script: Mutex<AgentScript>,
    journal: Arc<Journal>,
}

impl ScriptedAgent {
    pub fn sharing(journal: Arc<Journal>) -> Self {
        Self {
            script: Mutex::default(),
            journal,
        }
    }

    pub fn script(&self, milestone: MilestoneId, outcomes: Vec<AgentOutcome>) {
        lock(&self.script)
            .outcomes
            .entry(milestone)
            .or_default()
            .extend(outcomes);
    }

    pub fn set_delay(&self, milestone: MilestoneId, delay: Duration) {
        lock(&self.script).delays.insert(milestone, delay);
    }

    pub fn call_count(&self) -> usize {
        lock(&self.script).calls.len()
    }

    /// Milestones in call order; `None` marks calls outside any workspace.
    pub fn calls(&self) -> Vec<Option<MilestoneId>> {
        lock(&self.script).calls.clone()
    }

    pub fn calls_for(&self, milestone: MilestoneId) -> usize {
        lock(&self.script)
            .calls
            .iter()
            .filter(|c| **c == Some(milestone))
            .count()
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run(&self, request: AgentRequest) -> AgentOutcome {
        let milestone = milestone_for(&request.working_dir);
        let (delay, outcome) = {
            let mut script = lock(&self.script);
            script.calls.push(milestone);
            let delay = milestone.and_then(|id| script.delays.get(&id).copied());
            let outcome = milestone
                .and_then(|id| script.outcomes.get_mut(&id))
                .and_then(|queue| queue.pop_front());
            (delay, outcome)
        };
        if let Some(id) = milestone {
            self.journal.push(format!("agent {}", id));
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome.unwrap_or_else(|| CallOutcome::Success(AgentReply::new("done")))
    }
}

/// Reviewer returning queued scores per scope, 0.95 once a queue is empty.
#[derive(Default)]
pub struct ScriptedReviewer {
    scores: Mutex<HashMap<ReviewScope, VecDeque<f64>>>,
    failures: Mutex<HashMap<ReviewScope, String>>,
    calls: Mutex<Vec<ReviewScope>>,
}

impl ScriptedReviewer {
    pub fn script(&self, scope: ReviewScope, scores: &[f64]) {
        lock(&self.scores)
            .entry(scope)
            .or_default()
            .extend(scores.iter().copied());
    }

    /// Every review of `scope` errors with `message`.
    pub fn fail_with(&self, scope: ReviewScope, message: &str) {
        lock(&self.failures).insert(scope, message.to_string());
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls_for(&self, scope: ReviewScope) -> usize {
        lock(&self.calls).iter().filter(|s| **s == scope).count()
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    async fn review(&self, request: ReviewRequest) -> CallOutcome<ReviewReport> {
        lock(&self.calls).push(request.scope);
        if let Some(message) = lock(&self.failures).get(&request.scope) {
            return CallOutcome::Error {
                message: message.clone(),
            };
        }
        let score = lock(&self.scores)
            .get_mut(&request.scope)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(0.95);
        CallOutcome::Success(ReviewReport::new(
            request.scope,
            score,
            request.threshold,
            Vec::new(),
        ))
    }
}

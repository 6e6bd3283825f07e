//! Milestone and task model.
//!
//! A milestone is identified by `(stage, ordinal)` and rendered as the stage
//! number followed by a letter ordinal: `1A`, `1B`, `2A`, ... `2AA`. Ordering
//! is by stage first, then ordinal, which is also the deterministic merge
//! order inside a stage.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::review::ReviewReport;
use crate::workspace::WorkspaceRef;

/// Identity of a milestone: its stage and its position within the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MilestoneId {
    pub stage: u32,
    pub ordinal: u32,
}

impl MilestoneId {
    pub fn new(stage: u32, ordinal: u32) -> Self {
        Self { stage, ordinal }
    }

    /// Name safe for branches and directory names, e.g. `1a`.
    pub fn slug(&self) -> String {
        self.to_string().to_lowercase()
    }
}

fn ordinal_letters(ordinal: u32) -> String {
    let mut n = ordinal;
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push(char::from(b'A' + (n % 26) as u8));
        n /= 26;
    }
    letters.iter().rev().collect()
}

impl fmt::Display for MilestoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.stage, ordinal_letters(self.ordinal))
    }
}

impl FromStr for MilestoneId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .with_context(|| format!("Milestone id '{}' has no ordinal letters", s))?;
        let (digits, letters) = s.split_at(split);
        if digits.is_empty() {
            bail!("Milestone id '{}' has no stage number", s);
        }
        let stage: u32 = digits
            .parse()
            .with_context(|| format!("Invalid stage number in milestone id '{}'", s))?;

        let mut ordinal: u32 = 0;
        for c in letters.chars() {
            let c = c.to_ascii_uppercase();
            if !c.is_ascii_uppercase() {
                bail!("Invalid ordinal '{}' in milestone id '{}'", letters, s);
            }
            ordinal = ordinal
                .checked_mul(26)
                .and_then(|v| v.checked_add(u32::from(c as u8 - b'A') + 1))
                .with_context(|| format!("Ordinal overflow in milestone id '{}'", s))?;
        }

        Ok(Self { stage, ordinal })
    }
}

impl TryFrom<String> for MilestoneId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MilestoneId> for String {
    fn from(id: MilestoneId) -> Self {
        id.to_string()
    }
}

/// Task priority. Bug-fix work always ranks above feature work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    BugFix,
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::BugFix => write!(f, "bug-fix"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub completed: bool,
}

impl Task {
    pub fn new(description: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            description: description.into(),
            priority,
            completed: false,
        }
    }
}

/// Lifecycle of a milestone pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    #[default]
    Pending,
    Running,
    AwaitingReview,
    Fixing,
    Completed,
    Failed,
}

impl MilestoneStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MilestoneStatus::Completed | MilestoneStatus::Failed)
    }

    /// Whether `next` is a legal successor of this status.
    ///
    /// `Failed -> Running` is allowed so a resumed run can retry a milestone
    /// whose workspace was retained.
    pub fn can_transition_to(&self, next: MilestoneStatus) -> bool {
        use MilestoneStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, AwaitingReview)
                | (Running, Completed)
                | (Running, Failed)
                | (AwaitingReview, Fixing)
                | (AwaitingReview, Completed)
                | (AwaitingReview, Failed)
                | (Fixing, AwaitingReview)
                | (Fixing, Failed)
                | (Failed, Running)
        )
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::Running => "running",
            MilestoneStatus::AwaitingReview => "awaiting review",
            MilestoneStatus::Fixing => "fixing",
            MilestoneStatus::Completed => "completed",
            MilestoneStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// A milestone with its runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub title: String,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub dependencies: BTreeSet<MilestoneId>,
    #[serde(default)]
    pub status: MilestoneStatus,
    #[serde(default)]
    pub workspace: Option<WorkspaceRef>,
    #[serde(default)]
    pub review_history: Vec<ReviewReport>,
}

impl Milestone {
    pub fn new(id: MilestoneId, title: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id,
            title: title.into(),
            tasks,
            dependencies: BTreeSet::new(),
            status: MilestoneStatus::Pending,
            workspace: None,
            review_history: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = MilestoneId>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    /// Tasks in execution order: highest priority first, file order within a priority.
    pub fn ordered_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.iter().filter(|t| !t.completed).collect();
        tasks.sort_by_key(|t| t.priority);
        tasks
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: MilestoneStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            bail!(
                "Illegal status transition for milestone {}: {} -> {}",
                self.id,
                self.status,
                next
            );
        }
        self.status = next;
        if next == MilestoneStatus::Completed {
            self.mark_tasks_completed();
        }
        Ok(())
    }

    /// A completed milestone has completed every one of its tasks.
    pub fn mark_tasks_completed(&mut self) {
        for task in &mut self.tasks {
            task.completed = true;
        }
    }

    pub fn tasks_done(&self) -> usize {
        self.tasks.iter().filter(|t| t.completed).count()
    }

    pub fn latest_review(&self) -> Option<&ReviewReport> {
        self.review_history.last()
    }
}

/// One entry of the preprocessed milestone list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneEntry {
    pub stage: u32,
    pub ordinal: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub dependencies: Vec<MilestoneId>,
}

/// Preprocessed milestone list, read-only input to the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MilestonesFile {
    pub milestones: Vec<MilestoneEntry>,
}

impl MilestonesFile {
    /// Load from JSON, or YAML when the extension is `.yaml`/`.yml`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read milestones file: {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse milestones YAML: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse milestones JSON: {}", path.display()))
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize milestones")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write milestones file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the list and build milestones keyed by identity.
    pub fn into_milestones(self) -> Result<BTreeMap<MilestoneId, Milestone>> {
        let mut milestones = BTreeMap::new();

        for entry in self.milestones {
            if entry.ordinal == 0 {
                bail!("Milestone in stage {} has ordinal 0; ordinals start at 1", entry.stage);
            }
            let id = MilestoneId::new(entry.stage, entry.ordinal);
            let title = if entry.title.is_empty() {
                format!("Milestone {}", id)
            } else {
                entry.title
            };
            let milestone = Milestone::new(id, title, entry.tasks).with_dependencies(entry.dependencies);
            if milestones.insert(id, milestone).is_some() {
                bail!("Duplicate milestone {}", id);
            }
        }

        for milestone in milestones.values() {
            for dep in &milestone.dependencies {
                if !milestones.contains_key(dep) {
                    return Err(crate::errors::OrchestratorError::UnknownDependency {
                        milestone: milestone.id,
                        dependency: *dep,
                    }
                    .into());
                }
                if dep.stage > milestone.id.stage {
                    bail!(
                        "Milestone {} depends on {} from a later stage",
                        milestone.id,
                        dep
                    );
                }
                if *dep == milestone.id {
                    bail!("Milestone {} depends on itself", milestone.id);
                }
            }
        }

        Ok(milestones)
    }
}

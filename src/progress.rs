//! Read-only progress surface.
//!
//! Everything the engine reports goes through [`ProgressHub::emit`]: the
//! event is folded into the in-memory [`ProgressSnapshot`] first and then
//! forwarded to the optional event channel. Reporting collaborators (the
//! terminal UI, `PROGRESS.md`) only ever see owned snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio::sync::{RwLock, mpsc};

use crate::milestone::{Milestone, MilestoneId, MilestoneStatus};
use crate::review::{ReviewReport, ReviewScope};

/// Events emitted during orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    StageStarted {
        stage: u32,
        milestones: Vec<MilestoneId>,
    },
    /// A milestone entered a new lifecycle status.
    StatusChanged {
        milestone: MilestoneId,
        status: MilestoneStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A review pass finished, for a milestone or for the merged stage.
    Reviewed { report: Box<ReviewReport> },
    /// A milestone is waiting on dependencies in its own stage.
    Deferred {
        milestone: MilestoneId,
        waiting_on: Vec<MilestoneId>,
    },
    /// New pipelines are held back until system load drops.
    ResourceWait { reasons: Vec<String> },
    Merged { milestone: MilestoneId },
    MergeConflict {
        milestone: MilestoneId,
        paths: Vec<PathBuf>,
    },
    StageCompleted { stage: u32 },
    RunCompleted { stages: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneProgress {
    pub id: MilestoneId,
    pub title: String,
    pub status: MilestoneStatus,
    #[serde(default)]
    pub tasks_done: usize,
    #[serde(default)]
    pub tasks_total: usize,
    #[serde(default)]
    pub merged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_review: Option<ReviewReport>,
}

/// Point-in-time view of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage: Option<u32>,
    pub milestones: BTreeMap<MilestoneId, MilestoneProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_review: Option<ReviewReport>,
    #[serde(default)]
    pub completed_stages: BTreeSet<u32>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    /// Milestones of one stage, in identity order.
    pub fn stage_milestones(&self, stage: u32) -> impl Iterator<Item = &MilestoneProgress> {
        self.milestones.values().filter(move |m| m.id.stage == stage)
    }

    pub fn count(&self, status: MilestoneStatus) -> usize {
        self.milestones
            .values()
            .filter(|m| m.status == status)
            .count()
    }

    fn apply(&mut self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::StageStarted { stage, .. } => {
                self.stage = Some(*stage);
                self.stage_review = None;
            }
            OrchestratorEvent::StatusChanged {
                milestone,
                status,
                reason,
            } => {
                if let Some(entry) = self.milestones.get_mut(milestone) {
                    entry.status = *status;
                    entry.reason = reason.clone();
                    if *status == MilestoneStatus::Completed {
                        entry.tasks_done = entry.tasks_total;
                    }
                }
            }
            OrchestratorEvent::Reviewed { report } => match report.scope() {
                ReviewScope::Milestone(id) => {
                    if let Some(entry) = self.milestones.get_mut(&id) {
                        entry.latest_review = Some((**report).clone());
                    }
                }
                ReviewScope::Stage(_) => self.stage_review = Some((**report).clone()),
            },
            OrchestratorEvent::Merged { milestone } => {
                if let Some(entry) = self.milestones.get_mut(milestone) {
                    entry.merged = true;
                }
            }
            OrchestratorEvent::StageCompleted { stage } => {
                self.completed_stages.insert(*stage);
            }
            OrchestratorEvent::Deferred { .. }
            | OrchestratorEvent::ResourceWait { .. }
            | OrchestratorEvent::MergeConflict { .. }
            | OrchestratorEvent::RunCompleted { .. } => {}
        }
        self.updated_at = Some(Utc::now());
    }
}

/// Owner of the progress snapshot and the event channel.
#[derive(Debug, Default)]
pub struct ProgressHub {
    snapshot: RwLock<ProgressSnapshot>,
    events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_channel(tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        Self {
            snapshot: RwLock::default(),
            events: Some(tx),
        }
    }

    /// Seed the table with every known milestone.
    pub async fn register<'a>(
        &self,
        milestones: impl IntoIterator<Item = &'a Milestone>,
        merged: &BTreeSet<MilestoneId>,
        completed_stages: &BTreeSet<u32>,
    ) {
        let mut snapshot = self.snapshot.write().await;
        for m in milestones {
            snapshot.milestones.insert(
                m.id,
                MilestoneProgress {
                    id: m.id,
                    title: m.title.clone(),
                    status: m.status,
                    tasks_done: m.tasks_done(),
                    tasks_total: m.tasks.len(),
                    merged: merged.contains(&m.id),
                    reason: None,
                    latest_review: m.latest_review().cloned(),
                },
            );
        }
        snapshot.completed_stages = completed_stages.clone();
    }

    pub async fn emit(&self, event: OrchestratorEvent) {
        self.snapshot.write().await.apply(&event);
        if let Some(tx) = &self.events {
            tx.send(event).ok();
        }
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot.read().await.clone()
    }
}

fn status_mark(status: MilestoneStatus) -> &'static str {
    match status {
        MilestoneStatus::Pending => "[ ]",
        MilestoneStatus::Running | MilestoneStatus::AwaitingReview | MilestoneStatus::Fixing => {
            "[~]"
        }
        MilestoneStatus::Completed => "[x]",
        MilestoneStatus::Failed => "[!]",
    }
}

/// Render the snapshot as the human-facing progress document.
pub fn render_markdown(snapshot: &ProgressSnapshot) -> String {
    let mut out = String::from("# Milestone Progress\n\n");
    if let Some(updated) = snapshot.updated_at {
        let _ = writeln!(out, "_Updated {}_\n", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    let total = snapshot.milestones.len();
    let done = snapshot.count(MilestoneStatus::Completed);
    let _ = writeln!(out, "**Completed:** {}/{}", done, total);
    if let Some(stage) = snapshot.stage {
        let _ = writeln!(out, "**Current stage:** {}", stage);
    }
    out.push('\n');

    let stages: BTreeSet<u32> = snapshot.milestones.keys().map(|id| id.stage).collect();
    for stage in stages {
        let heading = if snapshot.completed_stages.contains(&stage) {
            format!("## Stage {} (complete)", stage)
        } else {
            format!("## Stage {}", stage)
        };
        let _ = writeln!(out, "{}\n", heading);
        let _ = writeln!(out, "| | Milestone | Title | Tasks | Status | Score |");
        let _ = writeln!(out, "|---|---|---|---|---|---|");
        for m in snapshot.stage_milestones(stage) {
            let score = m
                .latest_review
                .as_ref()
                .map(|r| format!("{:.2}", r.score()))
                .unwrap_or_else(|| "-".to_string());
            let status = if m.merged {
                format!("{} (merged)", m.status)
            } else {
                m.status.to_string()
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {}/{} | {} | {} |",
                status_mark(m.status),
                m.id,
                m.title.replace('|', "\\|"),
                m.tasks_done,
                m.tasks_total,
                status,
                score
            );
        }
        let failures: Vec<_> = snapshot
            .stage_milestones(stage)
            .filter(|m| m.reason.is_some())
            .collect();
        if !failures.is_empty() {
            out.push('\n');
            for m in failures {
                let _ = writeln!(out, "- **{}**: {}", m.id, m.reason.as_deref().unwrap_or_default());
                let issues = m.latest_review.iter().filter(|r| !r.passed()).flat_map(|r| r.issues());
                for issue in issues {
                    let _ = writeln!(out, "  - {}", issue);
                }
            }
        }
        out.push('\n');
    }

    if let Some(review) = &snapshot.stage_review {
        let _ = writeln!(
            out,
            "## Last stage review\n\n{}: score {:.2} ({})",
            review.scope(),
            review.score(),
            review.verdict()
        );
        for issue in review.issues() {
            let _ = writeln!(out, "- {}", issue);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milestone::Task;

    fn milestone(s: &str, title: &str) -> Milestone {
        Milestone::new(s.parse().unwrap(), title, vec![Task::new("do it", Default::default())])
    }

    #[tokio::test]
    async fn test_emit_updates_snapshot_and_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = ProgressHub::with_event_channel(tx);
        let ms = [milestone("1A", "Lexer"), milestone("1B", "Parser")];
        hub.register(ms.iter(), &BTreeSet::new(), &BTreeSet::new()).await;

        let id: MilestoneId = "1A".parse().unwrap();
        hub.emit(OrchestratorEvent::StatusChanged {
            milestone: id,
            status: MilestoneStatus::Running,
            reason: None,
        })
        .await;
        let report = ReviewReport::new(ReviewScope::Milestone(id), 0.9, 0.8, vec![]);
        hub.emit(OrchestratorEvent::Reviewed {
            report: Box::new(report),
        })
        .await;

        let snap = hub.snapshot().await;
        assert_eq!(snap.milestones[&id].status, MilestoneStatus::Running);
        assert_eq!(
            snap.milestones[&id].latest_review.as_ref().map(|r| r.score()),
            Some(0.9)
        );

        assert!(matches!(
            rx.recv().await,
            Some(OrchestratorEvent::StatusChanged { .. })
        ));
        assert!(matches!(rx.recv().await, Some(OrchestratorEvent::Reviewed { .. })));
    }

    #[tokio::test]
    async fn test_emit_without_channel() {
        let hub = ProgressHub::new();
        hub.emit(OrchestratorEvent::StageCompleted { stage: 1 }).await;
        assert!(hub.snapshot().await.completed_stages.contains(&1));
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = OrchestratorEvent::Merged {
            milestone: "2B".parse().unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "merged");
        assert_eq!(json["milestone"], "2B");
    }

    #[tokio::test]
    async fn test_render_markdown() {
        let hub = ProgressHub::new();
        let ms = [milestone("1A", "Lexer"), milestone("2A", "Codegen | backend")];
        let merged: BTreeSet<MilestoneId> = ["1A".parse().unwrap()].into_iter().collect();
        let stages: BTreeSet<u32> = [1].into_iter().collect();
        hub.register(ms.iter(), &merged, &stages).await;
        hub.emit(OrchestratorEvent::StatusChanged {
            milestone: "2A".parse().unwrap(),
            status: MilestoneStatus::Failed,
            reason: Some("quality gate exhausted".into()),
        })
        .await;

        let md = render_markdown(&hub.snapshot().await);
        assert!(md.contains("## Stage 1 (complete)"));
        assert!(md.contains("(merged)"));
        assert!(md.contains("Codegen \\| backend"));
        assert!(md.contains("- **2A**: quality gate exhausted"));
        assert!(md.contains("**Completed:** 0/2"));
        assert!(md.contains("| 0/1 |"));
    }

    #[tokio::test]
    async fn test_failed_milestone_lists_review_issues() {
        use crate::review::{IssueKind, IssueSeverity, ReviewIssue};

        let hub = ProgressHub::new();
        let id: MilestoneId = "1A".parse().unwrap();
        let mut m = milestone("1A", "Lexer");
        m.review_history.push(ReviewReport::new(
            ReviewScope::Milestone(id),
            0.4,
            0.8,
            vec![ReviewIssue::new(IssueKind::FailedGate, IssueSeverity::High, "cargo test fails")],
        ));
        hub.register([&m], &BTreeSet::new(), &BTreeSet::new()).await;
        hub.emit(OrchestratorEvent::StatusChanged {
            milestone: id,
            status: MilestoneStatus::Failed,
            reason: Some("quality gate exhausted".into()),
        })
        .await;

        let md = render_markdown(&hub.snapshot().await);
        assert!(md.contains("- **1A**: quality gate exhausted"));
        assert!(md.contains("  - "));
        assert!(md.contains("cargo test fails"));
    }

    #[tokio::test]
    async fn test_completion_fills_task_count() {
        let hub = ProgressHub::new();
        let m = milestone("1A", "Lexer");
        hub.register([&m], &BTreeSet::new(), &BTreeSet::new()).await;
        hub.emit(OrchestratorEvent::StatusChanged {
            milestone: m.id,
            status: MilestoneStatus::Completed,
            reason: None,
        })
        .await;
        let snap = hub.snapshot().await;
        assert_eq!(snap.milestones[&m.id].tasks_done, 1);
        assert!(render_markdown(&snap).contains("| 1/1 |"));
    }
}

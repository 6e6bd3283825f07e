//! Terminal rendering of orchestration events.
//!
//! Three output modes:
//! - `full`: header bar plus one spinner per in-flight milestone
//! - `minimal`: one line per state change
//! - `json`: one serialized event per line

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use crate::milestone::{MilestoneId, MilestoneStatus};
use crate::progress::OrchestratorEvent;
use crate::review::ReviewScope;
use crate::ui::icons::{BLOCKER, CHECK, CLOCK, CROSS, FIXING, MERGE, REVIEW, RUNNING, SPARKLE, STAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    #[default]
    Full,
    Minimal,
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Event-driven progress display for a `run`.
pub struct StageUI {
    mode: UiMode,
    multi: MultiProgress,
    header_bar: ProgressBar,
    milestone_bars: HashMap<MilestoneId, ProgressBar>,
    verbose: bool,
    term: Term,
}

impl StageUI {
    /// `total` sizes the header bar; `already_done` milestones start it off.
    pub fn new(total: usize, already_done: usize, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let header_bar = multi.add(ProgressBar::new(total as u64));
        header_bar.set_style(
            bar_style("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .progress_chars("█▓▒░"),
        );
        header_bar.set_prefix("Milestones");
        header_bar.set_position(already_done as u64);
        header_bar.set_message("Starting...");
        if mode != UiMode::Full {
            header_bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        }

        Self {
            mode,
            multi,
            header_bar,
            milestone_bars: HashMap::new(),
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn handle_event(&mut self, event: &OrchestratorEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &OrchestratorEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &OrchestratorEvent) {
        let line = match event {
            OrchestratorEvent::StageStarted { stage, milestones } => Some(format!(
                "Stage {}: {}",
                stage,
                join_ids(milestones)
            )),
            OrchestratorEvent::StatusChanged {
                milestone,
                status: MilestoneStatus::Completed,
                ..
            } => Some(format!("✓ {}", milestone)),
            OrchestratorEvent::StatusChanged {
                milestone,
                status: MilestoneStatus::Failed,
                reason,
            } => Some(format!(
                "✗ {} ({})",
                milestone,
                reason.as_deref().unwrap_or("failed")
            )),
            OrchestratorEvent::Merged { milestone } => Some(format!("merged {}", milestone)),
            OrchestratorEvent::MergeConflict { milestone, .. } => {
                Some(format!("✗ merge conflict in {}", milestone))
            }
            OrchestratorEvent::StageCompleted { stage } => Some(format!("Stage {} done", stage)),
            OrchestratorEvent::RunCompleted { stages } => {
                Some(format!("Done: {} stage(s)", stages.len()))
            }
            _ => None,
        };
        if let Some(line) = line {
            let _ = writeln!(&self.term, "{}", line);
        }
    }

    fn handle_full(&mut self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::StageStarted { stage, milestones } => {
                self.on_stage_started(*stage, milestones)
            }
            OrchestratorEvent::StatusChanged {
                milestone,
                status,
                reason,
            } => self.on_status_changed(*milestone, *status, reason.as_deref()),
            OrchestratorEvent::Reviewed { report } => {
                let verdict = if report.passed() {
                    style("pass").green()
                } else {
                    style("fail").red()
                };
                let summary = format!(
                    "{} score {:.2} ({}), {} issue(s)",
                    REVIEW,
                    report.score(),
                    verdict,
                    report.issues().len()
                );
                match report.scope() {
                    ReviewScope::Milestone(id) => {
                        if let Some(bar) = self.milestone_bars.get(&id) {
                            bar.set_message(summary.clone());
                        }
                        if self.verbose {
                            self.println(format!("    [{}] {}", id, summary));
                        }
                    }
                    ReviewScope::Stage(stage) => {
                        self.println(format!("  Stage {} review: {}", stage, summary));
                    }
                }
            }
            OrchestratorEvent::Deferred {
                milestone,
                waiting_on,
            } => {
                if self.verbose {
                    self.println(format!(
                        "  {} {} waiting on {}",
                        CLOCK,
                        style(milestone).yellow(),
                        join_ids(waiting_on)
                    ));
                }
            }
            OrchestratorEvent::ResourceWait { reasons } => {
                self.header_bar
                    .set_message(format!("{} paused: {}", BLOCKER, reasons.join("; ")));
            }
            OrchestratorEvent::Merged { milestone } => {
                self.println(format!("  {} Merged {}", MERGE, style(milestone).green()));
            }
            OrchestratorEvent::MergeConflict { milestone, paths } => {
                let files: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                self.println(format!(
                    "  {} Merge conflict in {}: {}",
                    CROSS,
                    style(milestone).red().bold(),
                    files.join(", ")
                ));
            }
            OrchestratorEvent::StageCompleted { stage } => {
                self.println(format!(
                    "{} Stage {} {}",
                    SPARKLE,
                    style(stage).yellow().bold(),
                    style("complete").green()
                ));
            }
            OrchestratorEvent::RunCompleted { stages } => {
                self.header_bar
                    .finish_with_message(format!("{} {} stage(s) complete", CHECK, stages.len()));
            }
        }
    }

    fn on_stage_started(&mut self, stage: u32, milestones: &[MilestoneId]) {
        self.println(String::new());
        self.println(format!(
            "{} {} Stage {} starting: {}",
            STAGE,
            style("═".repeat(40)).cyan(),
            style(stage).yellow().bold(),
            style(join_ids(milestones)).dim()
        ));
        self.header_bar.set_message(format!("Stage {}", stage));
    }

    fn on_status_changed(&mut self, id: MilestoneId, status: MilestoneStatus, reason: Option<&str>) {
        match status {
            MilestoneStatus::Pending => {}
            MilestoneStatus::Running => {
                let bar = self.bar_for(id);
                bar.set_message(format!("{} Running agent...", RUNNING));
            }
            MilestoneStatus::AwaitingReview => {
                let bar = self.bar_for(id);
                bar.set_message(format!("{} Reviewing...", REVIEW));
            }
            MilestoneStatus::Fixing => {
                let bar = self.bar_for(id);
                bar.set_message(format!("{} Applying fixes...", FIXING));
            }
            MilestoneStatus::Completed => {
                if let Some(bar) = self.milestone_bars.remove(&id) {
                    bar.finish_with_message(format!("{} Complete", CHECK));
                }
                self.header_bar.inc(1);
            }
            MilestoneStatus::Failed => {
                let reason = reason.unwrap_or("unknown error");
                if let Some(bar) = self.milestone_bars.remove(&id) {
                    bar.finish_with_message(format!("{} Failed: {}", CROSS, reason));
                }
                self.println(format!(
                    "  {} Milestone {} {}: {}",
                    CROSS,
                    style(id).red().bold(),
                    style("failed").red(),
                    reason
                ));
            }
        }
    }

    fn bar_for(&mut self, id: MilestoneId) -> &ProgressBar {
        let multi = &self.multi;
        self.milestone_bars.entry(id).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_style(bar_style("  {prefix:.bold} {spinner} {msg}"));
            bar.set_prefix(format!("[{}]", id));
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        })
    }

    fn println(&self, line: String) {
        self.multi.println(line).ok();
    }

    /// Stop every spinner left running, e.g. after an error.
    pub fn finish(&mut self) {
        for (_, bar) in self.milestone_bars.drain() {
            bar.abandon();
        }
        if !self.header_bar.is_finished() {
            self.header_bar.abandon();
        }
    }
}

fn join_ids(ids: &[MilestoneId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

//! Review report types for quality gate outputs.
//!
//! ## Types
//!
//! - [`IssueSeverity`]: Severity classification for individual issues
//! - [`IssueKind`]: What kind of marker or finding produced an issue
//! - [`ReviewIssue`]: A single detected issue with optional location
//! - [`ReviewScope`]: Whether a review covered one milestone or a merged stage
//! - [`ReviewReport`]: Immutable output of one review pass
//!
//! ## Example
//!
//! ```
//! use stageforge::milestone::MilestoneId;
//! use stageforge::review::{IssueKind, IssueSeverity, ReviewIssue, ReviewReport, ReviewScope, ReviewVerdict};
//!
//! let issue = ReviewIssue::new(IssueKind::FailedGate, IssueSeverity::High, "unit tests fail")
//!     .with_location("src/parser.rs", Some(42));
//!
//! let report = ReviewReport::new(
//!     ReviewScope::Milestone(MilestoneId::new(1, 1)),
//!     0.9,
//!     0.8,
//!     vec![issue],
//! );
//!
//! // A high-severity issue fails the gate even when the score clears the threshold.
//! assert_eq!(report.verdict(), ReviewVerdict::Fail);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::milestone::MilestoneId;

/// Severity of a review issue, ordered most to least severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Blocks the quality gate until resolved.
    High,
    #[default]
    Medium,
    Low,
}

impl IssueSeverity {
    /// Check if this severity blocks the gate.
    ///
    /// ```
    /// use stageforge::review::IssueSeverity;
    ///
    /// assert!(IssueSeverity::High.is_blocking());
    /// assert!(!IssueSeverity::Medium.is_blocking());
    /// ```
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::High)
    }
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Unresolved TODO/FIXME/XXX marker.
    Todo,
    /// A failed quality gate such as tests or lint.
    FailedGate,
    /// Improvement suggested by the reviewer.
    Recommendation,
    /// Any other reviewer finding.
    Finding,
    /// Synthetic issue recorded when the milestone deadline expired.
    Timeout,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Todo => write!(f, "todo"),
            Self::FailedGate => write!(f, "failed gate"),
            Self::Recommendation => write!(f, "recommendation"),
            Self::Finding => write!(f, "finding"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLocation {
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl fmt::Display for IssueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file.display(), line),
            None => write!(f, "{}", self.file.display()),
        }
    }
}

/// A single issue found by a review pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<IssueLocation>,
}

impl ReviewIssue {
    pub fn new(kind: IssueKind, severity: IssueSeverity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<PathBuf>, line: Option<u32>) -> Self {
        self.location = Some(IssueLocation {
            file: file.into(),
            line,
        });
        self
    }
}

impl fmt::Display for ReviewIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.description)?;
        if let Some(location) = &self.location {
            write!(f, " ({})", location)?;
        }
        Ok(())
    }
}

/// What a review pass covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum ReviewScope {
    Milestone(MilestoneId),
    Stage(u32),
}

impl fmt::Display for ReviewScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Milestone(id) => write!(f, "milestone {}", id),
            Self::Stage(stage) => write!(f, "stage {}", stage),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewVerdict {
    Pass,
    Fail,
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// Output of one review pass. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReport {
    scope: ReviewScope,
    score: f64,
    threshold: f64,
    issues: Vec<ReviewIssue>,
    verdict: ReviewVerdict,
    #[serde(default)]
    iteration: u32,
    created_at: DateTime<Utc>,
}

impl ReviewReport {
    /// Build a report; the verdict is derived from score, threshold and issues.
    ///
    /// The score is clamped into `[0.0, 1.0]`.
    pub fn new(scope: ReviewScope, score: f64, threshold: f64, issues: Vec<ReviewIssue>) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        let blocked = issues.iter().any(|i| i.severity.is_blocking());
        let verdict = if score >= threshold && !blocked {
            ReviewVerdict::Pass
        } else {
            ReviewVerdict::Fail
        };
        Self {
            scope,
            score,
            threshold,
            issues,
            verdict,
            iteration: 0,
            created_at: Utc::now(),
        }
    }

    /// Synthetic failing report for a review loop cut short by its deadline.
    ///
    /// Carries the score and issues of `last` when a pass had already completed.
    pub fn timed_out(
        scope: ReviewScope,
        threshold: f64,
        last: Option<&ReviewReport>,
        after: Duration,
    ) -> Self {
        let (score, mut issues, iteration) = match last {
            Some(report) => (report.score, report.issues.clone(), report.iteration),
            None => (0.0, Vec::new(), 0),
        };
        issues.push(ReviewIssue::new(
            IssueKind::Timeout,
            IssueSeverity::High,
            format!("{} timed out after {}s", scope, after.as_secs()),
        ));
        Self::new(scope, score, threshold, issues).with_iteration(iteration)
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn scope(&self) -> ReviewScope {
        self.scope
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn issues(&self) -> &[ReviewIssue] {
        &self.issues
    }

    pub fn verdict(&self) -> ReviewVerdict {
        self.verdict
    }

    pub fn passed(&self) -> bool {
        self.verdict == ReviewVerdict::Pass
    }

    /// 1-based review pass number within its gate run.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &ReviewIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }

    pub fn blocking_issues(&self) -> impl Iterator<Item = &ReviewIssue> {
        self.issues.iter().filter(|i| i.severity.is_blocking())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ReviewScope {
        ReviewScope::Milestone(MilestoneId::new(1, 1))
    }

    #[test]
    fn test_verdict_pass_at_threshold() {
        let report = ReviewReport::new(scope(), 0.8, 0.8, vec![]);
        assert!(report.passed());
        let report = ReviewReport::new(scope(), 0.79, 0.8, vec![]);
        assert!(!report.passed());
    }

    #[test]
    fn test_low_severity_issues_do_not_block() {
        let issues = vec![ReviewIssue::new(
            IssueKind::Recommendation,
            IssueSeverity::Low,
            "consider caching",
        )];
        let report = ReviewReport::new(scope(), 0.9, 0.8, issues);
        assert!(report.passed());
        assert_eq!(report.blocking_issues().count(), 0);
    }

    #[test]
    fn test_score_is_clamped() {
        assert_eq!(ReviewReport::new(scope(), 1.7, 0.8, vec![]).score(), 1.0);
        assert_eq!(ReviewReport::new(scope(), -0.2, 0.8, vec![]).score(), 0.0);
        assert_eq!(ReviewReport::new(scope(), f64::NAN, 0.8, vec![]).score(), 0.0);
    }

    #[test]
    fn test_timed_out_keeps_last_score_and_adds_issue() {
        let last = ReviewReport::new(scope(), 0.7, 0.8, vec![]).with_iteration(2);
        let report = ReviewReport::timed_out(scope(), 0.8, Some(&last), Duration::from_secs(60));
        assert_eq!(report.score(), 0.7);
        assert_eq!(report.iteration(), 2);
        assert_eq!(report.verdict(), ReviewVerdict::Fail);
        assert_eq!(report.issues_of(IssueKind::Timeout).count(), 1);

        let fresh = ReviewReport::timed_out(scope(), 0.8, None, Duration::from_secs(5));
        assert_eq!(fresh.score(), 0.0);
    }

    #[test]
    fn test_scope_serialization() {
        let json = serde_json::to_value(ReviewScope::Stage(2)).unwrap();
        assert_eq!(json["scope"], "stage");
        assert_eq!(json["id"], 2);
        let json = serde_json::to_value(scope()).unwrap();
        assert_eq!(json["id"], "1A");
    }

    #[test]
    fn test_issue_display_includes_location() {
        let issue = ReviewIssue::new(IssueKind::Todo, IssueSeverity::High, "TODO: handle eof")
            .with_location("src/lexer.rs", Some(10));
        assert_eq!(issue.to_string(), "[high] TODO: handle eof (src/lexer.rs:10)");
    }
}

//! Review system for milestone and stage quality gates.
//!
//! A review pass produces an immutable [`ReviewReport`]. The [`QualityGate`]
//! repeats review → remediation → re-review until the report passes or the
//! iteration budget runs out.
//!
//! ## Components
//!
//! - [`report`]: Review output types
//! - [`parser`]: Extracts score and issues from free-form reviewer output
//! - [`reviewer`]: The [`Reviewer`] seam and its agent-backed implementation
//! - [`gate`]: The iterative quality gate
//!
//! ## Example
//!
//! ```
//! use stageforge::milestone::MilestoneId;
//! use stageforge::review::{parse_review, IssueKind, ReviewScope};
//!
//! let output = "Quality Score: 0.6\nFAILED: cargo test\nTODO: handle empty input";
//! let report = parse_review(output, ReviewScope::Milestone(MilestoneId::new(1, 1)), 0.8, true);
//!
//! assert!(!report.passed());
//! assert_eq!(report.issues_of(IssueKind::FailedGate).count(), 1);
//! ```

pub mod gate;
pub mod parser;
pub mod report;
pub mod reviewer;

pub use gate::{
    Deadline, GateConfig, GateFailure, GateObserver, GateResult, GateRun, NoopObserver,
    QualityGate,
};
pub use parser::parse_review;
pub use report::{
    IssueKind, IssueLocation, IssueSeverity, ReviewIssue, ReviewReport, ReviewScope,
    ReviewVerdict,
};
pub use reviewer::{AgentReviewer, ReviewRequest, Reviewer};

//! Parse free-form reviewer output into a [`ReviewReport`].
//!
//! Two shapes are accepted. A JSON object with a `score` (or `quality_score`)
//! field and an optional `issues` array wins when present. Otherwise the text
//! is scanned for markers. A marker only counts at the start of a line,
//! optionally behind a list bullet:
//!
//! - `Quality Score: 0.85` (also `8.5/10` or `85/100`)
//! - `TODO:` / `FIXME:` / `XXX:` lines
//! - `FAILED:` / `FAIL:` / `❌` lines
//! - `RECOMMENDATION:` / `RECOMMEND:` / `➤` lines

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use super::report::{IssueKind, IssueSeverity, ReviewIssue, ReviewReport, ReviewScope};
use crate::util::extract_json_object;

/// Score assumed when the reviewer does not report one.
pub const DEFAULT_SCORE: f64 = 0.8;

static SCORE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[Qq]uality [Ss]core:?\s*\**\s*([\d.]+)(?:\s*/\s*(10|100)\b)?").unwrap()
});

static TODO_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*]\s*)?(TODO|FIXME|XXX)(?:\([^)]*\))?:\s*(.+?)\s*$").unwrap()
});

static FAILED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*]\s*)?(?:(?:FAILED|FAIL)\b|❌)\s*:?\s*(.+?)\s*$").unwrap()
});

static RECOMMENDATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*]\s*)?(?:(?:RECOMMENDATION|RECOMMEND)\b|➤)\s*:?\s*(.+?)\s*$").unwrap()
});

static LOCATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\w./-]+\.[A-Za-z0-9]+):(\d+)").unwrap());

#[derive(Debug, Deserialize)]
struct JsonReview {
    #[serde(alias = "quality_score")]
    score: Option<f64>,
    #[serde(default)]
    issues: Vec<JsonIssue>,
}

#[derive(Debug, Deserialize)]
struct JsonIssue {
    #[serde(default = "default_json_kind")]
    kind: IssueKind,
    #[serde(default)]
    severity: IssueSeverity,
    description: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u32>,
}

fn default_json_kind() -> IssueKind {
    IssueKind::Finding
}

/// Parse reviewer output into a report.
///
/// When `resolve_todos` is set, TODO markers are high severity and therefore
/// block the gate regardless of score.
pub fn parse_review(
    text: &str,
    scope: ReviewScope,
    threshold: f64,
    resolve_todos: bool,
) -> ReviewReport {
    if let Some(report) = parse_json_review(text, scope, threshold) {
        return report;
    }

    let score = parse_score(text).unwrap_or(DEFAULT_SCORE);
    let mut issues = Vec::new();

    let todo_severity = if resolve_todos {
        IssueSeverity::High
    } else {
        IssueSeverity::Medium
    };
    for caps in TODO_REGEX.captures_iter(text) {
        let marker = &caps[1];
        let body = caps[2].trim();
        issues.push(located(ReviewIssue::new(
            IssueKind::Todo,
            todo_severity,
            format!("{}: {}", marker, body),
        )));
    }

    for caps in FAILED_REGEX.captures_iter(text) {
        let body = caps[1].trim();
        if body.is_empty() {
            continue;
        }
        issues.push(located(ReviewIssue::new(
            IssueKind::FailedGate,
            IssueSeverity::High,
            body,
        )));
    }

    for caps in RECOMMENDATION_REGEX.captures_iter(text) {
        let body = caps[1].trim();
        if body.is_empty() {
            continue;
        }
        issues.push(located(ReviewIssue::new(
            IssueKind::Recommendation,
            IssueSeverity::Low,
            body,
        )));
    }

    ReviewReport::new(scope, score, threshold, issues)
}

fn parse_json_review(text: &str, scope: ReviewScope, threshold: f64) -> Option<ReviewReport> {
    let json = extract_json_object(text)?;
    let review: JsonReview = serde_json::from_str(&json).ok()?;
    let score = normalize_score(review.score?);
    let issues = review
        .issues
        .into_iter()
        .map(|i| {
            let issue = ReviewIssue::new(i.kind, i.severity, i.description);
            match i.file {
                Some(file) => issue.with_location(file, i.line),
                None => issue,
            }
        })
        .collect();
    Some(ReviewReport::new(scope, score, threshold, issues))
}

/// Extract the quality score, normalized into `[0, 1]`.
pub fn parse_score(text: &str) -> Option<f64> {
    let caps = SCORE_REGEX.captures(text)?;
    let raw: f64 = caps[1].trim_end_matches('.').parse().ok()?;
    let value = match caps.get(2).map(|m| m.as_str()) {
        Some("10") => raw / 10.0,
        Some("100") => raw / 100.0,
        _ => normalize_score(raw),
    };
    Some(value.clamp(0.0, 1.0))
}

fn normalize_score(raw: f64) -> f64 {
    if raw <= 1.0 {
        raw
    } else if raw <= 10.0 {
        raw / 10.0
    } else {
        raw / 100.0
    }
}

fn located(issue: ReviewIssue) -> ReviewIssue {
    let location = LOCATION_REGEX
        .captures(&issue.description)
        .and_then(|caps| Some((caps[1].to_string(), caps[2].parse::<u32>().ok()?)));
    match location {
        Some((file, line)) => issue.with_location(file, Some(line)),
        None => issue,
    }
}

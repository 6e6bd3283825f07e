//! Iterative review → fix → re-review loop.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::report::{IssueKind, IssueSeverity, ReviewIssue, ReviewReport, ReviewScope};
use super::reviewer::{ReviewRequest, Reviewer};
use crate::agent::prompt::remediation_prompt;
use crate::agent::{AgentRequest, AgentRunner};
use crate::retry::{CallClass, RateLimitController};

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub threshold: f64,
    pub max_iterations: u32,
    pub auto_fix: bool,
    /// Timeout for each review or remediation call.
    pub call_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            max_iterations: 3,
            auto_fix: true,
            call_timeout: Duration::from_secs(1800),
        }
    }
}

/// Deadline after which the loop is abandoned.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    /// Total budget the deadline was derived from, for reporting.
    pub budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }
}

/// Why a gate run did not pass.
#[derive(Debug, Clone, PartialEq)]
pub enum GateFailure {
    /// `max_iterations` passes (or auto-fix disabled) without reaching the threshold.
    Exhausted,
    TimedOut,
    ReviewUnavailable(String),
    RemediationFailed(String),
    /// An observer could not record a transition.
    Aborted(String),
}

impl std::fmt::Display for GateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateFailure::Exhausted => write!(f, "quality gate exhausted"),
            GateFailure::TimedOut => write!(f, "timed out"),
            GateFailure::ReviewUnavailable(e) => write!(f, "review unavailable: {}", e),
            GateFailure::RemediationFailed(e) => write!(f, "remediation failed: {}", e),
            GateFailure::Aborted(e) => write!(f, "aborted: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateResult {
    /// Last report; synthetic when the loop timed out or no review completed.
    pub report: ReviewReport,
    /// Every report produced, in order, including a synthetic final one.
    pub history: Vec<ReviewReport>,
    pub iterations: u32,
    pub remediations: u32,
    pub failure: Option<GateFailure>,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Hooks for status transitions inside the loop.
///
/// `reviewed` sees every report that ends up in the history, synthetic ones
/// included. An error from any hook stops the loop with [`GateFailure::Aborted`].
#[async_trait]
pub trait GateObserver: Send + Sync {
    async fn reviewing(&self, _iteration: u32) -> anyhow::Result<()> {
        Ok(())
    }
    async fn reviewed(&self, _report: &ReviewReport) -> anyhow::Result<()> {
        Ok(())
    }
    async fn fixing(&self, _iteration: u32) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NoopObserver;

impl GateObserver for NoopObserver {}

/// One scope's gate run.
#[derive(Debug, Clone)]
pub struct GateRun {
    pub scope: ReviewScope,
    pub working_dir: PathBuf,
    pub deadline: Option<Deadline>,
    /// Stage gates never remediate: the base line is only written by merges.
    pub allow_fix: bool,
}

pub struct QualityGate {
    config: GateConfig,
    reviewer: Arc<dyn Reviewer>,
    agent: Arc<dyn AgentRunner>,
    limiter: Arc<RateLimitController>,
}

impl QualityGate {
    pub fn new(
        config: GateConfig,
        reviewer: Arc<dyn Reviewer>,
        agent: Arc<dyn AgentRunner>,
        limiter: Arc<RateLimitController>,
    ) -> Self {
        Self {
            config,
            reviewer,
            agent,
            limiter,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub async fn run(&self, run: GateRun, observer: &dyn GateObserver) -> GateResult {
        let mut history: Vec<ReviewReport> = Vec::new();
        let mut remediations = 0u32;
        let mut iterations = 0u32;

        let mut failure = {
            let passes = self.iterate(&run, observer, &mut history, &mut remediations, &mut iterations);
            match run.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline.at, passes).await {
                    Ok(failure) => failure,
                    Err(_) => Some(GateFailure::TimedOut),
                },
                None => passes.await,
            }
        };

        let (report, synthetic) = match (&failure, run.deadline, history.last()) {
            (Some(GateFailure::TimedOut), Some(deadline), last) => {
                warn!(scope = %run.scope, budget_secs = deadline.budget.as_secs(), "Quality gate timed out");
                let report =
                    ReviewReport::timed_out(run.scope, self.config.threshold, last, deadline.budget);
                (report, true)
            }
            (_, _, Some(last)) => (last.clone(), false),
            (_, _, None) => {
                let reason = failure
                    .as_ref()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "no review performed".to_string());
                let report = ReviewReport::new(
                    run.scope,
                    0.0,
                    self.config.threshold,
                    vec![ReviewIssue::new(IssueKind::Finding, IssueSeverity::High, reason)],
                );
                (report, true)
            }
        };
        if synthetic {
            history.push(report.clone());
            if let Err(e) = observer.reviewed(&report).await {
                warn!(scope = %run.scope, error = %e, "Failed to record synthetic review");
                failure = Some(GateFailure::Aborted(format!("{:#}", e)));
            }
        }

        match &failure {
            None => info!(scope = %run.scope, score = report.score(), iterations, remediations, "Quality gate passed"),
            Some(f) => info!(scope = %run.scope, score = report.score(), iterations, reason = %f, "Quality gate failed"),
        }

        GateResult {
            report,
            history,
            iterations,
            remediations,
            failure,
        }
    }

    async fn iterate(
        &self,
        run: &GateRun,
        observer: &dyn GateObserver,
        history: &mut Vec<ReviewReport>,
        remediations: &mut u32,
        iterations: &mut u32,
    ) -> Option<GateFailure> {
        let max = self.config.max_iterations.max(1);
        for iteration in 1..=max {
            *iterations = iteration;
            if let Err(e) = observer.reviewing(iteration).await {
                return Some(GateFailure::Aborted(format!("{:#}", e)));
            }

            let request = ReviewRequest {
                working_dir: run.working_dir.clone(),
                scope: run.scope,
                threshold: self.config.threshold,
                timeout: self.config.call_timeout,
            };
            let report = match self
                .limiter
                .execute(CallClass::Review, || self.reviewer.review(request.clone()))
                .await
            {
                Ok(report) => report.with_iteration(iteration),
                Err(e) => return Some(GateFailure::ReviewUnavailable(e.to_string())),
            };
            debug!(scope = %run.scope, iteration, score = report.score(), "Review pass");
            history.push(report.clone());
            if let Err(e) = observer.reviewed(&report).await {
                return Some(GateFailure::Aborted(format!("{:#}", e)));
            }

            if report.passed() {
                return None;
            }
            if !self.config.auto_fix || !run.allow_fix || iteration == max {
                return Some(GateFailure::Exhausted);
            }

            if let Err(e) = observer.fixing(iteration).await {
                return Some(GateFailure::Aborted(format!("{:#}", e)));
            }
            *remediations += 1;
            let request = AgentRequest {
                prompt: remediation_prompt(&report),
                working_dir: run.working_dir.clone(),
                timeout: self.config.call_timeout,
            };
            if let Err(e) = self
                .limiter
                .execute(CallClass::Agent, || self.agent.run(request.clone()))
                .await
            {
                return Some(GateFailure::RemediationFailed(e.to_string()));
            }
        }
        Some(GateFailure::Exhausted)
    }
}

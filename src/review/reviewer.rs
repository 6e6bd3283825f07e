//! Review mechanism boundary.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::parser::parse_review;
use super::report::{ReviewReport, ReviewScope};
use crate::agent::prompt::review_prompt;
use crate::agent::{AgentRequest, AgentRunner, CallOutcome};

/// One review invocation.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub working_dir: PathBuf,
    pub scope: ReviewScope,
    pub threshold: f64,
    pub timeout: Duration,
}

/// Produces a [`ReviewReport`] for a workspace or the merged base line.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: ReviewRequest) -> CallOutcome<ReviewReport>;
}

/// Reviewer that asks the agent CLI for a review and parses its output.
pub struct AgentReviewer {
    agent: Arc<dyn AgentRunner>,
    resolve_todos: bool,
}

impl AgentReviewer {
    pub fn new(agent: Arc<dyn AgentRunner>, resolve_todos: bool) -> Self {
        Self {
            agent,
            resolve_todos,
        }
    }

    fn focus(scope: ReviewScope) -> &'static str {
        match scope {
            ReviewScope::Milestone(_) => {
                "Check that every task of this milestone is implemented, that the build and tests pass, and that no TODO, FIXME or XXX markers remain."
            }
            ReviewScope::Stage(_) => {
                "Check that the merged milestones of this stage integrate cleanly: the build and full test suite pass and no pieces contradict each other."
            }
        }
    }
}

#[async_trait]
impl Reviewer for AgentReviewer {
    async fn review(&self, request: ReviewRequest) -> CallOutcome<ReviewReport> {
        let prompt = review_prompt(request.scope, Self::focus(request.scope));
        let outcome = self
            .agent
            .run(AgentRequest {
                prompt,
                working_dir: request.working_dir,
                timeout: request.timeout,
            })
            .await;
        let resolve_todos = self.resolve_todos;
        outcome.map(|reply| parse_review(&reply.output, request.scope, request.threshold, resolve_todos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentOutcome, AgentReply};
    use crate::milestone::MilestoneId;
    use std::sync::Mutex;

    struct CannedAgent {
        output: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentRunner for CannedAgent {
        async fn run(&self, request: AgentRequest) -> AgentOutcome {
            self.prompts.lock().unwrap().push(request.prompt);
            CallOutcome::Success(AgentReply {
                summary: "done".into(),
                output: self.output.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_agent_reviewer_parses_output() {
        let agent = Arc::new(CannedAgent {
            output: "Quality Score: 0.6\nFAILED: cargo test\n".into(),
            prompts: Mutex::new(Vec::new()),
        });
        let reviewer = AgentReviewer::new(agent.clone(), true);
        let scope = ReviewScope::Milestone(MilestoneId::new(1, 1));

        let outcome = reviewer
            .review(ReviewRequest {
                working_dir: PathBuf::from("."),
                scope,
                threshold: 0.8,
                timeout: Duration::from_secs(10),
            })
            .await;

        match outcome {
            CallOutcome::Success(report) => {
                assert_eq!(report.score(), 0.6);
                assert_eq!(report.scope(), scope);
                assert!(!report.passed());
            }
            other => panic!("expected success, got {:?}", other),
        }
        let prompts = agent.prompts.lock().unwrap();
        assert!(prompts[0].contains("milestone 1A"));
    }

    #[tokio::test]
    async fn test_agent_failure_passes_through() {
        struct Throttled;

        #[async_trait]
        impl AgentRunner for Throttled {
            async fn run(&self, _request: AgentRequest) -> AgentOutcome {
                CallOutcome::Throttled {
                    detail: "429".into(),
                }
            }
        }

        let reviewer = AgentReviewer::new(Arc::new(Throttled), true);
        let outcome = reviewer
            .review(ReviewRequest {
                working_dir: PathBuf::from("."),
                scope: ReviewScope::Stage(1),
                threshold: 0.8,
                timeout: Duration::from_secs(10),
            })
            .await;
        assert!(matches!(outcome, CallOutcome::Throttled { .. }));
    }
}

//! External agent boundary.
//!
//! Every external call (code generation, remediation, review) is normalized
//! into a [`CallOutcome`] before any orchestration logic looks at it. The
//! subprocess implementation lives in [`claude`]; prompt assembly in
//! [`prompt`].

pub mod claude;
pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use claude::ClaudeAgent;

/// Normalized result of an external call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome<T> {
    Success(T),
    Timeout { after: Duration },
    Throttled { detail: String },
    Error { message: String },
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }

    /// Map the success payload, keeping failure variants.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CallOutcome<U> {
        match self {
            CallOutcome::Success(v) => CallOutcome::Success(f(v)),
            CallOutcome::Timeout { after } => CallOutcome::Timeout { after },
            CallOutcome::Throttled { detail } => CallOutcome::Throttled { detail },
            CallOutcome::Error { message } => CallOutcome::Error { message },
        }
    }
}

/// What a successful agent invocation reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub summary: String,
    /// Raw stdout, used by the reviewer to parse findings.
    #[serde(default)]
    pub output: String,
}

impl AgentReply {
    pub fn new(summary: impl Into<String>) -> Self {
        let summary = summary.into();
        Self {
            output: summary.clone(),
            summary,
        }
    }
}

pub type AgentOutcome = CallOutcome<AgentReply>;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

/// Abstraction over the external code-generation agent.
///
/// Real implementation: [`ClaudeAgent`]. Tests script outcomes directly.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: AgentRequest) -> AgentOutcome;
}

/// Markers in agent output that indicate external throttling.
const THROTTLE_INDICATORS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "too many requests",
    "overloaded",
    "quota",
];

/// Whether output text carries a throttling signal.
pub fn looks_throttled(text: &str) -> bool {
    let lower = text.to_lowercase();
    THROTTLE_INDICATORS.iter().any(|marker| lower.contains(marker))
}

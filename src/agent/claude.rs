//! Subprocess-backed agent runner.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AgentOutcome, AgentReply, AgentRequest, AgentRunner, CallOutcome, looks_throttled};
use crate::util::truncate_chars;

/// Summary length kept from agent output.
const SUMMARY_CHARS: usize = 400;

/// Runs the configured agent CLI once per request, prompt on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    command: String,
    flags: Vec<String>,
}

impl ClaudeAgent {
    pub fn new(command: impl Into<String>, skip_permissions: bool, extra_args: &[String]) -> Self {
        let mut flags = Vec::new();
        if skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.extend(extra_args.iter().cloned());
        Self {
            command: command.into(),
            flags,
        }
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    async fn invoke(&self, request: &AgentRequest) -> std::io::Result<std::process::Output> {
        let mut child = Command::new(&self.command)
            .args(&self.flags)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        child.wait_with_output().await
    }
}

/// Normalize a finished process into a call outcome.
pub(crate) fn classify_output(status_ok: bool, code: Option<i32>, stdout: &str, stderr: &str) -> AgentOutcome {
    if status_ok {
        let summary = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| truncate_chars(l.trim(), SUMMARY_CHARS))
            .unwrap_or_else(|| "Agent completed".to_string());
        return CallOutcome::Success(AgentReply {
            summary,
            output: stdout.to_string(),
        });
    }

    let combined = format!("{}\n{}", stderr, stdout);
    if looks_throttled(&combined) {
        return CallOutcome::Throttled {
            detail: truncate_chars(combined.trim(), SUMMARY_CHARS),
        };
    }

    let detail = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    CallOutcome::Error {
        message: format!(
            "agent exited with code {}: {}",
            code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
            truncate_chars(detail, SUMMARY_CHARS)
        ),
    }
}

#[async_trait]
impl AgentRunner for ClaudeAgent {
    async fn run(&self, request: AgentRequest) -> AgentOutcome {
        let start = Instant::now();
        debug!(
            command = %self.command,
            dir = %request.working_dir.display(),
            prompt_chars = request.prompt.len(),
            "Spawning agent"
        );

        // Dropping the invoke future on timeout kills the child.
        let output = match tokio::time::timeout(request.timeout, self.invoke(&request)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = %e, command = %self.command, "Failed to run agent");
                return CallOutcome::Error {
                    message: format!("failed to run '{}': {}", self.command, e),
                };
            }
            Err(_) => {
                warn!(timeout_secs = request.timeout.as_secs(), "Agent call timed out");
                return CallOutcome::Timeout {
                    after: request.timeout,
                };
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let outcome = classify_output(output.status.success(), output.status.code(), &stdout, &stderr);
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            success = outcome.is_success(),
            "Agent finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_flags_respect_skip_permissions() {
        let agent = ClaudeAgent::new("claude", true, &["--model".into(), "opus".into()]);
        assert_eq!(
            agent.flags(),
            &["--dangerously-skip-permissions", "--print", "--model", "opus"]
        );
        let agent = ClaudeAgent::new("claude", false, &[]);
        assert_eq!(agent.flags(), &["--print"]);
    }

    #[test]
    fn test_classify_success_uses_last_line_as_summary() {
        let outcome = classify_output(true, Some(0), "working...\nDone: added parser\n\n", "");
        match outcome {
            CallOutcome::Success(reply) => assert_eq!(reply.summary, "Done: added parser"),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_throttle_and_error() {
        let throttled = classify_output(false, Some(1), "", "Error: 429 rate limit exceeded");
        assert!(matches!(throttled, CallOutcome::Throttled { .. }));

        let failed = classify_output(false, Some(2), "", "syntax error");
        match failed {
            CallOutcome::Error { message } => {
                assert!(message.contains("code 2"));
                assert!(message.contains("syntax error"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let dir = tempdir().unwrap();
        let agent = ClaudeAgent::new("stageforge-no-such-agent-binary", false, &[]);
        let outcome = agent
            .run(AgentRequest {
                prompt: "hello".into(),
                working_dir: dir.path().to_path_buf(),
                timeout: Duration::from_secs(5),
            })
            .await;
        assert!(matches!(outcome, CallOutcome::Error { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cat_echoes_prompt_as_summary() {
        let dir = tempdir().unwrap();
        let agent = ClaudeAgent {
            command: "cat".into(),
            flags: vec![],
        };
        let outcome = agent
            .run(AgentRequest {
                prompt: "line one\nall tasks complete\n".into(),
                working_dir: dir.path().to_path_buf(),
                timeout: Duration::from_secs(5),
            })
            .await;
        match outcome {
            CallOutcome::Success(reply) => assert_eq!(reply.summary, "all tasks complete"),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_normalized() {
        let dir = tempdir().unwrap();
        let agent = ClaudeAgent {
            command: "sleep".into(),
            flags: vec!["5".into()],
        };
        let outcome = agent
            .run(AgentRequest {
                prompt: String::new(),
                working_dir: dir.path().to_path_buf(),
                timeout: Duration::from_millis(100),
            })
            .await;
        assert!(matches!(outcome, CallOutcome::Timeout { .. }));
    }
}

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CallClass, ClassState, Clock, RetryPolicy, RetryState, ThrottleState};
use crate::agent::CallOutcome;
use crate::errors::PipelineError;

/// Single owner of the persisted retry state.
///
/// All mutation goes through the internal mutex; the mutex is never held
/// across a sleep or an external call, so a backing-off pipeline does not
/// stall pipelines of other milestones.
pub struct RateLimitController {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<RetryState>,
    store: Option<PathBuf>,
}

impl RateLimitController {
    /// In-memory controller, nothing persisted.
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            state: Mutex::new(RetryState::default()),
            store: None,
        }
    }

    /// Controller backed by a state file, restoring whatever it holds.
    pub fn with_store(
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        path: PathBuf,
    ) -> anyhow::Result<Self> {
        let state = RetryState::load(&path)?;
        for (class, cs) in &state.classes {
            if cs.state != ThrottleState::Normal {
                info!(
                    class = %class,
                    state = %cs.state,
                    backoff_ms = cs.backoff_ms,
                    "Restored rate-limit window"
                );
            }
        }
        Ok(Self {
            policy,
            clock,
            state: Mutex::new(state),
            store: Some(path),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn snapshot(&self) -> RetryState {
        self.state.lock().await.clone()
    }

    pub async fn class_state(&self, class: CallClass) -> ClassState {
        self.state.lock().await.class(class)
    }

    /// Run one logical operation, retrying per policy.
    ///
    /// Throttles and timeouts move the class into Backoff; plain errors wait
    /// the base interval without touching class state. Exhausting
    /// `max_attempts` on throttling marks the class Blocked and returns
    /// [`PipelineError::RateLimitBlocked`]; exhausting it on errors returns
    /// [`PipelineError::AgentFailed`].
    pub async fn execute<T, F, Fut>(&self, class: CallClass, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CallOutcome<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut error_wait = Duration::ZERO;

        loop {
            let wait = self.pending_wait(class).await.max(error_wait);
            if !wait.is_zero() {
                debug!(class = %class, wait_ms = wait.as_millis() as u64, "Backing off before call");
                self.clock.sleep(wait).await;
            }
            error_wait = Duration::ZERO;
            attempts += 1;

            let failure = match op().await {
                CallOutcome::Success(value) => {
                    self.record_success(class).await;
                    return Ok(value);
                }
                CallOutcome::Throttled { detail } => {
                    let err = PipelineError::AgentThrottled { class };
                    warn!(error = %err, attempt = attempts, detail = %detail, "External call throttled");
                    self.record_throttle(class).await;
                    err
                }
                CallOutcome::Timeout { after } => {
                    let err = PipelineError::AgentTimeout { timeout: after };
                    warn!(error = %err, class = %class, attempt = attempts, "External call timed out");
                    self.record_throttle(class).await;
                    err
                }
                CallOutcome::Error { message } => {
                    warn!(class = %class, attempt = attempts, error = %message, "External call failed");
                    error_wait = self.policy.base;
                    PipelineError::AgentFailed { message }
                }
            };

            if attempts >= max_attempts {
                return Err(match failure {
                    PipelineError::AgentFailed { message } => PipelineError::AgentFailed { message },
                    _ => {
                        let wait = self.policy.max_backoff;
                        self.record_blocked(class).await;
                        PipelineError::RateLimitBlocked {
                            class,
                            attempts,
                            wait,
                        }
                    }
                });
            }
        }
    }

    async fn pending_wait(&self, class: CallClass) -> Duration {
        let now = self.clock.now();
        self.state.lock().await.class(class).remaining_wait(now)
    }

    async fn record_success(&self, class: CallClass) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.classes.remove(&class) {
            if previous.state != ThrottleState::Normal {
                info!(class = %class, from = %previous.state, "Rate limit cleared");
            }
            self.persist(&state);
        }
    }

    async fn record_throttle(&self, class: CallClass) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let cs = state.classes.entry(class).or_default();
        cs.consecutive_failures += 1;
        cs.backoff_ms = self.policy.backoff_for(cs.consecutive_failures).as_millis() as u64;
        cs.state = ThrottleState::Backoff;
        cs.last_attempt_at = Some(now);
        self.persist(&state);
    }

    async fn record_blocked(&self, class: CallClass) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let cs = state.classes.entry(class).or_default();
        cs.state = ThrottleState::Blocked;
        cs.backoff_ms = self.policy.max_backoff.as_millis() as u64;
        cs.last_attempt_at = Some(now);
        warn!(
            class = %class,
            wait_secs = self.policy.max_backoff.as_secs(),
            "Rate limit blocked"
        );
        self.persist(&state);
    }

    fn persist(&self, state: &RetryState) {
        if let Some(path) = &self.store
            && let Err(e) = state.save(path)
        {
            warn!(error = %e, path = %path.display(), "Failed to persist retry state");
        }
    }
}

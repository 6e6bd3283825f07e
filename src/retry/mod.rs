//! Rate-limit and retry control for external calls.
//!
//! Each external call class moves through a small state machine:
//!
//! | From    | Event                        | To      |
//! |---------|------------------------------|---------|
//! | Normal  | throttle / timeout           | Backoff |
//! | Backoff | throttle / timeout           | Backoff (interval grows) |
//! | Backoff | success                      | Normal  |
//! | any     | attempts exhausted           | Blocked |
//! | Blocked | success                      | Normal  |
//!
//! The backoff interval for the k-th consecutive throttle is
//! `base * multiplier^(k-1)`, capped at `max_backoff`. Waiting happens
//! through an injected [`Clock`] so tests never sleep, and the state is
//! persisted so a restarted process honors a window opened before it died.

mod clock;
mod controller;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::RateLimitController;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Class of external call; backoff is tracked per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallClass {
    /// Code generation and remediation invocations.
    Agent,
    Review,
}

impl fmt::Display for CallClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallClass::Agent => write!(f, "agent"),
            CallClass::Review => write!(f, "review"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    #[default]
    Normal,
    Backoff,
    Blocked,
}

impl fmt::Display for ThrottleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleState::Normal => write!(f, "normal"),
            ThrottleState::Backoff => write!(f, "backoff"),
            ThrottleState::Blocked => write!(f, "blocked"),
        }
    }
}

/// Observable state of one call class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassState {
    pub state: ThrottleState,
    pub consecutive_failures: u32,
    /// Current backoff interval in milliseconds.
    pub backoff_ms: u64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl ClassState {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Time left in the current window, measured from the last attempt.
    pub fn remaining_wait(&self, now: DateTime<Utc>) -> Duration {
        if self.state == ThrottleState::Normal || self.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let Some(last) = self.last_attempt_at else {
            return self.backoff();
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        self.backoff().saturating_sub(elapsed)
    }
}

/// Process-wide retry state, persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    #[serde(default)]
    pub classes: BTreeMap<CallClass, ClassState>,
}

impl RetryState {
    /// Load from disk; a missing file yields the empty state.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read retry state: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse retry state: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::util::write_json_atomic(path, self)
    }

    pub fn class(&self, class: CallClass) -> ClassState {
        self.classes.get(&class).cloned().unwrap_or_default()
    }
}

/// Backoff policy shared by all call classes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Attempts allowed for one logical operation before it is Blocked.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(900),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Interval after the `consecutive`-th throttle in a row (1-based).
    pub fn backoff_for(&self, consecutive: u32) -> Duration {
        if consecutive == 0 {
            return Duration::ZERO;
        }
        let multiplier = self.multiplier.max(1.0);
        let exponent = i32::try_from(consecutive - 1).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }
}

//! Settings loaded from `.stageforge/stageforge.toml`.
//!
//! Values are layered: file → environment → CLI. Every section and field
//! is optional in the file; missing values take the defaults below.
//!
//! ```toml
//! [execution]
//! max_parallel_tasks = 4
//! task_timeout_secs = 1800
//!
//! [rate_limit]
//! base_backoff_secs = 30
//! backoff_multiplier = 2.0
//! max_backoff_secs = 900
//! max_attempts = 3
//!
//! [git]
//! base_branch = "main"
//! branch_prefix = "milestone/"
//!
//! [review]
//! quality_threshold = 0.8
//! max_iterations = 3
//!
//! [agent]
//! command = "claude"
//! skip_permissions = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::monitor::ResourceThresholds;
use crate::orchestrator::EngineConfig;
use crate::retry::RetryPolicy;
use crate::review::GateConfig;

pub const SETTINGS_FILE: &str = "stageforge.toml";

fn default_max_parallel() -> usize {
    4
}

fn default_task_timeout() -> u64 {
    1800
}

fn default_resource_poll() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_max_parallel")]
    pub max_parallel_tasks: usize,
    /// Budget for one milestone pipeline, review loop included.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_resource_poll")]
    pub resource_poll_secs: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel(),
            task_timeout_secs: default_task_timeout(),
            resource_poll_secs: default_resource_poll(),
        }
    }
}

fn default_base_backoff() -> u64 {
    30
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    900
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            base_backoff_secs: default_base_backoff(),
            backoff_multiplier: default_multiplier(),
            max_backoff_secs: default_max_backoff(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_branch_prefix() -> String {
    "milestone/".to_string()
}

fn default_worktree_dir() -> String {
    ".stageforge/worktrees".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSection {
    /// Branch milestones merge into. Defaults to the checked-out branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Worktree root, relative to the project directory.
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: String,
    #[serde(default = "default_true")]
    pub commit_stage_completion: bool,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            base_branch: None,
            branch_prefix: default_branch_prefix(),
            worktree_dir: default_worktree_dir(),
            commit_stage_completion: true,
        }
    }
}

fn default_threshold() -> f64 {
    0.8
}

fn default_max_iterations() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_true")]
    pub auto_fix: bool,
    /// Treat TODO markers found by review as blocking.
    #[serde(default = "default_true")]
    pub resolve_todos: bool,
    /// Review the merged base line after every stage.
    #[serde(default = "default_true")]
    pub stage_review: bool,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            enabled: true,
            quality_threshold: default_threshold(),
            max_iterations: default_max_iterations(),
            auto_fix: true,
            resolve_todos: true,
            stage_review: true,
        }
    }
}

fn default_blocked_passes() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Consecutive passes without progress before a stage is declared blocked.
    #[serde(default = "default_blocked_passes")]
    pub max_blocked_passes: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_blocked_passes: default_blocked_passes(),
        }
    }
}

fn default_cpu() -> f64 {
    90.0
}

fn default_memory() -> f64 {
    85.0
}

fn default_disk() -> f64 {
    90.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cpu")]
    pub cpu_threshold: f64,
    #[serde(default = "default_memory")]
    pub memory_threshold: f64,
    #[serde(default = "default_disk")]
    pub disk_threshold: f64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_threshold: default_cpu(),
            memory_threshold: default_memory(),
            disk_threshold: default_disk(),
        }
    }
}

fn default_agent_command() -> String {
    "claude".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    /// Appended to the agent command line after the built-in flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            skip_permissions: true,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Write the rolling log file as JSON lines.
    #[serde(default)]
    pub json: bool,
}

/// The complete stageforge.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Overrides given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_parallel: Option<usize>,
    pub base_branch: Option<String>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stageforge.toml")
    }

    /// Load `<state_dir>/stageforge.toml`, or defaults when it doesn't exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(SETTINGS_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize stageforge.toml")
    }

    /// Full layering: file, then process environment, then CLI.
    pub fn resolve(state_dir: &Path, cli: &CliOverrides) -> Result<Self> {
        let mut settings = Self::load_or_default(state_dir)?;
        settings.apply_env(|key| std::env::var(key).ok());
        settings.apply_cli(cli);
        Ok(settings)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cmd) = lookup("STAGEFORGE_AGENT_CMD").or_else(|| lookup("CLAUDE_CMD")) {
            self.agent.command = cmd;
        }
        if let Some(val) = lookup("SKIP_PERMISSIONS") {
            self.agent.skip_permissions = val != "false";
        }
        if let Some(n) = lookup("STAGEFORGE_MAX_PARALLEL").and_then(|v| v.trim().parse().ok()) {
            self.execution.max_parallel_tasks = n;
        }
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(n) = cli.max_parallel {
            self.execution.max_parallel_tasks = n;
        }
        if let Some(branch) = &cli.base_branch {
            self.git.base_branch = Some(branch.clone());
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !(0.0..=1.0).contains(&self.review.quality_threshold) {
            warnings.push(format!(
                "quality_threshold {} is outside [0, 1]",
                self.review.quality_threshold
            ));
        }
        if self.execution.max_parallel_tasks == 0 {
            warnings.push("max_parallel_tasks is 0; at least one task will still run".to_string());
        }
        if self.rate_limit.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "backoff_multiplier {} is below 1; backoff would shrink",
                self.rate_limit.backoff_multiplier
            ));
        }
        if self.review.max_iterations == 0 {
            warnings.push("review max_iterations is 0; the gate can never pass".to_string());
        }
        if self.agent.command.trim().is_empty() {
            warnings.push("agent command is empty".to_string());
        }

        warnings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_base(Duration::from_secs(self.rate_limit.base_backoff_secs))
            .with_multiplier(self.rate_limit.backoff_multiplier)
            .with_max_backoff(Duration::from_secs(self.rate_limit.max_backoff_secs))
            .with_max_attempts(self.rate_limit.max_attempts.max(1))
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            threshold: self.review.quality_threshold,
            max_iterations: self.review.max_iterations.max(1),
            auto_fix: self.review.auto_fix,
            call_timeout: Duration::from_secs(self.execution.task_timeout_secs),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_parallel: self.execution.max_parallel_tasks.max(1),
            task_timeout: Duration::from_secs(self.execution.task_timeout_secs),
            max_blocked_passes: self.scheduler.max_blocked_passes,
            review_enabled: self.review.enabled,
            stage_review: self.review.enabled && self.review.stage_review,
            gate: self.gate_config(),
            commit_stage_completion: self.git.commit_stage_completion,
            resource_poll: Duration::from_secs(self.execution.resource_poll_secs.max(1)),
        }
    }

    pub fn resource_thresholds(&self) -> ResourceThresholds {
        ResourceThresholds {
            cpu: self.monitor.cpu_threshold,
            memory: self.monitor.memory_threshold,
            disk: self.monitor.disk_threshold,
        }
    }
}

/// Commented template written by `stageforge init` and `config init`.
pub const DEFAULT_TEMPLATE: &str = r#"# stageforge configuration

[execution]
max_parallel_tasks = 4
# Budget per milestone, review loop included
task_timeout_secs = 1800
resource_poll_secs = 30

[rate_limit]
base_backoff_secs = 30
backoff_multiplier = 2.0
max_backoff_secs = 900
max_attempts = 3

[git]
# base_branch = "main"
branch_prefix = "milestone/"
worktree_dir = ".stageforge/worktrees"
commit_stage_completion = true

[review]
enabled = true
quality_threshold = 0.8
max_iterations = 3
auto_fix = true
resolve_todos = true
stage_review = true

[scheduler]
max_blocked_passes = 3

[monitor]
enabled = true
cpu_threshold = 90
memory_threshold = 85
disk_threshold = 90

[agent]
command = "claude"
skip_permissions = true
extra_args = []

[logging]
json = false
"#;

//! Configuration schema loaded from YAML with sensible defaults.
//!
//! Every section is a closed record type: unknown keys are ignored and a
//! partial override merges field-by-field through `#[serde(default)]`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for the external LLM CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    #[serde(default = "default_claude_command")]
    pub command: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Canonical model ID pinned after a resolver probe; empty = unresolved.
    #[serde(default)]
    pub resolved_model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_claude_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay schedule (seconds) for non-rate-limited retries.
    #[serde(default = "default_retry_delays")]
    pub retry_delays: Vec<u64>,
    #[serde(default = "default_rate_limit_base_delay")]
    pub rate_limit_base_delay: f64,
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: f64,
}

fn default_claude_command() -> String {
    "claude".to_string()
}

fn default_model() -> String {
    "opus".to_string()
}

fn default_max_turns() -> u32 {
    25
}

fn default_claude_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delays() -> Vec<u64> {
    vec![2, 8, 32]
}

fn default_rate_limit_base_delay() -> f64 {
    5.0
}

fn default_rate_limit_multiplier() -> f64 {
    3.0
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            command: default_claude_command(),
            model: default_model(),
            resolved_model: String::new(),
            max_turns: default_max_turns(),
            timeout_seconds: default_claude_timeout(),
            max_retries: default_max_retries(),
            retry_delays: default_retry_delays(),
            rate_limit_base_delay: default_rate_limit_base_delay(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
        }
    }
}

/// Cycle loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_loop_interval")]
    pub loop_interval_seconds: u64,
    #[serde(default = "default_max_changed_files")]
    pub max_changed_files: i64,
    #[serde(default)]
    pub self_improve: bool,
    #[serde(default)]
    pub push_after_commit: bool,
    #[serde(default)]
    pub plan_changes: bool,
    #[serde(default)]
    pub batch_mode: bool,
    #[serde(default = "default_max_tasks_per_cycle")]
    pub max_tasks_per_cycle: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_feedback_retries")]
    pub max_feedback_retries: usize,
}

fn default_loop_interval() -> u64 {
    30
}

fn default_max_changed_files() -> i64 {
    20
}

fn default_max_tasks_per_cycle() -> usize {
    5
}

fn default_max_batch_size() -> usize {
    3
}

fn default_max_feedback_retries() -> usize {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            loop_interval_seconds: default_loop_interval(),
            max_changed_files: default_max_changed_files(),
            self_improve: false,
            push_after_commit: false,
            plan_changes: false,
            batch_mode: false,
            max_tasks_per_cycle: default_max_tasks_per_cycle(),
            max_batch_size: default_max_batch_size(),
            max_feedback_retries: default_max_feedback_retries(),
        }
    }
}

/// Validation commands run after each change, in lint → tests → build order.
/// An empty command skips its step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub lint_command: String,
    #[serde(default)]
    pub test_command: String,
    #[serde(default)]
    pub build_command: String,
    #[serde(default = "default_lint_timeout")]
    pub lint_timeout: u64,
    #[serde(default = "default_test_timeout")]
    pub test_timeout: u64,
    #[serde(default = "default_build_timeout")]
    pub build_timeout: u64,
}

fn default_lint_timeout() -> u64 {
    60
}

fn default_test_timeout() -> u64 {
    120
}

fn default_build_timeout() -> u64 {
    120
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            lint_command: String::new(),
            test_command: String::new(),
            build_command: String::new(),
            lint_timeout: default_lint_timeout(),
            test_timeout: default_test_timeout(),
            build_timeout: default_build_timeout(),
        }
    }
}

/// Task discovery knobs. Discovery itself runs outside the engine; the
/// schema is parsed here so providers share one config surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enable_test_failures: bool,
    #[serde(default = "default_true")]
    pub enable_lint_errors: bool,
    #[serde(default = "default_true")]
    pub enable_todos: bool,
    #[serde(default)]
    pub enable_coverage: bool,
    #[serde(default)]
    pub enable_claude_ideas: bool,
    #[serde(default)]
    pub enable_quality_review: bool,
    #[serde(default = "default_todo_patterns")]
    pub todo_patterns: Vec<String>,
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default = "default_max_todo_tasks")]
    pub max_todo_tasks: usize,
    #[serde(default)]
    pub discovery_model: String,
    #[serde(default = "default_discovery_max_turns")]
    pub discovery_max_turns: u32,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout: u64,
    #[serde(default)]
    pub discovery_prompt: String,
}

fn default_true() -> bool {
    true
}

fn default_todo_patterns() -> Vec<String> {
    vec!["TODO".into(), "FIXME".into(), "HACK".into()]
}

fn default_exclude_dirs() -> Vec<String> {
    vec![
        "target".into(),
        ".git".into(),
        "node_modules".into(),
        ".venv".into(),
    ]
}

fn default_max_todo_tasks() -> usize {
    10
}

fn default_discovery_max_turns() -> u32 {
    10
}

fn default_discovery_timeout() -> u64 {
    120
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enable_test_failures: true,
            enable_lint_errors: true,
            enable_todos: true,
            enable_coverage: false,
            enable_claude_ideas: false,
            enable_quality_review: false,
            todo_patterns: default_todo_patterns(),
            exclude_dirs: default_exclude_dirs(),
            max_todo_tasks: default_max_todo_tasks(),
            discovery_model: String::new(),
            discovery_max_turns: default_discovery_max_turns(),
            discovery_timeout: default_discovery_timeout(),
            discovery_prompt: String::new(),
        }
    }
}

/// Hard safety limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,
    #[serde(default = "default_max_cycles_per_hour")]
    pub max_cycles_per_hour: usize,
    #[serde(default = "default_max_cost_usd_per_hour")]
    pub max_cost_usd_per_hour: f64,
    #[serde(default = "default_min_disk_space_mb")]
    pub min_disk_space_mb: u64,
    #[serde(default = "default_protected_files")]
    pub protected_files: Vec<String>,
    #[serde(default = "default_max_history_records")]
    pub max_history_records: usize,
}

fn default_max_consecutive_failures() -> usize {
    5
}

fn default_max_cycles_per_hour() -> usize {
    30
}

fn default_max_cost_usd_per_hour() -> f64 {
    10.0
}

fn default_min_disk_space_mb() -> u64 {
    500
}

fn default_protected_files() -> Vec<String> {
    vec!["config.yaml".into()]
}

fn default_max_history_records() -> usize {
    1000
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            max_cycles_per_hour: default_max_cycles_per_hour(),
            max_cost_usd_per_hour: default_max_cost_usd_per_hour(),
            min_disk_space_mb: default_min_disk_space_mb(),
            protected_files: default_protected_files(),
            max_history_records: default_max_history_records(),
        }
    }
}

/// On-disk layout. Relative paths resolve against the orchestrator's cwd
/// except `worktree_base_dir` and `agent_workspace_dir`, which resolve
/// against `target_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_feedback_dir")]
    pub feedback_dir: String,
    #[serde(default = "default_feedback_done_dir")]
    pub feedback_done_dir: String,
    #[serde(default = "default_feedback_failed_dir")]
    pub feedback_failed_dir: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_history_file")]
    pub history_file: String,
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_agent_workspace_dir")]
    pub agent_workspace_dir: String,
}

fn default_feedback_dir() -> String {
    "feedback".to_string()
}

fn default_feedback_done_dir() -> String {
    "feedback/done".to_string()
}

fn default_feedback_failed_dir() -> String {
    "feedback/failed".to_string()
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_history_file() -> String {
    "state/history.json".to_string()
}

fn default_lock_file() -> String {
    "state/lock.pid".to_string()
}

fn default_backup_dir() -> String {
    "state/backups".to_string()
}

fn default_agent_workspace_dir() -> String {
    ".agent_workspace".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            feedback_dir: default_feedback_dir(),
            feedback_done_dir: default_feedback_done_dir(),
            feedback_failed_dir: default_feedback_failed_dir(),
            state_dir: default_state_dir(),
            history_file: default_history_file(),
            lock_file: default_lock_file(),
            backup_dir: default_backup_dir(),
            agent_workspace_dir: default_agent_workspace_dir(),
        }
    }
}

/// How worker branches are folded back into main.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Merge,
    Rebase,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStrategy::Merge => write!(f, "merge"),
            MergeStrategy::Rebase => write!(f, "rebase"),
        }
    }
}

/// Parallel worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_worktree_base_dir")]
    pub worktree_base_dir: String,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default = "default_max_merge_retries")]
    pub max_merge_retries: u32,
    #[serde(default = "default_true")]
    pub cleanup_on_exit: bool,
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout: u64,
}

fn default_max_workers() -> usize {
    3
}

fn default_worktree_base_dir() -> String {
    ".worktrees".to_string()
}

fn default_max_merge_retries() -> u32 {
    2
}

fn default_cleanup_timeout() -> u64 {
    60
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_workers: default_max_workers(),
            worktree_base_dir: default_worktree_base_dir(),
            merge_strategy: MergeStrategy::default(),
            max_merge_retries: default_max_merge_retries(),
            cleanup_on_exit: true,
            cleanup_timeout: default_cleanup_timeout(),
        }
    }
}

/// Per-role settings inside the agent pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRoleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_agent_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_claude_timeout")]
    pub timeout_seconds: u64,
}

fn default_agent_max_turns() -> u32 {
    15
}

impl Default for AgentRoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            max_turns: default_agent_max_turns(),
            timeout_seconds: default_claude_timeout(),
        }
    }
}

/// Planner → Coder → Tester → Reviewer pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPipelineConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    /// 0 falls back to half the hourly cost cap.
    #[serde(default)]
    pub max_pipeline_cost_usd: f64,
    #[serde(default)]
    pub planner: AgentRoleConfig,
    #[serde(default)]
    pub coder: AgentRoleConfig,
    #[serde(default)]
    pub tester: AgentRoleConfig,
    #[serde(default)]
    pub reviewer: AgentRoleConfig,
}

fn default_max_revisions() -> u32 {
    2
}

impl Default for AgentPipelineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_revisions: default_max_revisions(),
            max_pipeline_cost_usd: 0.0,
            planner: AgentRoleConfig::default(),
            coder: AgentRoleConfig::default(),
            tester: AgentRoleConfig::default(),
            reviewer: AgentRoleConfig::default(),
        }
    }
}

/// A single webhook endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_webhook_type")]
    pub r#type: String,
    #[serde(default)]
    pub name: String,
}

fn default_webhook_type() -> String {
    "generic".to_string()
}

/// Per-event enable flags for notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEventsConfig {
    #[serde(default = "default_true")]
    pub on_cycle_success: bool,
    #[serde(default = "default_true")]
    pub on_cycle_failure: bool,
    #[serde(default = "default_true")]
    pub on_consecutive_failure_threshold: bool,
    #[serde(default = "default_true")]
    pub on_cost_limit_exceeded: bool,
    #[serde(default = "default_true")]
    pub on_safety_error: bool,
}

impl Default for NotificationEventsConfig {
    fn default() -> Self {
        Self {
            on_cycle_success: true,
            on_cycle_failure: true,
            on_consecutive_failure_threshold: true,
            on_cost_limit_exceeded: true,
            on_safety_error: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub events: NotificationEventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_log_backup_count")]
    pub backup_count: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "state/auto_claude.log".to_string()
}

fn default_log_max_bytes() -> u64 {
    5_000_000
}

fn default_log_backup_count() -> u32 {
    3
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            max_bytes: default_log_max_bytes(),
            backup_count: default_log_backup_count(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_target_dir")]
    pub target_dir: String,
    #[serde(default)]
    pub claude: ClaudeConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub agent_pipeline: AgentPipelineConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_target_dir() -> String {
    ".".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_dir: default_target_dir(),
            claude: ClaudeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            validation: ValidationConfig::default(),
            discovery: DiscoveryConfig::default(),
            safety: SafetyConfig::default(),
            paths: PathsConfig::default(),
            parallel: ParallelConfig::default(),
            agent_pipeline: AgentPipelineConfig::default(),
            notifications: NotificationsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// The model argument to pass to the CLI: the resolved canonical ID if a
    /// probe pinned one, otherwise the configured alias.
    pub fn effective_model(&self) -> &str {
        if self.resolved_model_is_set() {
            &self.claude.resolved_model
        } else {
            &self.claude.model
        }
    }

    fn resolved_model_is_set(&self) -> bool {
        !self.claude.resolved_model.trim().is_empty()
    }
}

/// Load configuration from a YAML file, merging with defaults.
///
/// A missing file yields all defaults; an unreadable or malformed file is an
/// error (fatal at startup).
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.claude.command, "claude");
        assert_eq!(config.claude.retry_delays, vec![2, 8, 32]);
        assert_eq!(config.orchestrator.loop_interval_seconds, 30);
        assert_eq!(config.safety.max_history_records, 1000);
        assert_eq!(config.parallel.merge_strategy, MergeStrategy::Merge);
        assert!(config.notifications.events.on_safety_error);
        assert_eq!(config.paths.lock_file, "state/lock.pid");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/config.yaml"))).unwrap();
        assert_eq!(config.target_dir, ".");
    }

    #[test]
    fn partial_override_merges_field_by_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "target_dir: /tmp/project\n\
             claude:\n  model: sonnet\n\
             safety:\n  max_cost_usd_per_hour: 2.5\n\
             parallel:\n  enabled: true\n  merge_strategy: rebase\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.target_dir, "/tmp/project");
        assert_eq!(config.claude.model, "sonnet");
        // Untouched fields keep their defaults
        assert_eq!(config.claude.max_turns, 25);
        assert_eq!(config.safety.max_cost_usd_per_hour, 2.5);
        assert_eq!(config.safety.max_cycles_per_hour, 30);
        assert!(config.parallel.enabled);
        assert_eq!(config.parallel.merge_strategy, MergeStrategy::Rebase);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "made_up_section:\n  foo: 1\nclaude:\n  bogus: true\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.claude.command, "claude");
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "claude: [unclosed\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn effective_model_prefers_resolved() {
        let mut config = Config::default();
        assert_eq!(config.effective_model(), "opus");
        config.claude.resolved_model = "claude-opus-4-1".into();
        assert_eq!(config.effective_model(), "claude-opus-4-1");
    }

    #[test]
    fn webhook_type_defaults_to_generic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "notifications:\n  enabled: true\n  webhooks:\n    - url: http://localhost:9/hook\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.notifications.webhooks.len(), 1);
        assert_eq!(config.notifications.webhooks[0].r#type, "generic");
    }
}

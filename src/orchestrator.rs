//! Single-worker orchestration loop operating in place on the main worktree.
//!
//! Same cycle shape as the parallel coordinator, but changes land directly in
//! the target tree: snapshot → invoke tool (optionally plan → execute, or the
//! agent pipeline) → safety → validate → commit-or-rollback → record.

use crate::claude::ClaudeRunner;
use crate::config::Config;
use crate::cycle_state::{CycleState, CycleStateWriter};
use crate::errors::SafetyError;
use crate::feedback::FeedbackManager;
use crate::git::GitManager;
use crate::notify::{NotificationManager, details};
use crate::pipeline::AgentPipeline;
use crate::safety::SafetyGuard;
use crate::state::{CycleRecord, LockedStateManager, now_ts};
use crate::tasks::{Task, TaskProvider, TaskSource};
use crate::validator::Validator;
use anyhow::Result;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

pub struct Orchestrator {
    config: Config,
    state: Arc<LockedStateManager>,
    safety: SafetyGuard,
    claude: Arc<ClaudeRunner>,
    git: GitManager,
    validator: Validator,
    discovery: Box<dyn TaskProvider>,
    feedback: FeedbackManager,
    notifications: NotificationManager,
    cycle_state: Arc<CycleStateWriter>,
    pipeline: Option<Arc<AgentPipeline>>,
    running: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: Config, discovery: Box<dyn TaskProvider>) -> Self {
        let state = Arc::new(LockedStateManager::new(&config));
        let safety = SafetyGuard::new(config.clone(), state.clone());
        let claude = Arc::new(ClaudeRunner::new(config.clone()));
        let git = GitManager::new(&config.target_dir);
        let validator = Validator::new(config.clone());
        let feedback = FeedbackManager::new(&config);
        let notifications = NotificationManager::new(config.notifications.clone());
        let cycle_state = Arc::new(CycleStateWriter::new(&config.paths.state_dir, None));
        let pipeline = if config.agent_pipeline.enabled {
            Some(Arc::new(AgentPipeline::new(
                config.clone(),
                Some(cycle_state.clone()),
            )))
        } else {
            None
        };
        Self {
            config,
            state,
            safety,
            claude,
            git,
            validator,
            discovery,
            feedback,
            notifications,
            cycle_state,
            pipeline,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Run the main loop. With `once`, run a single cycle and exit.
    pub async fn run(&mut self, once: bool) -> Result<()> {
        self.safety.acquire_lock().map_err(|e| {
            error!("Cannot start: {}", e);
            anyhow::anyhow!("{}", e)
        })?;
        let signal_task = self.spawn_signal_handler()?;

        info!("Orchestrator started (once={})", once);
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.cycle().await {
                self.handle_cycle_error(e);
            }

            if once {
                break;
            }

            let mut remaining = self.config.orchestrator.loop_interval_seconds;
            while remaining > 0 && self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                remaining -= 1;
            }
        }
        info!("Orchestrator stopped");
        signal_task.abort();
        self.feedback.cleanup_old();
        self.safety.release_lock();
        Ok(())
    }

    fn handle_cycle_error(&self, e: anyhow::Error) {
        match e.downcast_ref::<SafetyError>() {
            Some(safety_err) => {
                warn!("Pre-flight check failed: {}", safety_err);
                let event = match safety_err {
                    SafetyError::CostLimit { .. } => "cost_limit_exceeded",
                    SafetyError::ConsecutiveFailures { .. } => "consecutive_failure_threshold",
                    _ => "safety_error",
                };
                self.notifications
                    .notify(event, details(&[("error", json!(safety_err.to_string()))]));
            }
            None => error!("Unexpected error in cycle: {:#}", e),
        }
    }

    fn spawn_signal_handler(&self) -> Result<tokio::task::JoinHandle<()>> {
        let running = self.running.clone();
        let claude = self.claude.clone();
        let pipeline = self.pipeline.clone();
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                info!("Received shutdown signal, shutting down gracefully...");
                running.store(false, Ordering::SeqCst);
                claude.terminate();
                if let Some(ref pipeline) = pipeline {
                    pipeline.terminate();
                }
            }
        }))
    }

    /// Run a single orchestration cycle.
    pub async fn cycle(&self) -> Result<()> {
        self.safety.pre_flight_checks().map_err(anyhow::Error::from)?;

        let tasks = self.gather_tasks()?;
        if tasks.is_empty() {
            info!("No tasks found, sleeping...");
            return Ok(());
        }

        let is_batch = tasks.len() > 1 && self.config.orchestrator.batch_mode;
        if is_batch {
            info!("Selected {} tasks for batch processing", tasks.len());
            for (i, task) in tasks.iter().enumerate() {
                info!("  Task {} [priority={}]: {}", i + 1, task.priority, task.description);
            }
        } else {
            info!(
                "Selected task [priority={}]: {}",
                tasks[0].priority, tasks[0].description
            );
        }

        self.backup_orchestrator_files();

        let snapshot = self.git.create_snapshot().await?;
        let pre_existing = self.git.capture_worktree_state().await?;

        self.cycle_state.write(&CycleState {
            phase: "task_selected".to_string(),
            task_description: tasks[0].description.clone(),
            task_type: tasks[0].source.to_string(),
            task_descriptions: tasks.iter().map(|t| t.description.clone()).collect(),
            started_at: now_ts(),
            batch_size: tasks.len(),
            ..Default::default()
        });

        let result = self.cycle_inner(&tasks, is_batch, &snapshot, &pre_existing).await;
        self.cycle_state.clear();
        result
    }

    async fn cycle_inner(
        &self,
        tasks: &[Task],
        is_batch: bool,
        snapshot: &crate::git::Snapshot,
        pre_existing: &std::collections::BTreeSet<String>,
    ) -> Result<()> {
        let mut total_cost = 0.0;
        let mut total_duration = 0.0;
        let mut pipeline_meta: Option<(u32, bool)> = None;

        if let Some(ref pipeline) = self.pipeline {
            let presult = pipeline.run(tasks, &self.git, snapshot).await;
            total_cost += presult.total_cost_usd;
            total_duration += presult.total_duration_seconds;
            pipeline_meta = Some((presult.revision_count, presult.final_review_approved));
            if !presult.success {
                warn!("Agent pipeline failed: {}", presult.error);
                self.git.rollback(Some(snapshot), None).await?;
                self.record(tasks, |r| {
                    r.cost_usd = total_cost;
                    r.duration_seconds = total_duration;
                    r.error = format!("Pipeline failed: {}", presult.error);
                }, pipeline_meta)?;
                self.notify_failure(tasks, &presult.error);
                return Ok(());
            }
        } else if self.config.orchestrator.plan_changes {
            self.cycle_state.update(|s| s.phase = "planning".to_string());
            let plan_prompt = if is_batch {
                build_batch_plan_prompt(tasks, &self.config.safety.protected_files)
            } else {
                build_plan_prompt(&tasks[0], &self.config.safety.protected_files)
            };
            let plan_result = self
                .claude
                .run(&plan_prompt, Some(Path::new(&self.config.target_dir)))
                .await;
            total_cost += plan_result.cost_usd;
            total_duration += plan_result.duration_seconds;

            if !plan_result.success {
                warn!("Planning failed: {}", plan_result.error);
                self.git.rollback(Some(snapshot), None).await?;
                self.record(tasks, |r| {
                    r.cost_usd = total_cost;
                    r.duration_seconds = total_duration;
                    r.error = format!("Planning failed: {}", plan_result.error);
                }, None)?;
                self.notify_failure(tasks, &plan_result.error);
                return Ok(());
            }

            // Clean any accidental changes from the planning phase
            self.git.rollback(Some(snapshot), None).await?;
            info!("Plan created, auto-accepting and executing...");

            self.cycle_state.update(|s| s.phase = "executing".to_string());
            let exec_prompt = if is_batch {
                build_batch_execute_prompt(
                    tasks,
                    &plan_result.result_text,
                    &self.config.safety.protected_files,
                )
            } else {
                build_execute_prompt(
                    &tasks[0],
                    &plan_result.result_text,
                    &self.config.safety.protected_files,
                )
            };
            let exec_result = self
                .claude
                .run(&exec_prompt, Some(Path::new(&self.config.target_dir)))
                .await;
            total_cost += exec_result.cost_usd;
            total_duration += exec_result.duration_seconds;
            if !exec_result.success {
                warn!("Execution failed: {}", exec_result.error);
                self.git.rollback(Some(snapshot), None).await?;
                self.record(tasks, |r| {
                    r.cost_usd = total_cost;
                    r.duration_seconds = total_duration;
                    r.error = exec_result.error.clone();
                }, None)?;
                self.notify_failure(tasks, &exec_result.error);
                return Ok(());
            }
        } else {
            self.cycle_state.update(|s| s.phase = "executing".to_string());
            // Batch mode without planning still covers every task in one
            // comprehensive prompt.
            let prompt = if is_batch {
                build_batch_prompt(tasks, &self.config.safety.protected_files)
            } else {
                build_prompt(&tasks[0], &self.config.safety.protected_files)
            };
            let claude_result = self
                .claude
                .run(&prompt, Some(Path::new(&self.config.target_dir)))
                .await;
            total_cost += claude_result.cost_usd;
            total_duration += claude_result.duration_seconds;
            if !claude_result.success {
                warn!("Tool invocation failed: {}", claude_result.error);
                self.git.rollback(Some(snapshot), None).await?;
                self.record(tasks, |r| {
                    r.cost_usd = total_cost;
                    r.duration_seconds = total_duration;
                    r.error = claude_result.error.clone();
                }, None)?;
                self.notify_failure(tasks, &claude_result.error);
                return Ok(());
            }
        }

        let mut changed_files = self.git.get_new_changed_files(pre_existing).await?;
        let ws_dir = &self.config.paths.agent_workspace_dir;
        let ws_prefix = format!("{}/", ws_dir);
        changed_files.retain(|f| f != ws_dir && !f.starts_with(&ws_prefix));
        if changed_files.is_empty() {
            info!("No files changed, skipping");
            self.record(tasks, |r| {
                r.cost_usd = total_cost;
                r.duration_seconds = total_duration;
                r.error = "No files changed".to_string();
            }, pipeline_meta)?;
            self.notify_failure(tasks, "No files changed");
            return Ok(());
        }

        if let Err(e) = self.safety.post_change_checks(&changed_files) {
            warn!("Post-change safety check failed: {}", e);
            self.git.rollback(Some(snapshot), None).await?;
            let message = e.to_string();
            self.record(tasks, |r| {
                r.cost_usd = total_cost;
                r.duration_seconds = total_duration;
                r.error = message.clone();
            }, pipeline_meta)?;
            self.notifications
                .notify("safety_error", details(&[("error", json!(message))]));
            return Ok(());
        }

        if self.config.orchestrator.self_improve
            && let Some(syntax_err) =
                crate::worker::syntax_check_files(Path::new(&self.config.target_dir), &changed_files)
        {
            warn!("Syntax check failed: {}", syntax_err);
            self.git.rollback(Some(snapshot), None).await?;
            self.record(tasks, |r| {
                r.cost_usd = total_cost;
                r.duration_seconds = total_duration;
                r.error = syntax_err.clone();
            }, pipeline_meta)?;
            self.notify_failure(tasks, &syntax_err);
            return Ok(());
        }

        self.cycle_state.update(|s| s.phase = "validating".to_string());
        let validation = self.validator.validate(None).await?;

        if validation.passed {
            let commit_msg = if is_batch {
                build_batch_commit_message(tasks)
            } else {
                format!(
                    "[auto] {}: {}",
                    tasks[0].source,
                    tasks[0].description.chars().take(80).collect::<String>()
                )
            };
            let commit_hash = self.git.commit(&commit_msg, Some(&changed_files)).await?;
            info!("Cycle succeeded: {}", commit_msg.lines().next().unwrap_or(""));

            if self.config.orchestrator.push_after_commit {
                self.git.push().await?;
            }

            for task in tasks {
                if task.source == TaskSource::Feedback
                    && let Some(ref source_file) = task.source_file
                {
                    self.feedback.mark_done(source_file);
                }
            }

            let summary = validation.summary();
            self.record(tasks, |r| {
                r.success = true;
                r.commit_hash = commit_hash.clone();
                r.cost_usd = total_cost;
                r.duration_seconds = total_duration;
                r.validation_summary = summary.clone();
            }, pipeline_meta)?;
            self.notifications.notify(
                "cycle_success",
                details(&[
                    ("task", json!(tasks[0].description)),
                    ("commit", json!(commit_hash)),
                    ("cost_usd", json!(total_cost)),
                ]),
            );
        } else {
            warn!("Validation failed: {}", validation.summary());
            self.git.rollback(Some(snapshot), None).await?;
            let summary = validation.summary();
            self.record(tasks, |r| {
                r.cost_usd = total_cost;
                r.duration_seconds = total_duration;
                r.validation_summary = summary.clone();
                r.error = "Validation failed".to_string();
            }, pipeline_meta)?;
            self.notify_failure(tasks, &format!("Validation failed: {}", summary));
        }
        Ok(())
    }

    fn notify_failure(&self, tasks: &[Task], error: &str) {
        self.notifications.notify(
            "cycle_failure",
            details(&[
                ("task", json!(tasks.first().map(|t| t.description.clone()))),
                ("error", json!(error)),
            ]),
        );
    }

    fn record(
        &self,
        tasks: &[Task],
        fill: impl FnOnce(&mut CycleRecord),
        pipeline_meta: Option<(u32, bool)>,
    ) -> Result<()> {
        let primary_desc = tasks
            .first()
            .map(|t| t.description.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let mut record = CycleRecord::new(now_ts(), primary_desc);
        record.task_type = tasks
            .first()
            .map(|t| t.source.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        record.task_descriptions = tasks.iter().map(|t| t.description.clone()).collect();
        record.task_types = tasks.iter().map(|t| t.source.to_string()).collect();
        record.task_keys = tasks.iter().map(|t| t.task_key()).collect();
        record.task_source_files = tasks
            .iter()
            .map(|t| t.source_file.clone().unwrap_or_default())
            .collect();
        record.task_line_numbers = tasks.iter().map(|t| t.line_number).collect();
        record.batch_size = tasks.len();
        if let Some((revisions, approved)) = pipeline_meta {
            record.pipeline_mode = Some(true);
            record.pipeline_revision_count = Some(revisions);
            record.pipeline_review_approved = Some(approved);
        }
        fill(&mut record);
        self.state.record_cycle(record)
    }

    /// Gather eligible tasks, respecting batch_mode and max_tasks_per_cycle.
    fn gather_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        let lookback = Duration::from_secs(3600);
        let max_retries = self.config.orchestrator.max_feedback_retries;

        for task in self.feedback.get_pending_feedback() {
            let key = task.task_key();
            let failures =
                self.state
                    .get_task_failure_count(&task.description, "feedback", &key)?;
            if failures >= max_retries {
                warn!("Feedback task failed {} times, moving to failed/", failures);
                if let Some(ref source_file) = task.source_file {
                    self.feedback.mark_failed(source_file);
                }
                continue;
            }
            if !self.state.was_recently_attempted(&task.description, lookback, &key)? {
                tasks.push(task);
            }
        }

        for task in self.discovery.discover() {
            let key = task.task_key();
            if !self.state.was_recently_attempted(&task.description, lookback, &key)? {
                tasks.push(task);
            }
        }

        let limit = if self.config.orchestrator.batch_mode {
            self.config.orchestrator.max_tasks_per_cycle
        } else {
            1
        };
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// With self_improve on, keep a copy of the orchestrator's own sources so
    /// a bad cycle can be restored by hand.
    fn backup_orchestrator_files(&self) {
        if !self.config.orchestrator.self_improve {
            return;
        }
        let backup_dir = Path::new(&self.config.paths.backup_dir);
        if let Err(e) = std::fs::create_dir_all(backup_dir) {
            warn!("Failed to create backup dir: {}", e);
            return;
        }

        let target = Path::new(&self.config.target_dir);
        let mut to_copy = vec![target.join("Cargo.toml")];
        if let Ok(entries) = std::fs::read_dir(target.join("src")) {
            to_copy.extend(
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("rs")),
            );
        }
        for src in to_copy {
            if !src.is_file() {
                continue;
            }
            let Some(name) = src.file_name() else {
                continue;
            };
            if let Err(e) = std::fs::copy(&src, backup_dir.join(name)) {
                warn!("Failed to back up {}: {}", src.display(), e);
            }
        }
    }
}

fn protected_list(protected_files: &[String]) -> String {
    protected_files.join(", ")
}

fn build_prompt(task: &Task, protected_files: &[String]) -> String {
    format!(
        "You are working on the project in the current directory.\n\n\
         TASK: {}\n\n\
         INSTRUCTIONS:\n\
         - Make the minimal changes needed to complete this task.\n\
         - Do NOT run git commands (add, commit, push). The orchestrator handles git.\n\
         - Do NOT modify these protected files: {}\n\
         - Focus on correctness. Run tests if available.\n\
         - If the task is unclear or impossible, make your best effort and explain what you did.\n",
        task.description,
        protected_list(protected_files)
    )
}

fn build_plan_prompt(task: &Task, protected_files: &[String]) -> String {
    format!(
        "You are working on the project in the current directory.\n\n\
         TASK: {}\n\n\
         INSTRUCTIONS:\n\
         - Analyze the codebase and create a detailed plan to complete this task.\n\
         - Do NOT make any changes yet. Only output a plan.\n\
         - List the files you would modify and what changes you would make.\n\
         - Do NOT modify these protected files: {}\n\
         - Be specific about the changes (function names, line numbers, etc.).\n",
        task.description,
        protected_list(protected_files)
    )
}

fn build_execute_prompt(task: &Task, plan: &str, protected_files: &[String]) -> String {
    format!(
        "You are working on the project in the current directory.\n\n\
         TASK: {}\n\n\
         PLAN TO EXECUTE:\n{}\n\n\
         INSTRUCTIONS:\n\
         - Execute the plan above by making the described changes.\n\
         - Do NOT run git commands (add, commit, push). The orchestrator handles git.\n\
         - Do NOT modify these protected files: {}\n\
         - Focus on correctness. Run tests if available.\n\
         - Stick to the plan. Do not deviate unless the plan has an obvious error.\n",
        task.description,
        plan,
        protected_list(protected_files)
    )
}

fn format_task_list(tasks: &[Task]) -> String {
    tasks
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{}. {} [{}]", i + 1, t.description, t.source))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_batch_prompt(tasks: &[Task], protected_files: &[String]) -> String {
    format!(
        "You are working on the project in the current directory.\n\n\
         You have been given a batch of tasks to address in a single comprehensive change.\n\n\
         TASKS:\n{}\n\n\
         INSTRUCTIONS:\n\
         - Make the minimal changes needed to complete ALL tasks above.\n\
         - Do NOT run git commands (add, commit, push). The orchestrator handles git.\n\
         - Do NOT modify these protected files: {}\n\
         - Focus on correctness. Run tests if available.\n\
         - If a task is unclear or impossible, make your best effort and explain what you did.\n",
        format_task_list(tasks),
        protected_list(protected_files)
    )
}

fn build_batch_plan_prompt(tasks: &[Task], protected_files: &[String]) -> String {
    let task_count = tasks.len() + 1;
    format!(
        "You are working on the project in the current directory.\n\n\
         You have been given a batch of tasks to address in a single comprehensive change.\n\n\
         TASKS:\n{}\n\n\
         ADDITIONAL CHECKS (always perform these):\n\
         {}. Check whether any of the above changes require NEW tests to be added. \
         If new functionality is introduced or existing behavior is changed, plan to add or update tests.\n\
         {}. Check whether README.md needs updating to reflect any of the above changes. \
         If user-facing behavior, configuration options, or architecture changed, plan to update README.md.\n\n\
         INSTRUCTIONS:\n\
         - Analyze the codebase and create a detailed, comprehensive plan that addresses ALL tasks above.\n\
         - Do NOT make any changes yet. Only output a plan.\n\
         - List every file you would modify and what changes you would make in each.\n\
         - Do NOT modify these protected files: {}\n\
         - Be specific about the changes (function names, line numbers, etc.).\n\
         - Group related changes together where possible for clarity.\n\
         - Address the tasks in priority order but look for opportunities to combine related changes.\n",
        format_task_list(tasks),
        task_count,
        task_count + 1,
        protected_list(protected_files)
    )
}

fn build_batch_execute_prompt(tasks: &[Task], plan: &str, protected_files: &[String]) -> String {
    format!(
        "You are working on the project in the current directory.\n\n\
         You have been given a batch of tasks to address in a single comprehensive change.\n\n\
         TASKS:\n{}\n\n\
         PLAN TO EXECUTE:\n{}\n\n\
         INSTRUCTIONS:\n\
         - Execute the plan above by making ALL described changes.\n\
         - Do NOT run git commands (add, commit, push). The orchestrator handles git.\n\
         - Do NOT modify these protected files: {}\n\
         - Focus on correctness. Run tests after making changes.\n\
         - Stick to the plan. Do not deviate unless the plan has an obvious error.\n\
         - Make ALL changes in this single session. This is a comprehensive revamp, not incremental.\n",
        format_task_list(tasks),
        plan,
        protected_list(protected_files)
    )
}

fn build_batch_commit_message(tasks: &[Task]) -> String {
    let mut sources: Vec<String> = tasks.iter().map(|t| t.source.to_string()).collect();
    sources.sort();
    sources.dedup();
    let header = format!("[auto] batch({}): {}", tasks.len(), sources.join(", "));
    let body: Vec<String> = tasks
        .iter()
        .map(|t| format!("  - {}", t.description.chars().take(80).collect::<String>()))
        .collect();
    format!("{}\n\n{}", header, body.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::process::Command;
    use tempfile::{TempDir, tempdir};

    struct StaticProvider(Vec<Task>);

    impl TaskProvider for StaticProvider {
        fn discover(&self) -> Vec<Task> {
            self.0.clone()
        }
    }

    fn sh(dir: &Path, cmd: &str) -> String {
        let out = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "command failed: {}\n{}",
            cmd,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    fn setup(cli_body: &str) -> (Config, TempDir) {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        sh(&repo, "git init -q -b main");
        sh(&repo, "git config user.name test");
        sh(&repo, "git config user.email test@test.com");
        fs::write(repo.join("app.txt"), "return a - b\n").unwrap();
        sh(&repo, "git add -A && git commit -q -m init");

        let cli = dir.path().join("fake-claude");
        fs::write(
            &cli,
            format!("#!/bin/sh\nstate={}\n{}\n", dir.path().display(), cli_body),
        )
        .unwrap();
        let mut perms = fs::metadata(&cli).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&cli, perms).unwrap();

        let mut config = Config::default();
        config.target_dir = repo.display().to_string();
        config.claude.command = cli.display().to_string();
        config.claude.max_retries = 0;
        config.paths.state_dir = dir.path().join("state").display().to_string();
        config.paths.history_file = dir.path().join("state/history.json").display().to_string();
        config.paths.lock_file = dir.path().join("state/lock.pid").display().to_string();
        config.paths.backup_dir = dir.path().join("state/backups").display().to_string();
        config.paths.feedback_dir = dir.path().join("feedback").display().to_string();
        config.paths.feedback_done_dir = dir.path().join("feedback/done").display().to_string();
        config.paths.feedback_failed_dir =
            dir.path().join("feedback/failed").display().to_string();
        (config, dir)
    }

    fn orchestrator(config: &Config, tasks: Vec<Task>) -> Orchestrator {
        Orchestrator::new(config.clone(), Box::new(StaticProvider(tasks)))
    }

    fn history(config: &Config) -> Vec<CycleRecord> {
        serde_json::from_str(&fs::read_to_string(&config.paths.history_file).unwrap()).unwrap()
    }

    fn test_failure_task() -> Task {
        Task::new("FAILED tests/test_app.py::test_add - expected 5", 1, TaskSource::TestFailure)
    }

    #[tokio::test]
    async fn happy_cycle_commits_with_auto_subject() {
        let (config, _dir) = setup(
            r#"printf 'return a + b\n' > app.txt
echo '{"result": "fixed", "total_cost_usd": 0.3, "duration_ms": 2000}'"#,
        );
        let repo = config.target_dir.clone();
        let orchestrator = orchestrator(&config, vec![test_failure_task()]);
        orchestrator.cycle().await.unwrap();

        let subject = sh(Path::new(&repo), "git log -1 --format=%s");
        assert!(subject.starts_with("[auto] test_failure: FAILED tests/test_app.py"));
        assert_eq!(
            fs::read_to_string(Path::new(&repo).join("app.txt")).unwrap(),
            "return a + b\n"
        );

        let records = history(&config);
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert!((records[0].cost_usd - 0.3).abs() < 1e-9);
        assert!(!records[0].commit_hash.is_empty());

        // Live cycle state was cleared on completion
        assert!(!Path::new(&config.paths.state_dir).join("current_cycle.json").exists());
    }

    #[tokio::test]
    async fn failed_validation_rolls_back_working_tree() {
        let (mut config, _dir) = setup(
            r#"printf 'return a * b\n' > app.txt
echo '{"result": "broke it"}'"#,
        );
        config.validation.test_command = "grep -q 'return a + b' app.txt".to_string();
        let repo = config.target_dir.clone();
        let head_before = sh(Path::new(&repo), "git rev-parse HEAD");

        let orchestrator = orchestrator(&config, vec![test_failure_task()]);
        orchestrator.cycle().await.unwrap();

        // No new commit; the bad edit was reverted
        assert_eq!(sh(Path::new(&repo), "git rev-parse HEAD"), head_before);
        assert_eq!(
            fs::read_to_string(Path::new(&repo).join("app.txt")).unwrap(),
            "return a - b\n"
        );

        let records = history(&config);
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].error, "Validation failed");
        assert!(records[0].validation_summary.contains("tests: FAIL"));
    }

    #[tokio::test]
    async fn plan_then_execute_runs_two_invocations() {
        let (mut config, dir) = setup(
            r#"case "$*" in
  *"Only output a plan"*)
    echo '{"result": "1. edit app.txt to add", "total_cost_usd": 0.1}';;
  *"PLAN TO EXECUTE"*)
    printf 'return a + b\n' > app.txt
    echo "$*" > "$state/exec-prompt"
    echo '{"result": "executed", "total_cost_usd": 0.2}';;
  *) echo '{"result": "unexpected"}';;
esac"#,
        );
        config.orchestrator.plan_changes = true;
        let orchestrator = orchestrator(&config, vec![test_failure_task()]);
        orchestrator.cycle().await.unwrap();

        let records = history(&config);
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        // Costs from both phases are combined
        assert!((records[0].cost_usd - 0.3).abs() < 1e-9);
        // The execute prompt embedded the plan text
        let exec_prompt = fs::read_to_string(dir.path().join("exec-prompt")).unwrap();
        assert!(exec_prompt.contains("1. edit app.txt to add"));
    }

    #[tokio::test]
    async fn batch_mode_without_plan_sends_one_batch_prompt() {
        let (mut config, dir) = setup(
            r#"echo "$*" > "$state/prompt"
printf 'both done\n' > batch-result.txt
echo '{"result": "ok"}'"#,
        );
        config.orchestrator.batch_mode = true;
        let tasks = vec![
            Task::new("first fix", 2, TaskSource::Lint),
            Task::new("second fix", 3, TaskSource::Todo),
        ];
        let repo = config.target_dir.clone();
        let orchestrator = orchestrator(&config, tasks);
        orchestrator.cycle().await.unwrap();

        let prompt = fs::read_to_string(dir.path().join("prompt")).unwrap();
        assert!(prompt.contains("1. first fix [lint]"));
        assert!(prompt.contains("2. second fix [todo]"));
        assert!(prompt.contains("batch of tasks"));

        let subject = sh(Path::new(&repo), "git log -1 --format=%s");
        assert_eq!(subject.trim(), "[auto] batch(2): lint, todo");

        let records = history(&config);
        assert_eq!(records[0].batch_size, 2);
        assert_eq!(records[0].task_types, vec!["lint", "todo"]);
    }

    #[tokio::test]
    async fn non_batch_mode_takes_only_first_task() {
        let (config, _dir) = setup(
            r#"printf 'x\n' > out.txt
echo '{"result": "ok"}'"#,
        );
        let orchestrator = orchestrator(
            &config,
            vec![
                Task::new("first", 2, TaskSource::Lint),
                Task::new("second", 3, TaskSource::Todo),
            ],
        );
        orchestrator.cycle().await.unwrap();
        let records = history(&config);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].batch_size, 1);
        assert_eq!(records[0].task_description, "first");
    }

    #[tokio::test]
    async fn protected_file_change_is_rolled_back_and_recorded() {
        let (mut config, _dir) = setup(
            r#"printf 'overwritten\n' > config.yaml
echo '{"result": "oops"}'"#,
        );
        config.safety.protected_files = vec!["config.yaml".into()];
        let repo = config.target_dir.clone();
        let orchestrator = orchestrator(&config, vec![test_failure_task()]);
        orchestrator.cycle().await.unwrap();

        assert!(!Path::new(&repo).join("config.yaml").exists());
        let records = history(&config);
        assert!(!records[0].success);
        assert!(records[0].error.contains("Protected files modified"));
    }

    #[tokio::test]
    async fn feedback_is_marked_done_on_success() {
        let (config, dir) = setup(
            r#"printf 'done\n' > wanted.txt
echo '{"result": "ok"}'"#,
        );
        fs::write(dir.path().join("feedback/01-want.md"), "create wanted.txt").unwrap();
        let orchestrator = orchestrator(&config, vec![]);
        orchestrator.cycle().await.unwrap();

        assert!(dir.path().join("feedback/done/01-want.md").exists());
        let records = history(&config);
        assert!(records[0].success);
        assert_eq!(records[0].task_type, "feedback");
    }

    #[tokio::test]
    async fn pipeline_mode_records_pipeline_fields() {
        let (mut config, _dir) = setup(
            r#"case "$*" in
  *CODER*) printf 'return a + b\n' > app.txt;;
  *REVIEWER*) mkdir -p .agent_workspace; printf 'VERDICT: APPROVED\n' > .agent_workspace/review.md;;
esac
echo '{"result": "ok", "total_cost_usd": 0.05}'"#,
        );
        config.agent_pipeline.enabled = true;
        let orchestrator = orchestrator(&config, vec![test_failure_task()]);
        orchestrator.cycle().await.unwrap();

        let records = history(&config);
        assert_eq!(records.len(), 1);
        assert!(records[0].success, "error: {}", records[0].error);
        assert_eq!(records[0].pipeline_mode, Some(true));
        assert_eq!(records[0].pipeline_revision_count, Some(0));
        assert_eq!(records[0].pipeline_review_approved, Some(true));
    }

    #[tokio::test]
    async fn self_improve_backs_up_sources() {
        let (mut config, _dir) = setup(
            r#"printf 'x\n' > out.txt
echo '{"result": "ok"}'"#,
        );
        config.orchestrator.self_improve = true;
        let repo = Path::new(&config.target_dir);
        fs::create_dir_all(repo.join("src")).unwrap();
        fs::write(repo.join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(repo.join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        sh(repo, "git add -A && git commit -q -m sources");

        let orchestrator = orchestrator(&config, vec![test_failure_task()]);
        orchestrator.cycle().await.unwrap();

        let backup_dir = Path::new(&config.paths.backup_dir);
        assert!(backup_dir.join("main.rs").exists());
        assert!(backup_dir.join("Cargo.toml").exists());
    }

    #[test]
    fn batch_commit_message_sorts_and_dedups_sources() {
        let tasks = vec![
            Task::new("a", 2, TaskSource::Todo),
            Task::new("b", 2, TaskSource::Lint),
            Task::new("c", 2, TaskSource::Lint),
        ];
        let msg = build_batch_commit_message(&tasks);
        assert!(msg.starts_with("[auto] batch(3): lint, todo\n\n"));
        assert!(msg.contains("  - a"));
        assert!(msg.contains("  - c"));
    }

    #[test]
    fn batch_plan_prompt_numbers_additional_checks() {
        let tasks = vec![
            Task::new("a", 2, TaskSource::Todo),
            Task::new("b", 2, TaskSource::Lint),
        ];
        let prompt = build_batch_plan_prompt(&tasks, &["main.rs".to_string()]);
        assert!(prompt.contains("3. Check whether any of the above changes require NEW tests"));
        assert!(prompt.contains("4. Check whether README.md needs updating"));
        assert!(prompt.contains("main.rs"));
    }
}

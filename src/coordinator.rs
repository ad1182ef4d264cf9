//! Parallel coordinator: distributes task groups to workers in isolated
//! worktrees and folds validated branches back into main.

use crate::config::{Config, MergeStrategy};
use crate::errors::SafetyError;
use crate::feedback::FeedbackManager;
use crate::git::GitManager;
use crate::notify::{NotificationManager, details};
use crate::safety::SafetyGuard;
use crate::state::{CycleRecord, LockedStateManager, now_ts};
use crate::tasks::{Task, TaskProvider, TaskSource};
use crate::validator::Validator;
use crate::worker::{Worker, WorkerResult};
use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Per-worker cleanup budget.
const WORKER_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ParallelCoordinator {
    config: Config,
    git: GitManager,
    state: Arc<LockedStateManager>,
    safety: SafetyGuard,
    feedback: FeedbackManager,
    discovery: Box<dyn TaskProvider>,
    notifications: NotificationManager,
    running: Arc<AtomicBool>,
    active_workers: Arc<Mutex<Vec<Arc<Worker>>>>,
}

impl ParallelCoordinator {
    pub fn new(config: Config, discovery: Box<dyn TaskProvider>) -> Self {
        let state = Arc::new(LockedStateManager::new(&config));
        let safety = SafetyGuard::new(config.clone(), state.clone());
        let feedback = FeedbackManager::new(&config);
        let notifications = NotificationManager::new(config.notifications.clone());
        let git = GitManager::new(&config.target_dir);
        Self {
            config,
            git,
            state,
            safety,
            feedback,
            discovery,
            notifications,
            running: Arc::new(AtomicBool::new(true)),
            active_workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Main loop: discover tasks, dispatch to workers, merge results.
    pub async fn run(&mut self, once: bool) -> Result<()> {
        self.safety.acquire_lock().map_err(|e| {
            error!("Cannot start: {}", e);
            anyhow::anyhow!("{}", e)
        })?;
        let signal_task = self.spawn_signal_handler()?;

        info!(
            "ParallelCoordinator started (max_workers={}, once={})",
            self.config.parallel.max_workers, once
        );

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.run_cycle().await {
                self.handle_cycle_error(e);
            }

            if once {
                break;
            }

            // Sleep in one-second slices for signal responsiveness
            let mut remaining = self.config.orchestrator.loop_interval_seconds;
            while remaining > 0 && self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                remaining -= 1;
            }
        }

        info!("ParallelCoordinator stopped");
        signal_task.abort();
        self.cleanup_all_worktrees().await;
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
            None => error!("Unexpected error in parallel cycle: {:#}", e),
        }
    }

    fn spawn_signal_handler(&self) -> Result<tokio::task::JoinHandle<()>> {
        let running = self.running.clone();
        let workers = self.active_workers.clone();
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                info!("Received shutdown signal, quiescing workers...");
                running.store(false, Ordering::SeqCst);
                if let Ok(registry) = workers.lock() {
                    for worker in registry.iter() {
                        worker.terminate();
                    }
                }
            }
        }))
    }

    /// Run a single parallel cycle.
    pub async fn run_cycle(&self) -> Result<()> {
        self.safety.pre_flight_checks().map_err(anyhow::Error::from)?;

        let tasks = self.gather_tasks()?;
        if tasks.is_empty() {
            info!("No actionable tasks found");
            return Ok(());
        }

        let mut groups = self.partition_tasks(tasks);

        // Claim feedback files before dispatching so another instance cannot
        // pick up the same work.
        for group in &mut groups {
            group.retain(|task| {
                if task.source != TaskSource::Feedback {
                    return true;
                }
                let Some(ref source_file) = task.source_file else {
                    return true;
                };
                if self.feedback.claim_feedback(source_file) {
                    true
                } else {
                    warn!("Could not claim feedback file {}, skipping", source_file);
                    false
                }
            });
        }
        groups.retain(|g| !g.is_empty());
        if groups.is_empty() {
            return Ok(());
        }

        info!("Dispatching {} task group(s) to parallel workers", groups.len());

        let workers: Vec<Arc<Worker>> = groups
            .into_iter()
            .enumerate()
            .map(|(i, group)| {
                Arc::new(Worker::new(
                    self.config.clone(),
                    group,
                    self.state.clone(),
                    i,
                    &self.config.target_dir,
                ))
            })
            .collect();
        if let Ok(mut registry) = self.active_workers.lock() {
            registry.extend(workers.iter().cloned());
        }

        let mut pool = JoinSet::new();
        for worker in &workers {
            let worker = worker.clone();
            pool.spawn(async move {
                let result = worker.execute().await;
                (worker.worker_id(), result)
            });
        }

        // Consume completions as they arrive, not in submission order.
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok((worker_id, result)) => {
                    let Some(worker) = workers.iter().find(|w| w.worker_id() == worker_id) else {
                        continue;
                    };
                    if let Err(e) = self.process_result(result, worker).await {
                        error!("Error processing result for worker {}: {:#}", worker_id, e);
                    }
                    self.cleanup_worker_with_timeout(worker.clone()).await;
                }
                Err(e) => error!("Worker task failed to join: {}", e),
            }
        }

        if let Ok(mut registry) = self.active_workers.lock() {
            registry.clear();
        }
        self.git.prune_worktrees().await;
        Ok(())
    }

    /// Merge a successful worker branch, record the cycle, settle feedback.
    async fn process_result(&self, mut result: WorkerResult, worker: &Worker) -> Result<()> {
        if result.success {
            if self.merge_worker_branch(worker).await {
                for task in &result.tasks {
                    if task.source == TaskSource::Feedback
                        && let Some(ref source_file) = task.source_file
                    {
                        self.feedback.mark_done_claimed(source_file);
                    }
                }
            } else {
                for task in &result.tasks {
                    if task.source == TaskSource::Feedback
                        && let Some(ref source_file) = task.source_file
                    {
                        self.feedback.unclaim_feedback(source_file);
                    }
                }
                result.success = false;
                result.commit_hash = String::new();
                result.error = "Merge to main failed".to_string();
            }
        } else {
            for task in &result.tasks {
                if task.source == TaskSource::Feedback
                    && let Some(ref source_file) = task.source_file
                {
                    self.feedback.unclaim_feedback(source_file);
                }
            }
        }

        self.record_worker_cycle(&result)?;

        if result.success {
            self.notifications.notify(
                "cycle_success",
                details(&[
                    ("task", json!(result.tasks.first().map(|t| t.description.clone()))),
                    ("commit", json!(result.commit_hash)),
                    ("cost_usd", json!(result.cost_usd)),
                ]),
            );
        } else {
            self.notifications.notify(
                "cycle_failure",
                details(&[
                    ("task", json!(result.tasks.first().map(|t| t.description.clone()))),
                    ("error", json!(result.error)),
                ]),
            );
        }
        Ok(())
    }

    fn record_worker_cycle(&self, result: &WorkerResult) -> Result<()> {
        let primary_desc = result
            .tasks
            .first()
            .map(|t| t.description.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let mut record = CycleRecord::new(now_ts(), primary_desc);
        record.task_type = result
            .tasks
            .first()
            .map(|t| t.source.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        record.success = result.success;
        record.commit_hash = result.commit_hash.clone();
        record.cost_usd = result.cost_usd;
        record.duration_seconds = result.duration_seconds;
        record.validation_summary = result.validation_summary.clone();
        record.error = result.error.clone();
        record.task_descriptions = result.tasks.iter().map(|t| t.description.clone()).collect();
        record.task_types = result.tasks.iter().map(|t| t.source.to_string()).collect();
        record.task_keys = result.tasks.iter().map(|t| t.task_key()).collect();
        record.task_source_files = result
            .tasks
            .iter()
            .map(|t| t.source_file.clone().unwrap_or_default())
            .collect();
        record.task_line_numbers = result.tasks.iter().map(|t| t.line_number).collect();
        record.batch_size = result.tasks.len();
        if result.pipeline_mode {
            record.pipeline_mode = Some(true);
            record.pipeline_revision_count = result.pipeline_revision_count;
            record.pipeline_review_approved = result.pipeline_review_approved;
        }
        self.state.record_cycle(record)
    }

    /// Merge a worker's branch back into main.
    ///
    /// Per attempt: always try fast-forward first; past that, the configured
    /// strategy decides. A rebase that merges re-runs the validator on the
    /// merged tree and hard-resets main when it fails (terminal, no retry).
    /// On exhaustion the branch is left in place for manual inspection.
    async fn merge_worker_branch(&self, worker: &Worker) -> bool {
        let strategy = self.config.parallel.merge_strategy;
        let max_retries = self.config.parallel.max_merge_retries;
        let branch = worker.branch_name();

        let original_branch = match self.git.get_current_branch().await {
            Ok(branch) => branch,
            Err(e) => {
                error!("Failed to determine current branch: {}", e);
                return false;
            }
        };

        for attempt in 0..=max_retries {
            if let Err(e) = self.git.checkout(&original_branch).await {
                error!("Failed to checkout {}: {}", original_branch, e);
                return false;
            }
            let pre_merge = match self.git.create_snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!("Failed to snapshot before merge: {}", e);
                    return false;
                }
            };

            if self.git.merge_ff_only(branch).await.unwrap_or(false) {
                info!(
                    "Worker {}: fast-forward merged branch {} into {}",
                    worker.worker_id(),
                    branch,
                    original_branch
                );
                return true;
            }

            match strategy {
                MergeStrategy::Merge => {
                    if self.git.merge_branch(branch).await.unwrap_or(false) {
                        info!(
                            "Worker {}: auto-merged branch {} into {}",
                            worker.worker_id(),
                            branch,
                            original_branch
                        );
                        return true;
                    }
                    self.git.abort_merge().await;
                    warn!(
                        "Worker {}: merge conflicts on attempt {}/{}",
                        worker.worker_id(),
                        attempt + 1,
                        max_retries + 1
                    );
                }
                MergeStrategy::Rebase => {
                    // The branch is checked out in the worker's worktree, so
                    // the rebase has to run there.
                    let wt_git = GitManager::new(worker.worktree_dir());
                    let rebased = wt_git
                        .rebase_onto(&original_branch, branch)
                        .await
                        .unwrap_or(false);
                    if !rebased {
                        warn!(
                            "Worker {}: rebase failed on attempt {}/{}",
                            worker.worker_id(),
                            attempt + 1,
                            max_retries + 1
                        );
                        continue;
                    }
                    if !self.git.merge_ff_only(branch).await.unwrap_or(false) {
                        warn!("Worker {}: fast-forward failed after rebase", worker.worker_id());
                        continue;
                    }

                    // Re-validate the rebased tree on main
                    let validator = Validator::new(self.config.clone());
                    let passed = match validator
                        .validate(Some(Path::new(&self.config.target_dir)))
                        .await
                    {
                        Ok(validation) if validation.passed => true,
                        Ok(validation) => {
                            warn!(
                                "Worker {}: validation failed after rebase: {}",
                                worker.worker_id(),
                                validation.summary()
                            );
                            false
                        }
                        Err(e) => {
                            warn!(
                                "Worker {}: validation errored after rebase: {}",
                                worker.worker_id(),
                                e
                            );
                            false
                        }
                    };
                    if passed {
                        info!(
                            "Worker {}: rebased and merged branch {} into {}",
                            worker.worker_id(),
                            branch,
                            original_branch
                        );
                        return true;
                    }
                    // Undo the merge and give up (terminal, not a retry)
                    if let Err(e) = self.git.reset_hard(&pre_merge.commit_hash).await {
                        error!("Failed to reset main after rebase validation: {}", e);
                    }
                    return false;
                }
            }
        }

        error!(
            "Worker {}: all merge strategies failed for branch {}. \
             Leaving branch for manual review.",
            worker.worker_id(),
            branch
        );
        if let Err(e) = self.git.checkout(&original_branch).await {
            warn!("Failed to return to {}: {}", original_branch, e);
        }
        false
    }

    /// Gather all eligible tasks: feedback first, then auto-discovered ones,
    /// filtering out recently-attempted work and feedback over the retry
    /// ceiling.
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

        Ok(tasks)
    }

    /// Split tasks into at most `max_workers` groups.
    ///
    /// Each feedback task gets its own worker (human-authored, highest
    /// priority). Remaining slots get auto-discovered tasks grouped by
    /// source, split into chunks of `max_batch_size`.
    pub fn partition_tasks(&self, tasks: Vec<Task>) -> Vec<Vec<Task>> {
        let max_workers = self.config.parallel.max_workers;
        let max_batch = self.config.orchestrator.max_batch_size.max(1);
        let mut groups: Vec<Vec<Task>> = Vec::new();

        let (feedback_tasks, auto_tasks): (Vec<Task>, Vec<Task>) = tasks
            .into_iter()
            .partition(|t| t.source == TaskSource::Feedback);

        for task in feedback_tasks {
            if groups.len() < max_workers {
                groups.push(vec![task]);
            }
        }

        if groups.len() < max_workers && !auto_tasks.is_empty() {
            // Group by source, preserving first-seen order
            let mut source_order: Vec<TaskSource> = Vec::new();
            let mut by_source: HashMap<TaskSource, Vec<Task>> = HashMap::new();
            for task in auto_tasks {
                if !by_source.contains_key(&task.source) {
                    source_order.push(task.source);
                }
                by_source.entry(task.source).or_default().push(task);
            }

            let mut chunks: Vec<Vec<Task>> = Vec::new();
            for source in source_order {
                let Some(source_tasks) = by_source.remove(&source) else {
                    continue;
                };
                let mut source_tasks = source_tasks.into_iter().peekable();
                while source_tasks.peek().is_some() {
                    chunks.push(source_tasks.by_ref().take(max_batch).collect());
                }
            }

            for chunk in chunks {
                if groups.len() >= max_workers {
                    break;
                }
                groups.push(chunk);
            }
        }

        groups.retain(|g| !g.is_empty());
        groups
    }

    /// Clean up one worker's worktree and branch within a bounded budget; on
    /// timeout the (detached) cleanup task is abandoned.
    async fn cleanup_worker_with_timeout(&self, worker: Arc<Worker>) {
        let worker_id = worker.worker_id();
        let handle = tokio::spawn(async move { worker.cleanup().await });
        if tokio::time::timeout(WORKER_CLEANUP_TIMEOUT, handle).await.is_err() {
            warn!(
                "Worker {}: cleanup timed out after {}s, abandoning",
                worker_id,
                WORKER_CLEANUP_TIMEOUT.as_secs()
            );
        }
    }

    /// Remove all worker worktrees on shutdown, bounded by `cleanup_timeout`.
    async fn cleanup_all_worktrees(&self) {
        if !self.config.parallel.cleanup_on_exit {
            return;
        }
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let git = GitManager::new(&config.target_dir);
            let worktree_base =
                Path::new(&config.target_dir).join(&config.parallel.worktree_base_dir);
            if worktree_base.exists()
                && let Ok(entries) = std::fs::read_dir(&worktree_base)
            {
                for entry in entries.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    let is_worker_dir = path.is_dir()
                        && path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.starts_with("worker-"))
                            .unwrap_or(false);
                    if !is_worker_dir {
                        continue;
                    }
                    if let Err(e) = git.remove_worktree(&path, true).await {
                        warn!(
                            "Failed to git-remove worktree {} ({}), falling back to rmtree",
                            path.display(),
                            e
                        );
                        let _ = std::fs::remove_dir_all(&path);
                    }
                }
                // Remove the base directory if it is now empty
                let empty = std::fs::read_dir(&worktree_base)
                    .map(|mut entries| entries.next().is_none())
                    .unwrap_or(false);
                if empty {
                    let _ = std::fs::remove_dir(&worktree_base);
                }
            }
            git.prune_worktrees().await;
        });

        let budget = Duration::from_secs(self.config.parallel.cleanup_timeout);
        if tokio::time::timeout(budget, handle).await.is_err() {
            warn!(
                "Worktree cleanup timed out after {}s, abandoning remaining cleanup",
                budget.as_secs()
            );
        } else {
            info!("Cleaned up all worktrees");
        }
    }
}

//! Worker: runs a task group in an isolated git worktree.
//!
//! Each worker creates its own worktree on a dedicated branch, runs the
//! standard cycle logic (build prompt → invoke tool → safety → validate →
//! commit), and returns a `WorkerResult`. The coordinator is responsible for
//! merging the branch back into main and for cleanup.

use crate::claude::ClaudeRunner;
use crate::config::Config;
use crate::cycle_state::{CycleState, CycleStateWriter};
use crate::git::GitManager;
use crate::pipeline::AgentPipeline;
use crate::safety::SafetyGuard;
use crate::state::{LockedStateManager, now_ts};
use crate::tasks::Task;
use crate::validator::Validator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Branch namespace reserved for worker branches.
pub const BRANCH_PREFIX: &str = "auto-claude";

#[derive(Debug, Clone, Default)]
pub struct WorkerResult {
    pub success: bool,
    pub branch_name: String,
    pub commit_hash: String,
    pub cost_usd: f64,
    pub duration_seconds: f64,
    pub validation_summary: String,
    pub error: String,
    pub tasks: Vec<Task>,
    pub pipeline_mode: bool,
    pub pipeline_revision_count: Option<u32>,
    pub pipeline_review_approved: Option<bool>,
}

pub struct Worker {
    config: Config,
    tasks: Vec<Task>,
    state: Arc<LockedStateManager>,
    worker_id: usize,
    main_repo_dir: PathBuf,
    branch_name: String,
    worktree_dir: PathBuf,
    runner: Arc<ClaudeRunner>,
    pipeline: Option<Arc<AgentPipeline>>,
}

impl Worker {
    pub fn new(
        config: Config,
        tasks: Vec<Task>,
        state: Arc<LockedStateManager>,
        worker_id: usize,
        main_repo_dir: impl Into<PathBuf>,
    ) -> Self {
        let main_repo_dir = main_repo_dir.into();
        let branch_name = format!("{}/{}-{}", BRANCH_PREFIX, now_ts() as u64, worker_id);
        let worktree_dir = main_repo_dir
            .join(&config.parallel.worktree_base_dir)
            .join(format!("worker-{}", worker_id));
        let runner = Arc::new(ClaudeRunner::new(config.clone()));
        let pipeline = if config.agent_pipeline.enabled {
            // The pipeline's agents and workspace live inside the worktree.
            let mut wt_config = config.clone();
            wt_config.target_dir = worktree_dir.display().to_string();
            Some(Arc::new(AgentPipeline::new(wt_config, None)))
        } else {
            None
        };
        Self {
            config,
            tasks,
            state,
            worker_id,
            main_repo_dir,
            branch_name,
            worktree_dir,
            runner,
            pipeline,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn worktree_dir(&self) -> &Path {
        &self.worktree_dir
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Kill the active tool subprocess (direct or pipeline mode).
    pub fn terminate(&self) {
        match &self.pipeline {
            Some(pipeline) => pipeline.terminate(),
            None => self.runner.terminate(),
        }
    }

    /// Full worker lifecycle: create worktree → run tool → validate → commit.
    pub async fn execute(&self) -> WorkerResult {
        let start = Instant::now();

        if let Err(e) = self.setup_worktree().await {
            warn!("Worker {}: failed to create worktree: {}", self.worker_id, e);
            return self.failure(format!("Worktree setup failed: {}", e), 0.0, start);
        }

        let cycle_state = CycleStateWriter::new(&self.config.paths.state_dir, Some(self.worker_id));
        let result = self.execute_in_worktree(&cycle_state, start).await;
        cycle_state.clear();
        result
    }

    async fn execute_in_worktree(
        &self,
        cycle_state: &CycleStateWriter,
        start: Instant,
    ) -> WorkerResult {
        let git = GitManager::new(&self.worktree_dir);
        let is_batch = self.tasks.len() > 1;
        let mut total_cost = 0.0;
        let mut pipeline_meta: Option<(u32, bool)> = None;

        cycle_state.write(&CycleState {
            phase: "executing".to_string(),
            task_description: self.tasks.first().map(|t| t.description.clone()).unwrap_or_default(),
            task_type: self
                .tasks
                .first()
                .map(|t| t.source.to_string())
                .unwrap_or_default(),
            task_descriptions: self.tasks.iter().map(|t| t.description.clone()).collect(),
            started_at: now_ts(),
            batch_size: self.tasks.len(),
            ..Default::default()
        });

        info!(
            "Worker {}: invoking tool for {} task(s) in {}",
            self.worker_id,
            self.tasks.len(),
            self.worktree_dir.display()
        );

        if let Some(ref pipeline) = self.pipeline {
            let snapshot = match git.create_snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    return self.failure(format!("Snapshot failed: {}", e), total_cost, start);
                }
            };
            let presult = pipeline.run(&self.tasks, &git, &snapshot).await;
            total_cost += presult.total_cost_usd;
            pipeline_meta = Some((presult.revision_count, presult.final_review_approved));
            if !presult.success {
                warn!("Worker {}: pipeline failed: {}", self.worker_id, presult.error);
                let mut result = self.failure(presult.error, total_cost, start);
                self.attach_pipeline_meta(&mut result, pipeline_meta);
                return result;
            }
        } else {
            let prompt = self.build_prompt(is_batch);
            let claude_result = self.runner.run(&prompt, Some(&self.worktree_dir)).await;
            total_cost += claude_result.cost_usd;
            if !claude_result.success {
                warn!("Worker {}: tool failed: {}", self.worker_id, claude_result.error);
                return self.failure(claude_result.error, total_cost, start);
            }
        }

        let mut changed_files = match git.get_changed_files().await {
            Ok(files) => files,
            Err(e) => return self.failure(format!("Failed to list changed files: {}", e), total_cost, start),
        };
        // Scratch files of the agent workspace are not part of the change.
        let ws_dir = &self.config.paths.agent_workspace_dir;
        let ws_prefix = format!("{}/", ws_dir);
        changed_files.retain(|f| f != ws_dir && !f.starts_with(&ws_prefix));
        if changed_files.is_empty() {
            info!("Worker {}: no files changed", self.worker_id);
            return self.failure("No files changed", total_cost, start);
        }

        let safety = SafetyGuard::new(self.config.clone(), self.state.clone());
        if let Err(e) = safety.post_change_checks(&changed_files) {
            warn!("Worker {}: safety check failed: {}", self.worker_id, e);
            return self.failure(e.to_string(), total_cost, start);
        }

        if self.config.orchestrator.self_improve
            && let Some(syntax_err) = syntax_check_files(&self.worktree_dir, &changed_files)
        {
            warn!("Worker {}: syntax check failed: {}", self.worker_id, syntax_err);
            return self.failure(syntax_err, total_cost, start);
        }

        cycle_state.update(|s| s.phase = "validating".to_string());
        let validator = Validator::new(self.config.clone());
        let validation = match validator.validate(Some(&self.worktree_dir)).await {
            Ok(validation) => validation,
            Err(e) => return self.failure(format!("Validation error: {}", e), total_cost, start),
        };
        if !validation.passed {
            warn!("Worker {}: validation failed: {}", self.worker_id, validation.summary());
            let mut result = self.failure(
                format!("Validation failed: {}", validation.summary()),
                total_cost,
                start,
            );
            result.validation_summary = validation.summary();
            self.attach_pipeline_meta(&mut result, pipeline_meta);
            return result;
        }

        let commit_msg = self.build_commit_message(is_batch);
        let commit_hash = match git.commit(&commit_msg, Some(&changed_files)).await {
            Ok(hash) => hash,
            Err(e) => return self.failure(format!("Commit error: {}", e), total_cost, start),
        };
        if commit_hash.is_empty() {
            return self.failure("Commit failed (no staged changes)", total_cost, start);
        }

        info!(
            "Worker {}: committed {} on branch {}",
            self.worker_id,
            &commit_hash[..commit_hash.len().min(8)],
            self.branch_name
        );
        let mut result = WorkerResult {
            success: true,
            branch_name: self.branch_name.clone(),
            commit_hash,
            cost_usd: total_cost,
            duration_seconds: start.elapsed().as_secs_f64(),
            validation_summary: validation.summary(),
            error: String::new(),
            tasks: self.tasks.clone(),
            pipeline_mode: false,
            pipeline_revision_count: None,
            pipeline_review_approved: None,
        };
        self.attach_pipeline_meta(&mut result, pipeline_meta);
        result
    }

    fn attach_pipeline_meta(&self, result: &mut WorkerResult, meta: Option<(u32, bool)>) {
        if let Some((revisions, approved)) = meta {
            result.pipeline_mode = true;
            result.pipeline_revision_count = Some(revisions);
            result.pipeline_review_approved = Some(approved);
        }
    }

    fn failure(&self, error: impl Into<String>, cost: f64, start: Instant) -> WorkerResult {
        WorkerResult {
            success: false,
            branch_name: self.branch_name.clone(),
            commit_hash: String::new(),
            cost_usd: cost,
            duration_seconds: start.elapsed().as_secs_f64(),
            validation_summary: String::new(),
            error: error.into(),
            tasks: self.tasks.clone(),
            pipeline_mode: false,
            pipeline_revision_count: None,
            pipeline_review_approved: None,
        }
    }

    async fn setup_worktree(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.worktree_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let main_git = GitManager::new(&self.main_repo_dir);
        main_git.create_worktree(&self.worktree_dir, &self.branch_name).await?;
        info!(
            "Worker {}: created worktree at {} (branch {})",
            self.worker_id,
            self.worktree_dir.display(),
            self.branch_name
        );
        Ok(())
    }

    /// Remove the worktree and delete the branch. Errors are warned and
    /// swallowed; the directory is force-removed as a fallback.
    pub async fn cleanup(&self) {
        let main_git = GitManager::new(&self.main_repo_dir);
        if let Err(e) = main_git.remove_worktree(&self.worktree_dir, true).await {
            warn!(
                "Worker {}: git worktree remove failed ({}), falling back to rmtree",
                self.worker_id, e
            );
        }
        if self.worktree_dir.exists() {
            let _ = std::fs::remove_dir_all(&self.worktree_dir);
        }
        if let Err(e) = main_git.delete_branch(&self.branch_name, true).await {
            warn!(
                "Worker {}: branch deletion failed for {}: {}",
                self.worker_id, self.branch_name, e
            );
        }
        main_git.prune_worktrees().await;
        info!("Worker {}: cleaned up worktree and branch", self.worker_id);
    }

    fn build_prompt(&self, is_batch: bool) -> String {
        let protected = self.config.safety.protected_files.join(", ");

        if is_batch {
            let task_list = format_task_list(&self.tasks);
            return format!(
                "You are working on the project in the current directory.\n\n\
                 You have been given a batch of tasks to address in a single comprehensive change.\n\n\
                 TASKS:\n{}\n\n\
                 INSTRUCTIONS:\n\
                 - Make the minimal changes needed to complete ALL tasks above.\n\
                 - Do NOT run git commands (add, commit, push). The orchestrator handles git.\n\
                 - Do NOT modify these protected files: {}\n\
                 - Focus on correctness. Run tests if available.\n\
                 - If a task is unclear or impossible, make your best effort and explain what you did.\n",
                task_list, protected
            );
        }

        let task = &self.tasks[0];
        let context_section = if task.context.is_empty() {
            String::new()
        } else {
            format!("\nCONTEXT:\n{}\n", task.context)
        };
        format!(
            "You are working on the project in the current directory.\n\n\
             TASK: {}\n\
             {}\n\
             INSTRUCTIONS:\n\
             - Make the minimal changes needed to complete this task.\n\
             - Do NOT run git commands (add, commit, push). The orchestrator handles git.\n\
             - Do NOT modify these protected files: {}\n\
             - Focus on correctness. Run tests if available.\n\
             - If the task is unclear or impossible, make your best effort and explain what you did.\n",
            task.description, context_section, protected
        )
    }

    fn build_commit_message(&self, is_batch: bool) -> String {
        if is_batch {
            let subject = format!("[auto] Auto-fix {} tasks", self.tasks.len());
            let body: Vec<String> = self
                .tasks
                .iter()
                .map(|t| format!("- {}", truncate_chars(&t.description, 100)))
                .collect();
            return format!("{}\n\n{}", subject, body.join("\n"));
        }
        let task = &self.tasks[0];
        let desc = if task.description.chars().count() > 72 {
            format!("{}...", truncate_chars(&task.description, 69))
        } else {
            task.description.clone()
        };
        format!("[auto] {}: {}", task.source, desc)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn format_task_list(tasks: &[Task]) -> String {
    let mut lines = Vec::new();
    for (i, task) in tasks.iter().enumerate() {
        lines.push(format!("{}. {} [{}]", i + 1, task.description, task.source));
        if !task.context.is_empty() {
            lines.push("   CONTEXT:".to_string());
            for ctx_line in task.context.lines() {
                lines.push(format!("   {}", ctx_line));
            }
        }
    }
    lines.join("\n")
}

/// Balance-check changed Rust sources so an obviously truncated file fails
/// fast instead of burning a validation run.
pub(crate) fn syntax_check_files(root: &Path, changed_files: &[String]) -> Option<String> {
    for file in changed_files {
        if !file.ends_with(".rs") {
            continue;
        }
        let path = root.join(file);
        let Ok(source) = std::fs::read_to_string(&path) else {
            continue;
        };
        if let Err(msg) = check_delimiter_balance(&source) {
            return Some(format!("Syntax error in {}: {}", file, msg));
        }
    }
    None
}

/// Scan for unbalanced `{}`/`()`/`[]` outside strings, chars and comments.
fn check_delimiter_balance(source: &str) -> Result<(), String> {
    let mut stack: Vec<char> = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1u32;

    while let Some(ch) = chars.next() {
        match ch {
            '\n' => line += 1,
            '/' => match chars.peek() {
                Some('/') => {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            line += 1;
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut depth = 1;
                    let mut prev = '\0';
                    for c in chars.by_ref() {
                        if c == '\n' {
                            line += 1;
                        }
                        if prev == '/' && c == '*' {
                            depth += 1;
                            prev = '\0';
                        } else if prev == '*' && c == '/' {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            prev = '\0';
                        } else {
                            prev = c;
                        }
                    }
                }
                _ => {}
            },
            '"' => {
                let mut escaped = false;
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                    }
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        break;
                    }
                }
            }
            '\'' => {
                // Char literal only when it closes shortly; otherwise it is a
                // lifetime marker and is left alone.
                let mut lookahead = chars.clone();
                let consumed = match lookahead.next() {
                    Some('\\') => {
                        lookahead.next();
                        if lookahead.next() == Some('\'') { 3 } else { 0 }
                    }
                    Some(c) if c != '\'' => {
                        if lookahead.next() == Some('\'') { 2 } else { 0 }
                    }
                    _ => 0,
                };
                for _ in 0..consumed {
                    chars.next();
                }
            }
            '{' | '(' | '[' => stack.push(ch),
            '}' | ')' | ']' => {
                let expected = match ch {
                    '}' => '{',
                    ')' => '(',
                    _ => '[',
                };
                match stack.pop() {
                    Some(open) if open == expected => {}
                    Some(open) => {
                        return Err(format!(
                            "mismatched delimiter '{}' at line {} (open '{}')",
                            ch, line, open
                        ));
                    }
                    None => {
                        return Err(format!("unmatched closing '{}' at line {}", ch, line));
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(format!("unclosed delimiter '{}'", open));
    }
    Ok(())
}

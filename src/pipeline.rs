//! Multi-agent pipeline: Planner → Coder → Tester → Reviewer with bounded
//! revision loops.
//!
//! Agents communicate through a file-based workspace (`plan.md`,
//! `review.md`). The planner runs exactly once; its side effects are rolled
//! back immediately. Between revisions the rejected coder output is rolled
//! back and the review file rewritten into the cleaned workspace so the next
//! coder iteration can read the feedback.

use crate::claude::ClaudeRunner;
use crate::config::{AgentRoleConfig, Config};
use crate::cycle_state::CycleStateWriter;
use crate::git::{GitManager, Snapshot};
use crate::tasks::Task;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use tracing::{info, warn};

static VERDICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*VERDICT:\s*(APPROVED|REVISE)\s*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Planner,
    Coder,
    Tester,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Coder => "coder",
            AgentRole::Tester => "tester",
            AgentRole::Reviewer => "reviewer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentResult {
    pub role: AgentRole,
    pub success: bool,
    pub output_text: String,
    pub cost_usd: f64,
    pub duration_seconds: f64,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub success: bool,
    pub agent_results: Vec<AgentResult>,
    pub total_cost_usd: f64,
    pub total_duration_seconds: f64,
    pub revision_count: u32,
    pub final_review_approved: bool,
    pub error: String,
}

/// File-based bulletin board shared by the agents.
pub struct AgentWorkspace {
    root: PathBuf,
}

impl AgentWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Remove everything in the workspace, tolerating permission errors.
    pub fn clean(&self) {
        if self.root.exists()
            && let Ok(entries) = std::fs::read_dir(&self.root)
        {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                if let Err(e) = result {
                    warn!("Could not remove workspace entry {}: {}", path.display(), e);
                }
            }
        }
        if let Err(e) = std::fs::create_dir_all(&self.root) {
            warn!("Could not create workspace {}: {}", self.root.display(), e);
        }
    }

    pub fn write(&self, name: &str, content: &str) {
        if let Err(e) = std::fs::create_dir_all(&self.root) {
            warn!("Could not create workspace {}: {}", self.root.display(), e);
            return;
        }
        if let Err(e) = std::fs::write(self.root.join(name), content) {
            warn!("Could not write workspace file {}: {}", name, e);
        }
    }

    pub fn read(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(name)).ok()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.root.join(name).exists()
    }
}

/// Parse the reviewer's verdict line. Defaults to approved when the text is
/// empty or carries no verdict.
pub fn parse_review_verdict(review_text: &str) -> bool {
    for line in review_text.lines() {
        if let Some(caps) = VERDICT_RE.captures(line) {
            return caps[1].eq_ignore_ascii_case("APPROVED");
        }
    }
    true
}

/// Orchestrates a Planner → Coder → Tester → Reviewer pipeline.
pub struct AgentPipeline {
    config: Config,
    workspace_dir: PathBuf,
    active_runner: Mutex<Option<Arc<ClaudeRunner>>>,
    terminated: Arc<AtomicBool>,
    cycle_state: Option<Arc<CycleStateWriter>>,
}

impl AgentPipeline {
    pub fn new(config: Config, cycle_state: Option<Arc<CycleStateWriter>>) -> Self {
        let workspace_dir =
            Path::new(&config.target_dir).join(&config.paths.agent_workspace_dir);
        Self {
            config,
            workspace_dir,
            active_runner: Mutex::new(None),
            terminated: Arc::new(AtomicBool::new(false)),
            cycle_state,
        }
    }

    /// Terminate the currently running agent subprocess and skip all
    /// remaining iterations. Thread-safe.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let runner = self.active_runner.lock().ok().and_then(|slot| slot.clone());
        if let Some(runner) = runner {
            warn!("Terminating active pipeline agent subprocess");
            runner.terminate();
        }
    }

    fn role_config(&self, role: AgentRole) -> &AgentRoleConfig {
        let ap = &self.config.agent_pipeline;
        match role {
            AgentRole::Planner => &ap.planner,
            AgentRole::Coder => &ap.coder,
            AgentRole::Tester => &ap.tester,
            AgentRole::Reviewer => &ap.reviewer,
        }
    }

    /// A runner with per-agent model/turn/timeout overrides applied.
    fn build_runner_for_agent(&self, role: AgentRole) -> Arc<ClaudeRunner> {
        let role_cfg = self.role_config(role);
        let mut agent_config = self.config.clone();
        agent_config.claude.model = role_cfg.model.clone();
        agent_config.claude.resolved_model = String::new();
        agent_config.claude.max_turns = role_cfg.max_turns;
        agent_config.claude.timeout_seconds = role_cfg.timeout_seconds;
        Arc::new(ClaudeRunner::new(agent_config))
    }

    async fn run_agent(&self, role: AgentRole, prompt: &str, accumulated_cost: f64) -> AgentResult {
        if !self.role_config(role).enabled {
            return AgentResult {
                role,
                success: true,
                output_text: "(skipped)".to_string(),
                cost_usd: 0.0,
                duration_seconds: 0.0,
                error: String::new(),
            };
        }

        if let Some(ref cycle_state) = self.cycle_state {
            cycle_state.update(|s| {
                s.pipeline_agent = role.as_str().to_string();
                s.accumulated_cost = accumulated_cost;
            });
        }

        let runner = self.build_runner_for_agent(role);
        if let Ok(mut slot) = self.active_runner.lock() {
            *slot = Some(runner.clone());
        }

        let result = if self.terminated.load(Ordering::SeqCst) {
            AgentResult {
                role,
                success: false,
                output_text: String::new(),
                cost_usd: 0.0,
                duration_seconds: 0.0,
                error: "Pipeline was terminated".to_string(),
            }
        } else {
            let cr = runner.run(prompt, Some(Path::new(&self.config.target_dir))).await;
            AgentResult {
                role,
                success: cr.success,
                output_text: cr.result_text,
                cost_usd: cr.cost_usd,
                duration_seconds: cr.duration_seconds,
                error: cr.error,
            }
        };

        if let Ok(mut slot) = self.active_runner.lock() {
            *slot = None;
        }
        result
    }

    fn task_block(tasks: &[Task]) -> String {
        if tasks.len() == 1 {
            return tasks[0].description.clone();
        }
        tasks
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}. {}", i + 1, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn pipeline_cost_limit(&self) -> f64 {
        let limit = self.config.agent_pipeline.max_pipeline_cost_usd;
        if limit > 0.0 {
            limit
        } else {
            self.config.safety.max_cost_usd_per_hour * 0.5
        }
    }

    /// Execute the full pipeline against the snapshot, rolling back through
    /// `git` between iterations.
    pub async fn run(
        &self,
        tasks: &[Task],
        git: &GitManager,
        snapshot: &Snapshot,
    ) -> PipelineResult {
        let workspace = AgentWorkspace::new(&self.workspace_dir);
        let task_desc = Self::task_block(tasks);
        let max_revisions = self.config.agent_pipeline.max_revisions;
        let ws_display = self.workspace_dir.display();

        let mut result = PipelineResult::default();
        let mut revision = 0u32;

        // Planner runs exactly once, never on revisions.
        let planner_prompt = format!(
            "You are the PLANNER agent.\n\n\
             TASK:\n{}\n\n\
             Create a detailed plan for implementing the above task. \
             Write the plan to {}/plan.md",
            task_desc, ws_display
        );
        let planner_result = self.run_agent(AgentRole::Planner, &planner_prompt, 0.0).await;
        result.total_cost_usd += planner_result.cost_usd;
        result.total_duration_seconds += planner_result.duration_seconds;
        let planner_ok = planner_result.success;
        let planner_error = planner_result.error.clone();
        let planner_output = planner_result.output_text.clone();
        result.agent_results.push(planner_result);

        if !planner_ok {
            result.error = format!("Planner failed: {}", planner_error);
            return result;
        }

        // Discard any file changes the planner made
        if let Err(e) = git.rollback(Some(snapshot), None).await {
            result.error = format!("Rollback after planner failed: {}", e);
            return result;
        }

        let plan_text = workspace.read("plan.md").unwrap_or(planner_output);

        loop {
            let cost_limit = self.pipeline_cost_limit();
            if result.total_cost_usd >= cost_limit {
                warn!(
                    "Pipeline cost guard: ${:.2} accumulated (limit ${:.2}), aborting",
                    result.total_cost_usd, cost_limit
                );
                result.error = format!(
                    "Pipeline cost limit exceeded (${:.2} >= ${:.2})",
                    result.total_cost_usd, cost_limit
                );
                return result;
            }

            if self.terminated.load(Ordering::SeqCst) {
                result.error = "Pipeline was terminated".to_string();
                return result;
            }

            // The reviewer wrote feedback last iteration; read it before
            // cleaning the workspace.
            let review_text = workspace.read("review.md").unwrap_or_default();
            workspace.clean();

            let revision_context = if revision > 0 && !review_text.is_empty() {
                format!(
                    "\n\nPREVIOUS REVIEW FEEDBACK (revision {}):\n{}\n\
                     Address the reviewer's feedback in your implementation.",
                    revision, review_text
                )
            } else {
                String::new()
            };

            let coder_prompt = format!(
                "You are the CODER agent.\n\n\
                 TASK:\n{}\n\n\
                 PLAN:\n{}\n{}\n\
                 Implement the changes described in the plan.",
                task_desc, plan_text, revision_context
            );
            let coder_result = self
                .run_agent(AgentRole::Coder, &coder_prompt, result.total_cost_usd)
                .await;
            result.total_cost_usd += coder_result.cost_usd;
            result.total_duration_seconds += coder_result.duration_seconds;
            let coder_ok = coder_result.success;
            let coder_error = coder_result.error.clone();
            result.agent_results.push(coder_result);

            if !coder_ok {
                result.error = format!("Coder failed: {}", coder_error);
                return result;
            }

            let tester_prompt = format!(
                "You are the TESTER agent.\n\n\
                 TASK:\n{}\n\n\
                 Run the test suite and report any failures.",
                task_desc
            );
            let tester_result = self
                .run_agent(AgentRole::Tester, &tester_prompt, result.total_cost_usd)
                .await;
            result.total_cost_usd += tester_result.cost_usd;
            result.total_duration_seconds += tester_result.duration_seconds;
            let tester_ok = tester_result.success;
            let tester_error = tester_result.error.clone();
            result.agent_results.push(tester_result);

            // A crashed tester is a revision signal, not a silent pass.
            if !tester_ok {
                warn!("Tester agent failed: {}, treating as revision needed", tester_error);
                if revision < max_revisions {
                    revision += 1;
                    result.revision_count = revision;
                    if let Err(e) = git.rollback(Some(snapshot), None).await {
                        result.error = format!("Rollback failed: {}", e);
                        return result;
                    }
                    workspace.write(
                        "review.md",
                        &format!("VERDICT: REVISE\nTester failed: {}", tester_error),
                    );
                    continue;
                }
                result.error =
                    format!("Tester failed after exhausting revisions: {}", tester_error);
                result.revision_count = revision;
                return result;
            }

            let reviewer_prompt = format!(
                "You are the REVIEWER agent.\n\n\
                 TASK:\n{}\n\n\
                 Review the code changes. Write your review to {}/review.md.\n\
                 End your review with either:\n\
                 VERDICT: APPROVED\n\
                 or:\n\
                 VERDICT: REVISE",
                task_desc, ws_display
            );
            let reviewer_result = self
                .run_agent(AgentRole::Reviewer, &reviewer_prompt, result.total_cost_usd)
                .await;
            result.total_cost_usd += reviewer_result.cost_usd;
            result.total_duration_seconds += reviewer_result.duration_seconds;
            let reviewer_output = reviewer_result.output_text.clone();
            result.agent_results.push(reviewer_result);

            // A disabled reviewer auto-approves.
            if !self.config.agent_pipeline.reviewer.enabled {
                result.success = true;
                result.final_review_approved = true;
                return result;
            }

            let review_content = workspace.read("review.md").unwrap_or(reviewer_output);
            if parse_review_verdict(&review_content) {
                result.success = true;
                result.final_review_approved = true;
                return result;
            }

            if revision < max_revisions {
                revision += 1;
                result.revision_count = revision;
                info!("Reviewer requested revision {} of {}", revision, max_revisions);
                if let Some(ref cycle_state) = self.cycle_state {
                    cycle_state.update(|s| s.pipeline_revision = revision);
                }
                if let Err(e) = git.rollback(Some(snapshot), None).await {
                    result.error = format!("Rollback failed: {}", e);
                    return result;
                }
                // Rollback's clean deletes untracked workspace files; restore
                // the review so the next coder iteration can read it.
                workspace.write("review.md", &review_content);
            } else {
                result.success = false;
                result.final_review_approved = false;
                result.revision_count = revision;
                result.error = "Reviewer rejected after exhausting all revisions".to_string();
                return result;
            }
        }
    }
}

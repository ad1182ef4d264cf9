//! Task shape consumed by the orchestration engine.
//!
//! Tasks are value objects produced by external discovery (or the feedback
//! directory) and consumed once per cycle. The engine never inspects the
//! target repository itself; everything it knows about a unit of work is in
//! this struct.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const MAX_TASK_DESCRIPTION_LENGTH: usize = 2000;
pub const MAX_TASK_CONTEXT_LENGTH: usize = 12_000;

static FILE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"`([a-zA-Z0-9_/.\-]+\.(?:py|js|ts|tsx|jsx|go|rs|java|rb|sh|yaml|yml|json|md|txt))(?::(\d+))?(?:-\d+)?`",
    )
    .unwrap()
});

static FILE_REF_FALLBACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:in\s+|for\s+)([a-zA-Z0-9_/.\-]+\.(?:py|js|ts|tsx|jsx|go|rs|java|rb|sh|yaml|yml|json|md|txt))(?::(\d+))?",
    )
    .unwrap()
});

static COVERAGE_TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"for\s+(\S+)").unwrap());

static FAILED_TEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FAILED\s+(\S+)").unwrap());

/// Where a task came from. Determines priority ordering and key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Feedback,
    TestFailure,
    Lint,
    Todo,
    Coverage,
    Quality,
    ClaudeIdea,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Feedback => "feedback",
            TaskSource::TestFailure => "test_failure",
            TaskSource::Lint => "lint",
            TaskSource::Todo => "todo",
            TaskSource::Coverage => "coverage",
            TaskSource::Quality => "quality",
            TaskSource::ClaudeIdea => "claude_idea",
        }
    }
}

impl std::fmt::Display for TaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feedback" => Ok(TaskSource::Feedback),
            "test_failure" => Ok(TaskSource::TestFailure),
            "lint" => Ok(TaskSource::Lint),
            "todo" => Ok(TaskSource::Todo),
            "coverage" => Ok(TaskSource::Coverage),
            "quality" => Ok(TaskSource::Quality),
            "claude_idea" => Ok(TaskSource::ClaudeIdea),
            _ => anyhow::bail!("Unknown task source '{}'", s),
        }
    }
}

/// A unit of work for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    /// 1 = highest (feedback), larger = lower priority.
    pub priority: u32,
    pub source: TaskSource,
    pub source_file: Option<String>,
    pub line_number: Option<u32>,
    /// Rich context: tracebacks, file snippets, error details.
    #[serde(default)]
    pub context: String,
}

impl Task {
    /// Build a task, sanitizing the description (single line, bounded) and
    /// truncating oversized context.
    pub fn new(description: impl Into<String>, priority: u32, source: TaskSource) -> Self {
        Self {
            description: sanitize_description(&description.into()),
            priority,
            source,
            source_file: None,
            line_number: None,
            context: String::new(),
        }
    }

    pub fn with_source_file(mut self, source_file: impl Into<String>) -> Self {
        self.source_file = Some(source_file.into());
        self
    }

    pub fn with_line_number(mut self, line_number: u32) -> Self {
        self.line_number = Some(line_number);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let mut context = context.into();
        if context.len() > MAX_TASK_CONTEXT_LENGTH {
            context.truncate(MAX_TASK_CONTEXT_LENGTH);
            context.push_str("\n... (truncated)");
        }
        self.context = context;
        self
    }

    /// Stable dedup key: the same underlying issue produces the same key
    /// across runs regardless of description phrasing drift.
    pub fn task_key(&self) -> String {
        if self.source == TaskSource::Todo {
            if let Some(ref file) = self.source_file {
                return match self.line_number {
                    Some(line) => format!("todo:{}:{}", file, line),
                    None => format!("todo:{}", file),
                };
            }
        }

        if matches!(
            self.source,
            TaskSource::Lint | TaskSource::TestFailure | TaskSource::Quality | TaskSource::Coverage
        ) && let Some(ref file) = self.source_file
        {
            return format!("{}:{}", self.source, file);
        }

        if self.source == TaskSource::Coverage
            && let Some(caps) = COVERAGE_TARGET_RE.captures(&self.description)
        {
            return format!("coverage:{}", &caps[1]);
        }

        if self.source == TaskSource::ClaudeIdea {
            if let Some(caps) = FILE_REF_RE.captures(&self.description) {
                return format!("claude_idea:{}", &caps[1]);
            }
            if let Some(caps) = FILE_REF_FALLBACK_RE.captures(&self.description) {
                return format!("claude_idea:{}", &caps[1]);
            }
            let prefix: String = self.description.chars().take(60).collect();
            return format!("claude_idea:{}", prefix);
        }

        if self.source == TaskSource::Feedback
            && let Some(ref file) = self.source_file
        {
            return format!("feedback:{}", file);
        }

        if self.source == TaskSource::TestFailure
            && let Some(caps) = FAILED_TEST_RE.captures(&self.description)
        {
            return format!("test_failure:{}", &caps[1]);
        }

        format!("{}:{}", self.source, self.description)
    }
}

/// Strip, collapse newlines, and truncate a task description.
pub fn sanitize_description(desc: &str) -> String {
    let mut desc = desc.trim().replace(['\n', '\r'], " ");
    if desc.len() > MAX_TASK_DESCRIPTION_LENGTH {
        // Truncate on a char boundary at or below the cap.
        let mut cut = MAX_TASK_DESCRIPTION_LENGTH;
        while !desc.is_char_boundary(cut) {
            cut -= 1;
        }
        desc.truncate(cut);
        desc.push_str("...");
    }
    desc
}

/// Source of auto-discovered tasks. The engine is agnostic to how tasks are
/// found; implementations live outside the core and only emit this shape.
pub trait TaskProvider: Send + Sync {
    fn discover(&self) -> Vec<Task>;
}

/// Provider that never yields tasks; the default when no discovery layer is
/// wired in (feedback tasks still flow through the feedback directory).
pub struct NoopTaskProvider;

impl TaskProvider for NoopTaskProvider {
    fn discover(&self) -> Vec<Task> {
        Vec::new()
    }
}

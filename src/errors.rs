//! Typed error hierarchy for the orchestrator.
//!
//! Two top-level enums cover the subsystems that need matchable failures:
//! - `SafetyError` for pre-flight and post-change guard violations
//! - `GitError` for git plumbing failures that block correctness
//!
//! Long-running operations (tool invocation, validation, worker execution)
//! report failure through their result structs instead of `Err`; `anyhow`
//! covers unrecoverable environment failures.

use thiserror::Error;

/// A safety guard refused to let the cycle proceed.
#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("Another instance is already running (lock file held)")]
    LockHeld,

    #[error("Low disk space: {free_mb:.0} MB free, minimum {min_mb} MB required")]
    DiskSpace { free_mb: f64, min_mb: u64 },

    #[error("Rate limit reached: {count} cycles in the last hour (limit: {limit})")]
    RateLimit { count: usize, limit: usize },

    #[error("Cost limit reached: ${cost:.2} in the last hour (limit: ${limit:.2})")]
    CostLimit { cost: f64, limit: f64 },

    #[error(
        "Too many consecutive failures: {count} (limit: {limit}). \
         Pausing until a successful cycle or manual intervention."
    )]
    ConsecutiveFailures { count: usize, limit: usize },

    #[error("Protected files modified: {}", files.join(", "))]
    ProtectedFiles { files: Vec<String> },

    #[error("Too many files changed: {count} (limit: {limit})")]
    TooManyFiles { count: usize, limit: usize },

    #[error("max_changed_files must be positive (got {0})")]
    InvalidFileLimit(i64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Git plumbing failures that block correctness.
///
/// Cosmetic failures (worktree prune, branch delete) are warned and swallowed
/// at the call site rather than surfaced through this enum.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Not a git repository: {0}")]
    NotARepository(String),

    #[error("git {command} failed (exit {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("All git queries failed in get_changed_files; cannot determine working tree state")]
    ChangedFilesUnavailable,

    #[error("Rollback aborted: {count} unexpected uncommitted files: {files:?}")]
    UnexpectedDirtyFiles { count: usize, files: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

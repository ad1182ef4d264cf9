//! Git operations: snapshot, rollback, commit, changed files, worktrees,
//! merges.
//!
//! Everything shells out to the `git` CLI through the process-group runner so
//! that hooks and subprocesses spawned by git are killed on timeout. A timed
//! out invocation surfaces as a failed (non-raising) result, mirroring a
//! non-zero exit.

use crate::errors::GitError;
use crate::process::{RunOptions, RunOutput, run_argv};
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for git operations.
const GIT_DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Longer timeout for push operations.
const GIT_PUSH_TIMEOUT: Duration = Duration::from_secs(300);
/// Longer timeout for commit operations (pre-commit hooks may be slow).
const GIT_COMMIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Commit hash recorded before any mutation, for rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub commit_hash: String,
}

pub struct GitManager {
    repo_dir: PathBuf,
    repo_validated: AtomicBool,
}

impl GitManager {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            repo_validated: AtomicBool::new(false),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Validate that repo_dir is a git repository (cached after first success).
    async fn validate_repo(&self) -> Result<()> {
        if self.repo_validated.load(Ordering::Relaxed) {
            return Ok(());
        }
        let out = self.run_raw(&["rev-parse", "--git-dir"], GIT_DEFAULT_TIMEOUT).await?;
        if out.returncode != 0 {
            return Err(GitError::NotARepository(self.repo_dir.display().to_string()).into());
        }
        self.repo_validated.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn run_raw(&self, args: &[&str], timeout: Duration) -> Result<RunOutput> {
        let mut argv: Vec<String> = Vec::with_capacity(args.len() + 1);
        argv.push("git".to_string());
        argv.extend(args.iter().map(|s| s.to_string()));
        let out = run_argv(
            &argv,
            RunOptions {
                cwd: Some(self.repo_dir.clone()),
                timeout: Some(timeout),
                group: None,
            },
        )
        .await?;
        if out.timed_out {
            warn!(
                "git {} timed out after {}s: {}",
                args.first().unwrap_or(&"?"),
                timeout.as_secs(),
                out.stderr.trim()
            );
        }
        Ok(out)
    }

    /// Run a git command; non-zero exit (and timeout) is reported through the
    /// returned output rather than an error.
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<RunOutput> {
        self.validate_repo().await?;
        self.run_raw(args, timeout).await
    }

    /// Run a git command, raising `GitError::CommandFailed` on non-zero exit.
    async fn run_checked(&self, args: &[&str], timeout: Duration) -> Result<RunOutput> {
        let out = self.run(args, timeout).await?;
        if out.returncode != 0 {
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                code: out.returncode,
                stderr: out.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(out)
    }

    /// The set of currently modified/untracked files (before the tool runs).
    pub async fn capture_worktree_state(&self) -> Result<BTreeSet<String>> {
        Ok(self.get_changed_files().await?.into_iter().collect())
    }

    /// Record current HEAD hash as a snapshot for potential rollback.
    pub async fn create_snapshot(&self) -> Result<Snapshot> {
        let out = self.run_checked(&["rev-parse", "HEAD"], GIT_DEFAULT_TIMEOUT).await?;
        let commit_hash = out.stdout.trim().to_string();
        info!("Snapshot created: {}", &commit_hash[..commit_hash.len().min(8)]);
        Ok(Snapshot { commit_hash })
    }

    /// Discard working tree changes, optionally targeting only specific files.
    ///
    /// If a snapshot is provided and HEAD has moved, reset to that commit.
    ///
    /// With `allowed_dirty`: refuse (and raise) when unexpected dirty files
    /// exist outside the allowed set, preventing data loss; otherwise revert
    /// exactly the files that are both dirty and allowed, checking out tracked
    /// ones and deleting untracked ones. Without it: blanket
    /// `reset --hard` + `clean -fd`.
    pub async fn rollback(
        &self,
        snapshot: Option<&Snapshot>,
        allowed_dirty: Option<&BTreeSet<String>>,
    ) -> Result<()> {
        if let Some(allowed) = allowed_dirty {
            let current_dirty: BTreeSet<String> =
                self.get_changed_files().await?.into_iter().collect();
            let unexpected: Vec<String> = current_dirty.difference(allowed).cloned().collect();
            if !unexpected.is_empty() {
                warn!(
                    "Rollback: leaving {} unexpected uncommitted files untouched: {:?}",
                    unexpected.len(),
                    unexpected
                );
                return Err(GitError::UnexpectedDirtyFiles {
                    count: unexpected.len(),
                    files: unexpected,
                }
                .into());
            }

            let files_to_revert: Vec<String> =
                current_dirty.intersection(allowed).cloned().collect();

            if let Some(snapshot) = snapshot {
                self.reset_to_snapshot_if_moved(snapshot).await?;
            }

            if !files_to_revert.is_empty() {
                let mut args = vec!["checkout", "--"];
                args.extend(files_to_revert.iter().map(String::as_str));
                let _ = self.run(&args, GIT_DEFAULT_TIMEOUT).await?;

                for file in &files_to_revert {
                    let path = self.repo_dir.join(file);
                    if !path.exists() {
                        continue;
                    }
                    let tracked = self
                        .run(&["ls-files", "--error-unmatch", file.as_str()], GIT_DEFAULT_TIMEOUT)
                        .await?;
                    if tracked.returncode != 0 {
                        // Untracked, so remove it
                        if let Err(e) = std::fs::remove_file(&path) {
                            debug!("Could not remove {}: {}", path.display(), e);
                        }
                    }
                }
            }
            info!("Targeted rollback: reverted {} files", files_to_revert.len());
            return Ok(());
        }

        if let Some(snapshot) = snapshot {
            self.reset_to_snapshot_if_moved(snapshot).await?;
        }
        self.run_checked(&["checkout", "."], GIT_DEFAULT_TIMEOUT).await?;
        self.run_checked(&["clean", "-fd"], GIT_DEFAULT_TIMEOUT).await?;
        info!("Working tree cleaned");
        Ok(())
    }

    async fn reset_to_snapshot_if_moved(&self, snapshot: &Snapshot) -> Result<()> {
        let head = self.run_checked(&["rev-parse", "HEAD"], GIT_DEFAULT_TIMEOUT).await?;
        if head.stdout.trim() != snapshot.commit_hash {
            self.run_checked(&["reset", "--hard", &snapshot.commit_hash], GIT_DEFAULT_TIMEOUT)
                .await?;
            info!(
                "Reset HEAD to snapshot {}",
                &snapshot.commit_hash[..snapshot.commit_hash.len().min(8)]
            );
        }
        Ok(())
    }

    /// Hard reset HEAD and working tree to the given ref.
    pub async fn reset_hard(&self, refname: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", refname], GIT_DEFAULT_TIMEOUT).await?;
        Ok(())
    }

    /// Stage the given files (or everything if none) and commit.
    ///
    /// Returns the new commit hash, or an empty string when there is nothing
    /// to commit or the commit itself fails (e.g. a hook rejected it).
    pub async fn commit(&self, message: &str, files: Option<&[String]>) -> Result<String> {
        match files {
            Some([]) => {
                warn!("commit() called with empty file list, nothing to commit");
                return Ok(String::new());
            }
            Some(files) => {
                let mut args = vec!["add", "--"];
                args.extend(files.iter().map(String::as_str));
                self.run_checked(&args, GIT_DEFAULT_TIMEOUT).await?;
            }
            None => {
                self.run_checked(&["add", "-A"], GIT_DEFAULT_TIMEOUT).await?;
            }
        }

        // Verify something is staged
        let staged = self
            .run(&["diff", "--cached", "--name-only"], GIT_DEFAULT_TIMEOUT)
            .await?;
        if staged.stdout.trim().is_empty() {
            warn!("No staged changes after git add, skipping commit");
            return Ok(String::new());
        }

        let commit = self.run(&["commit", "-m", message], GIT_COMMIT_TIMEOUT).await?;
        if commit.returncode != 0 {
            warn!(
                "git commit failed (exit code {}): {}",
                commit.returncode,
                commit.stderr.trim()
            );
            return Ok(String::new());
        }

        let head = self.run_checked(&["rev-parse", "HEAD"], GIT_DEFAULT_TIMEOUT).await?;
        let commit_hash = head.stdout.trim().to_string();
        info!(
            "Committed: {} {}",
            &commit_hash[..commit_hash.len().min(8)],
            message.lines().next().unwrap_or("")
        );
        Ok(commit_hash)
    }

    /// Push current branch to origin. Returns true on success.
    pub async fn push(&self) -> Result<bool> {
        let out = self.run(&["push"], GIT_PUSH_TIMEOUT).await?;
        if out.returncode == 0 {
            info!("Pushed to remote");
            Ok(true)
        } else {
            warn!("Push failed: {}", out.stderr.trim());
            Ok(false)
        }
    }

    /// Changed/untracked files relative to the repo root, sorted.
    ///
    /// Union of three orthogonal queries (staged, unstaged tracked, untracked
    /// not ignored). Raises only when all three fail.
    pub async fn get_changed_files(&self) -> Result<Vec<String>> {
        let queries: [&[&str]; 3] = [
            &["diff", "--cached", "--name-only"],
            &["diff", "--name-only"],
            &["ls-files", "--others", "--exclude-standard"],
        ];

        let mut files = BTreeSet::new();
        let mut any_succeeded = false;
        for query in queries {
            let out = self.run(query, GIT_DEFAULT_TIMEOUT).await?;
            if out.returncode != 0 {
                warn!(
                    "git {} failed (exit {}): {}",
                    query[0],
                    out.returncode,
                    out.stderr.trim()
                );
                continue;
            }
            any_succeeded = true;
            for line in out.stdout.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    files.insert(line.to_string());
                }
            }
        }

        if !any_succeeded {
            return Err(GitError::ChangedFilesUnavailable.into());
        }
        Ok(files.into_iter().collect())
    }

    /// Files changed since the captured state, excluding pre-existing dirt.
    pub async fn get_new_changed_files(&self, pre_existing: &BTreeSet<String>) -> Result<Vec<String>> {
        let current: BTreeSet<String> = self.get_changed_files().await?.into_iter().collect();
        Ok(current.difference(pre_existing).cloned().collect())
    }

    /// Whether the working tree has no changes or untracked files.
    pub async fn is_clean(&self) -> Result<bool> {
        let out = self.run(&["status", "--porcelain"], GIT_DEFAULT_TIMEOUT).await?;
        Ok(out.stdout.trim().is_empty())
    }

    pub async fn get_current_branch(&self) -> Result<String> {
        let out = self
            .run_checked(&["rev-parse", "--abbrev-ref", "HEAD"], GIT_DEFAULT_TIMEOUT)
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn checkout(&self, refname: &str) -> Result<()> {
        self.run_checked(&["checkout", refname], GIT_DEFAULT_TIMEOUT).await?;
        Ok(())
    }

    /// Create a worktree at `path` on a new branch.
    pub async fn create_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path.display().to_string();
        self.run_checked(
            &["worktree", "add", "-b", branch, &path_str],
            GIT_DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_worktree(&self, path: &Path, force: bool) -> Result<()> {
        let path_str = path.display().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run_checked(&args, GIT_DEFAULT_TIMEOUT).await?;
        Ok(())
    }

    /// Prune stale worktree registrations. Cosmetic: failures are warned and
    /// swallowed.
    pub async fn prune_worktrees(&self) {
        match self.run(&["worktree", "prune"], GIT_DEFAULT_TIMEOUT).await {
            Ok(out) if out.returncode != 0 => {
                warn!("git worktree prune failed: {}", out.stderr.trim());
            }
            Err(e) => warn!("git worktree prune failed: {}", e),
            _ => {}
        }
    }

    pub async fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_checked(&["branch", flag, branch], GIT_DEFAULT_TIMEOUT).await?;
        Ok(())
    }

    /// Fast-forward merge of `branch` into the current branch. False when a
    /// fast-forward is not possible.
    pub async fn merge_ff_only(&self, branch: &str) -> Result<bool> {
        let out = self.run(&["merge", "--ff-only", branch], GIT_DEFAULT_TIMEOUT).await?;
        Ok(out.returncode == 0)
    }

    /// Normal merge of `branch` into the current branch. False on conflicts;
    /// the caller is expected to `abort_merge`.
    pub async fn merge_branch(&self, branch: &str) -> Result<bool> {
        let out = self.run(&["merge", "--no-edit", branch], GIT_DEFAULT_TIMEOUT).await?;
        Ok(out.returncode == 0)
    }

    pub async fn abort_merge(&self) {
        if let Ok(out) = self.run(&["merge", "--abort"], GIT_DEFAULT_TIMEOUT).await
            && out.returncode != 0
        {
            debug!("git merge --abort: {}", out.stderr.trim());
        }
    }

    /// Rebase `branch` onto `base`. Aborts the rebase and returns false on
    /// conflict. Leaves `branch` checked out on success.
    pub async fn rebase_onto(&self, base: &str, branch: &str) -> Result<bool> {
        let out = self.run(&["rebase", base, branch], GIT_DEFAULT_TIMEOUT).await?;
        if out.returncode == 0 {
            return Ok(true);
        }
        warn!("Rebase of {} onto {} failed: {}", branch, base, out.stderr.trim());
        let _ = self.run(&["rebase", "--abort"], GIT_DEFAULT_TIMEOUT).await;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;
    use tempfile::{TempDir, tempdir};

    fn sh(dir: &Path, cmd: &str) {
        let status = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "command failed: {}", cmd);
    }

    fn setup_repo() -> (GitManager, TempDir) {
        let dir = tempdir().unwrap();
        sh(dir.path(), "git init -q -b main");
        sh(dir.path(), "git config user.name test");
        sh(dir.path(), "git config user.email test@test.com");
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        sh(dir.path(), "git add -A && git commit -q -m init");
        (GitManager::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn snapshot_returns_head_hash() {
        let (git, _dir) = setup_repo();
        let snapshot = git.create_snapshot().await.unwrap();
        assert_eq!(snapshot.commit_hash.len(), 40);
    }

    #[tokio::test]
    async fn not_a_repository_is_an_error() {
        let dir = tempdir().unwrap();
        let git = GitManager::new(dir.path());
        let err = git.create_snapshot().await.unwrap_err();
        assert!(err.to_string().contains("Not a git repository"));
    }

    #[tokio::test]
    async fn changed_files_unions_staged_unstaged_and_untracked() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        fs::write(dir.path().join("staged.txt"), "s\n").unwrap();
        sh(dir.path(), "git add staged.txt");
        fs::write(dir.path().join("untracked.txt"), "u\n").unwrap();

        let files = git.get_changed_files().await.unwrap();
        assert_eq!(files, vec!["README.md", "staged.txt", "untracked.txt"]);
    }

    #[tokio::test]
    async fn new_changed_files_excludes_pre_existing() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("pre.txt"), "x\n").unwrap();
        let pre = git.capture_worktree_state().await.unwrap();
        assert!(pre.contains("pre.txt"));

        fs::write(dir.path().join("README.md"), "edited\n").unwrap();
        let new_files = git.get_new_changed_files(&pre).await.unwrap();
        assert_eq!(new_files, vec!["README.md"]);
    }

    #[tokio::test]
    async fn commit_stages_subset_and_returns_hash() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        fs::write(dir.path().join("b.txt"), "b\n").unwrap();

        let hash = git
            .commit("add a only", Some(&["a.txt".to_string()]))
            .await
            .unwrap();
        assert_eq!(hash.len(), 40);
        // b.txt stays untracked
        let files = git.get_changed_files().await.unwrap();
        assert_eq!(files, vec!["b.txt"]);
    }

    #[tokio::test]
    async fn commit_with_nothing_staged_returns_empty() {
        let (git, _dir) = setup_repo();
        let hash = git.commit("noop", None).await.unwrap();
        assert_eq!(hash, "");
    }

    #[tokio::test]
    async fn commit_with_empty_file_list_returns_empty() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        let hash = git.commit("nothing", Some(&[])).await.unwrap();
        assert_eq!(hash, "");
    }

    #[tokio::test]
    async fn blanket_rollback_restores_tree_and_head() {
        let (git, dir) = setup_repo();
        let snapshot = git.create_snapshot().await.unwrap();

        fs::write(dir.path().join("README.md"), "mangled\n").unwrap();
        fs::write(dir.path().join("junk.txt"), "j\n").unwrap();
        git.commit("mangle", None).await.unwrap();
        fs::write(dir.path().join("more-junk.txt"), "m\n").unwrap();

        git.rollback(Some(&snapshot), None).await.unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("README.md")).unwrap(), "hello\n");
        assert!(!dir.path().join("junk.txt").exists());
        assert!(!dir.path().join("more-junk.txt").exists());
        let head = git.create_snapshot().await.unwrap();
        assert_eq!(head, snapshot);
    }

    #[tokio::test]
    async fn targeted_rollback_reverts_only_allowed_files() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("README.md"), "tool change\n").unwrap();
        fs::write(dir.path().join("tool-made.txt"), "t\n").unwrap();

        let allowed: BTreeSet<String> =
            ["README.md".to_string(), "tool-made.txt".to_string()].into();
        git.rollback(None, Some(&allowed)).await.unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("README.md")).unwrap(), "hello\n");
        assert!(!dir.path().join("tool-made.txt").exists());
    }

    #[tokio::test]
    async fn targeted_rollback_refuses_unexpected_dirty_files() {
        let (git, dir) = setup_repo();
        fs::write(dir.path().join("README.md"), "tool change\n").unwrap();
        fs::write(dir.path().join("precious-user-file.txt"), "do not lose\n").unwrap();

        let allowed: BTreeSet<String> = ["README.md".to_string()].into();
        let err = git.rollback(None, Some(&allowed)).await.unwrap_err();
        assert!(err.to_string().contains("precious-user-file.txt"));

        // Nothing outside the allowed set was touched; in fact nothing
        // at all was reverted.
        assert_eq!(
            fs::read_to_string(dir.path().join("precious-user-file.txt")).unwrap(),
            "do not lose\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "tool change\n"
        );
    }

    #[tokio::test]
    async fn is_clean_reflects_tree_state() {
        let (git, dir) = setup_repo();
        assert!(git.is_clean().await.unwrap());
        fs::write(dir.path().join("dirt.txt"), "d\n").unwrap();
        assert!(!git.is_clean().await.unwrap());
    }

    #[tokio::test]
    async fn worktree_lifecycle_create_commit_remove() {
        let (git, dir) = setup_repo();
        let wt_path = dir.path().join(".worktrees/worker-0");
        fs::create_dir_all(wt_path.parent().unwrap()).unwrap();

        git.create_worktree(&wt_path, "auto-claude/test-0").await.unwrap();
        assert!(wt_path.join("README.md").exists());

        let wt_git = GitManager::new(&wt_path);
        fs::write(wt_path.join("feature.txt"), "f\n").unwrap();
        let hash = wt_git.commit("feature", None).await.unwrap();
        assert_eq!(hash.len(), 40);

        git.remove_worktree(&wt_path, true).await.unwrap();
        assert!(!wt_path.exists());
        git.delete_branch("auto-claude/test-0", true).await.unwrap();
        git.prune_worktrees().await;
    }

    #[tokio::test]
    async fn merge_ff_only_fast_forwards_when_possible() {
        let (git, dir) = setup_repo();
        let wt_path = dir.path().join(".worktrees/worker-0");
        fs::create_dir_all(wt_path.parent().unwrap()).unwrap();
        git.create_worktree(&wt_path, "auto-claude/ff-0").await.unwrap();

        let wt_git = GitManager::new(&wt_path);
        fs::write(wt_path.join("new.txt"), "n\n").unwrap();
        wt_git.commit("add new", None).await.unwrap();

        assert!(git.merge_ff_only("auto-claude/ff-0").await.unwrap());
        assert!(dir.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn merge_ff_only_fails_when_main_advanced() {
        let (git, dir) = setup_repo();
        let wt_path = dir.path().join(".worktrees/worker-0");
        fs::create_dir_all(wt_path.parent().unwrap()).unwrap();
        git.create_worktree(&wt_path, "auto-claude/div-0").await.unwrap();

        let wt_git = GitManager::new(&wt_path);
        fs::write(wt_path.join("branch.txt"), "b\n").unwrap();
        wt_git.commit("branch work", None).await.unwrap();

        // Advance main independently
        fs::write(dir.path().join("main.txt"), "m\n").unwrap();
        git.commit("main work", None).await.unwrap();

        assert!(!git.merge_ff_only("auto-claude/div-0").await.unwrap());
        // A normal merge succeeds (no conflicting paths)
        assert!(git.merge_branch("auto-claude/div-0").await.unwrap());
        assert!(dir.path().join("branch.txt").exists());
    }

    #[tokio::test]
    async fn rebase_onto_replays_branch_and_enables_ff() {
        let (git, dir) = setup_repo();
        let wt_path = dir.path().join(".worktrees/worker-0");
        fs::create_dir_all(wt_path.parent().unwrap()).unwrap();
        git.create_worktree(&wt_path, "auto-claude/rb-0").await.unwrap();

        let wt_git = GitManager::new(&wt_path);
        fs::write(wt_path.join("branch.txt"), "b\n").unwrap();
        wt_git.commit("branch work", None).await.unwrap();

        fs::write(dir.path().join("main.txt"), "m\n").unwrap();
        git.commit("main work", None).await.unwrap();

        // The branch is checked out in the worktree, so rebase there.
        assert!(wt_git.rebase_onto("main", "auto-claude/rb-0").await.unwrap());
        assert!(git.merge_ff_only("auto-claude/rb-0").await.unwrap());
        assert!(dir.path().join("branch.txt").exists());
        assert!(dir.path().join("main.txt").exists());
    }

    #[tokio::test]
    async fn current_branch_and_checkout() {
        let (git, dir) = setup_repo();
        assert_eq!(git.get_current_branch().await.unwrap(), "main");
        sh(dir.path(), "git branch side");
        git.checkout("side").await.unwrap();
        assert_eq!(git.get_current_branch().await.unwrap(), "side");
    }
}

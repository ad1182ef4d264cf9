//! Developer-submitted task files in the feedback directory.
//!
//! Pending files are `*.md`/`*.txt` whose filename may carry a numeric
//! priority prefix (`01-fix-bug.md` sorts and prioritizes first). Ownership
//! is transferred by claim (rename to a `.claimed` marker) so that two
//! coordinator instances cannot pick up the same work; `done/` and `failed/`
//! are append-only from the orchestrator's perspective.

use crate::config::Config;
use crate::tasks::{Task, TaskSource};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const CLAIM_SUFFIX: &str = ".claimed";
/// Entries in done/ and failed/ older than this are swept.
const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

static PRIORITY_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)").unwrap());

pub struct FeedbackManager {
    feedback_dir: PathBuf,
    done_dir: PathBuf,
    failed_dir: PathBuf,
}

impl FeedbackManager {
    pub fn new(config: &Config) -> Self {
        let manager = Self {
            feedback_dir: PathBuf::from(&config.paths.feedback_dir),
            done_dir: PathBuf::from(&config.paths.feedback_done_dir),
            failed_dir: PathBuf::from(&config.paths.feedback_failed_dir),
        };
        manager.ensure_dirs();
        manager
    }

    fn ensure_dirs(&self) {
        for dir in [&self.feedback_dir, &self.done_dir, &self.failed_dir] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Failed to create {}: {}", dir.display(), e);
            }
        }
    }

    /// Read pending feedback files as tasks, sorted by filename so that a
    /// numeric prefix controls ordering.
    pub fn get_pending_feedback(&self) -> Vec<Task> {
        let Ok(entries) = std::fs::read_dir(&self.feedback_dir) else {
            return Vec::new();
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("md") | Some("txt")
                )
            })
            .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(".gitkeep"))
            .collect();
        files.sort();

        let mut tasks = Vec::new();
        for path in files {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Failed to read feedback file {}: {}", path.display(), e);
                    continue;
                }
            };
            let content = content.trim();
            if content.is_empty() {
                continue;
            }
            let priority = extract_priority(
                path.file_name().and_then(|n| n.to_str()).unwrap_or(""),
            );
            tasks.push(
                Task::new(content, priority, TaskSource::Feedback)
                    .with_source_file(path.display().to_string()),
            );
        }
        tasks
    }

    /// Claim a feedback file by renaming it to a `.claimed` marker. Returns
    /// false when the file is gone or already claimed by someone else.
    pub fn claim_feedback(&self, source_file: &str) -> bool {
        let src = Path::new(source_file);
        let claimed = claimed_path(src);
        if !src.exists() || claimed.exists() {
            return false;
        }
        match std::fs::rename(src, &claimed) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to claim feedback {}: {}", source_file, e);
                false
            }
        }
    }

    /// Return a claimed file to pending so another cycle can retry it.
    pub fn unclaim_feedback(&self, source_file: &str) {
        let src = Path::new(source_file);
        let claimed = claimed_path(src);
        if claimed.exists()
            && let Err(e) = std::fs::rename(&claimed, src)
        {
            warn!("Failed to unclaim feedback {}: {}", source_file, e);
        }
    }

    /// Move a processed (unclaimed) feedback file to done/.
    pub fn mark_done(&self, source_file: &str) {
        self.move_into(Path::new(source_file), &self.done_dir, "done");
    }

    /// Move a claimed feedback file to done/ under its original name.
    pub fn mark_done_claimed(&self, source_file: &str) {
        let src = Path::new(source_file);
        let claimed = claimed_path(src);
        if claimed.exists() {
            let name = src.file_name().map(|n| n.to_owned());
            self.move_as(&claimed, name.as_deref(), &self.done_dir, "done");
        } else {
            self.move_into(src, &self.done_dir, "done");
        }
    }

    /// Move a feedback file to failed/ after exhausting retries.
    pub fn mark_failed(&self, source_file: &str) {
        self.move_into(Path::new(source_file), &self.failed_dir, "failed");
    }

    fn move_into(&self, src: &Path, dest_dir: &Path, label: &str) {
        let name = src.file_name().map(|n| n.to_owned());
        self.move_as(src, name.as_deref(), dest_dir, label);
    }

    fn move_as(
        &self,
        src: &Path,
        name: Option<&std::ffi::OsStr>,
        dest_dir: &Path,
        label: &str,
    ) {
        if !src.exists() {
            return;
        }
        let Some(name) = name else {
            return;
        };
        self.ensure_dirs();

        // Avoid overwriting existing entries
        let mut dst = dest_dir.join(name);
        let stem = dst
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("feedback")
            .to_string();
        let ext = dst
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let mut counter = 1;
        while dst.exists() {
            dst = dest_dir.join(format!("{}_{}{}", stem, counter, ext));
            counter += 1;
        }

        match std::fs::rename(src, &dst) {
            Ok(()) => info!(
                "Marked feedback as {}: {} → {}",
                label,
                src.display(),
                dst.display()
            ),
            Err(e) => warn!("Failed to move feedback {} to {}: {}", src.display(), label, e),
        }
    }

    /// Delete entries in done/ and failed/ older than the retention window,
    /// sparing the `.gitkeep` sentinel.
    pub fn cleanup_old(&self) {
        self.cleanup_dir(&self.done_dir);
        self.cleanup_dir(&self.failed_dir);
    }

    fn cleanup_dir(&self, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let cutoff = SystemTime::now() - RETENTION;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(".gitkeep") {
                continue;
            }
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if old && let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to clean up {}: {}", path.display(), e);
            }
        }
    }
}

fn claimed_path(src: &Path) -> PathBuf {
    let mut name = src.as_os_str().to_owned();
    name.push(CLAIM_SUFFIX);
    PathBuf::from(name)
}

/// Priority from a numeric filename prefix; defaults to 1 (highest).
fn extract_priority(filename: &str) -> u32 {
    PRIORITY_PREFIX_RE
        .captures(filename)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .map(|n| n.max(1))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (FeedbackManager, TempDir) {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.paths.feedback_dir = dir.path().join("feedback").display().to_string();
        config.paths.feedback_done_dir = dir.path().join("feedback/done").display().to_string();
        config.paths.feedback_failed_dir =
            dir.path().join("feedback/failed").display().to_string();
        (FeedbackManager::new(&config), dir)
    }

    fn write_feedback(dir: &TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join("feedback").join(name);
        fs::write(&path, content).unwrap();
        path.display().to_string()
    }

    #[test]
    fn pending_tasks_sorted_with_priority_from_prefix() {
        let (manager, dir) = setup();
        write_feedback(&dir, "02-second.md", "second task");
        write_feedback(&dir, "01-first.md", "first task");
        write_feedback(&dir, "notes.txt", "unprefixed task");

        let tasks = manager.get_pending_feedback();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].description, "first task");
        assert_eq!(tasks[0].priority, 1);
        assert_eq!(tasks[1].description, "second task");
        assert_eq!(tasks[1].priority, 2);
        assert_eq!(tasks[2].description, "unprefixed task");
        assert_eq!(tasks[2].priority, 1);
        assert!(tasks.iter().all(|t| t.source == TaskSource::Feedback));
    }

    #[test]
    fn empty_files_sentinels_and_foreign_extensions_are_skipped() {
        let (manager, dir) = setup();
        write_feedback(&dir, "empty.md", "   \n");
        write_feedback(&dir, "script.sh", "not feedback");
        fs::write(dir.path().join("feedback/.gitkeep"), "").unwrap();

        assert!(manager.get_pending_feedback().is_empty());
    }

    #[test]
    fn zero_prefix_clamps_to_priority_one() {
        let (manager, dir) = setup();
        write_feedback(&dir, "00-urgent.md", "urgent");
        assert_eq!(manager.get_pending_feedback()[0].priority, 1);
    }

    #[test]
    fn claim_is_exclusive_and_unclaim_restores() {
        let (manager, dir) = setup();
        let path = write_feedback(&dir, "01-fix.md", "fix");

        assert!(manager.claim_feedback(&path));
        // Claimed file no longer shows as pending
        assert!(manager.get_pending_feedback().is_empty());
        // Second claim fails
        assert!(!manager.claim_feedback(&path));

        manager.unclaim_feedback(&path);
        assert_eq!(manager.get_pending_feedback().len(), 1);
    }

    #[test]
    fn claim_of_missing_file_fails() {
        let (manager, dir) = setup();
        let missing = dir.path().join("feedback/ghost.md").display().to_string();
        assert!(!manager.claim_feedback(&missing));
    }

    #[test]
    fn mark_done_claimed_restores_original_name() {
        let (manager, dir) = setup();
        let path = write_feedback(&dir, "01-fix.md", "fix");
        assert!(manager.claim_feedback(&path));
        manager.mark_done_claimed(&path);

        assert!(dir.path().join("feedback/done/01-fix.md").exists());
        assert!(!dir.path().join("feedback/01-fix.md.claimed").exists());
    }

    #[test]
    fn done_collisions_get_numeric_suffix() {
        let (manager, dir) = setup();
        let first = write_feedback(&dir, "01-fix.md", "v1");
        manager.mark_done(&first);
        let second = write_feedback(&dir, "01-fix.md", "v2");
        manager.mark_done(&second);

        assert!(dir.path().join("feedback/done/01-fix.md").exists());
        assert!(dir.path().join("feedback/done/01-fix_1.md").exists());
    }

    #[test]
    fn mark_failed_moves_to_failed_dir() {
        let (manager, dir) = setup();
        let path = write_feedback(&dir, "03-hopeless.md", "nope");
        manager.mark_failed(&path);
        assert!(dir.path().join("feedback/failed/03-hopeless.md").exists());
        assert!(!dir.path().join("feedback/03-hopeless.md").exists());
    }

    #[test]
    fn cleanup_spares_gitkeep_and_fresh_entries() {
        let (manager, dir) = setup();
        fs::write(dir.path().join("feedback/done/.gitkeep"), "").unwrap();
        let fresh = write_feedback(&dir, "01-new.md", "new");
        manager.mark_done(&fresh);

        manager.cleanup_old();
        // Fresh entries are within the retention window
        assert!(dir.path().join("feedback/done/01-new.md").exists());
        assert!(dir.path().join("feedback/done/.gitkeep").exists());
    }
}

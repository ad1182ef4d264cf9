//! Safety guards: instance lock, disk space, rate limits, cost cap,
//! consecutive-failure pause, protected files, changed-file ceiling.

use crate::config::Config;
use crate::errors::SafetyError;
use crate::state::LockedStateManager;
use anyhow::Context;
use fs2::FileExt;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct SafetyGuard {
    config: Config,
    state: Arc<LockedStateManager>,
    lock_path: PathBuf,
    lock_file: Option<File>,
}

impl SafetyGuard {
    pub fn new(config: Config, state: Arc<LockedStateManager>) -> Self {
        let lock_path = PathBuf::from(&config.paths.lock_file);
        Self {
            config,
            state,
            lock_path,
            lock_file: None,
        }
    }

    /// Acquire an exclusive advisory lock to prevent concurrent instances.
    ///
    /// If the lock is held but the PID recorded in the file is dead, the lock
    /// file is treated as stale: it is unlinked and acquisition is retried
    /// once.
    pub fn acquire_lock(&mut self) -> Result<(), SafetyError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))
                .map_err(SafetyError::Other)?;
        }

        let file = self.open_lock_file()?;
        if file.try_lock_exclusive().is_err() {
            let holder = std::fs::read_to_string(&self.lock_path).unwrap_or_default();
            let holder = holder.trim();
            if holder_is_alive(holder) {
                return Err(SafetyError::LockHeld);
            }
            warn!("Cleaning up stale lock file from dead process (PID {})", holder);
            drop(file);
            let _ = std::fs::remove_file(&self.lock_path);
            let retry = self.open_lock_file()?;
            if retry.try_lock_exclusive().is_err() {
                return Err(SafetyError::LockHeld);
            }
            self.write_own_pid(retry)?;
            return Ok(());
        }
        self.write_own_pid(file)?;
        Ok(())
    }

    fn open_lock_file(&self) -> Result<File, SafetyError> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open {}", self.lock_path.display()))
            .map_err(SafetyError::Other)
    }

    fn write_own_pid(&mut self, mut file: File) -> Result<(), SafetyError> {
        file.set_len(0)
            .and_then(|_| file.write_all(std::process::id().to_string().as_bytes()))
            .context("Failed to write PID to lock file")
            .map_err(SafetyError::Other)?;
        self.lock_file = Some(file);
        Ok(())
    }

    /// Release the instance lock. Closing the handle drops the flock.
    pub fn release_lock(&mut self) {
        self.lock_file = None;
    }

    pub fn check_disk_space(&self) -> Result<(), SafetyError> {
        let free = fs2::available_space(&self.config.target_dir)
            .with_context(|| format!("Failed to stat {}", self.config.target_dir))
            .map_err(SafetyError::Other)?;
        let free_mb = free as f64 / (1024.0 * 1024.0);
        if free_mb < self.config.safety.min_disk_space_mb as f64 {
            return Err(SafetyError::DiskSpace {
                free_mb,
                min_mb: self.config.safety.min_disk_space_mb,
            });
        }
        Ok(())
    }

    pub fn check_rate_limit(&self) -> Result<(), SafetyError> {
        let count = self
            .state
            .get_cycle_count_last_hour()
            .map_err(SafetyError::Other)?;
        let limit = self.config.safety.max_cycles_per_hour;
        if count >= limit {
            return Err(SafetyError::RateLimit { count, limit });
        }
        Ok(())
    }

    pub fn check_cost_limit(&self) -> Result<(), SafetyError> {
        let cost = self
            .state
            .get_total_cost(Duration::from_secs(3600))
            .map_err(SafetyError::Other)?;
        let limit = self.config.safety.max_cost_usd_per_hour;
        if cost >= limit {
            return Err(SafetyError::CostLimit { cost, limit });
        }
        Ok(())
    }

    pub fn check_consecutive_failures(&self) -> Result<(), SafetyError> {
        let count = self
            .state
            .get_consecutive_failures()
            .map_err(SafetyError::Other)?;
        let limit = self.config.safety.max_consecutive_failures;
        if count >= limit {
            return Err(SafetyError::ConsecutiveFailures { count, limit });
        }
        Ok(())
    }

    /// Ensure no changed path resolves to a protected file.
    ///
    /// When both paths exist a same-file probe (dev+inode) settles it;
    /// otherwise both sides are normalized to approximate canonical form so
    /// that a not-yet-created protected file is still blocked.
    pub fn check_protected_files(&self, changed_files: &[String]) -> Result<(), SafetyError> {
        let target = Path::new(&self.config.target_dir);
        let mut violations = Vec::new();

        'changed: for file in changed_files {
            let changed_path = target.join(file);
            for protected in &self.config.safety.protected_files {
                let protected_path = target.join(protected);
                if changed_path.exists() && protected_path.exists() {
                    if let (Ok(a), Ok(b)) = (changed_path.metadata(), protected_path.metadata()) {
                        use std::os::unix::fs::MetadataExt;
                        if a.dev() == b.dev() && a.ino() == b.ino() {
                            violations.push(file.clone());
                            continue 'changed;
                        }
                        // Definitively different inodes
                        continue;
                    }
                }
                if canonical_approx(&changed_path) == canonical_approx(&protected_path) {
                    violations.push(file.clone());
                    continue 'changed;
                }
            }
        }

        if !violations.is_empty() {
            return Err(SafetyError::ProtectedFiles { files: violations });
        }
        Ok(())
    }

    /// Ensure the number of changed files is within the configured limit,
    /// warning when it crosses 80% of it.
    pub fn check_file_count(&self, changed_files: &[String]) -> Result<(), SafetyError> {
        let limit = self.config.orchestrator.max_changed_files;
        if limit <= 0 {
            return Err(SafetyError::InvalidFileLimit(limit));
        }
        let limit = limit as usize;
        let count = changed_files.len();
        if count > limit {
            return Err(SafetyError::TooManyFiles { count, limit });
        }
        if count as f64 > limit as f64 * 0.8 {
            warn!("Changed file count ({}) approaching limit ({})", count, limit);
        }
        Ok(())
    }

    /// All pre-cycle checks, in order.
    pub fn pre_flight_checks(&self) -> Result<(), SafetyError> {
        self.check_disk_space()?;
        self.check_rate_limit()?;
        self.check_cost_limit()?;
        self.check_consecutive_failures()?;
        Ok(())
    }

    /// Checks applied to the set of files the tool changed.
    pub fn post_change_checks(&self, changed_files: &[String]) -> Result<(), SafetyError> {
        self.check_protected_files(changed_files)?;
        self.check_file_count(changed_files)?;
        Ok(())
    }
}

fn holder_is_alive(pid_text: &str) -> bool {
    let Ok(pid) = pid_text.parse::<i32>() else {
        return false;
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but not signalable by us, still alive
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Best-effort canonicalization that also works for paths that do not exist
/// yet: the deepest existing ancestor is resolved and the remainder rejoined,
/// falling back to lexical normalization.
fn canonical_approx(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name())
        && !parent.as_os_str().is_empty()
    {
        return canonical_approx(parent).join(name);
    }
    normalize_lexically(path)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

//! Cycle history persisted to `state/history.json`.
//!
//! The history is a single JSON array of records, append-only from the
//! orchestrator's perspective (old entries are pruned from the head when the
//! cap is exceeded). Rewrites are atomic: temp file in the same directory,
//! fsync, rename with backoff. Reads go through an mtime-cached snapshot.

use crate::config::Config;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Backoff schedule for the atomic rename, tolerating foreign holders of the
/// target file (e.g. a dashboard mid-read on some platforms).
const RENAME_RETRY_DELAYS: [f64; 5] = [0.1, 0.3, 0.9, 2.7, 8.1];

/// Current unix time as fractional seconds.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Persisted outcome of one orchestration cycle. Immutable after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub timestamp: f64,
    pub task_description: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub validation_summary: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub task_descriptions: Vec<String>,
    #[serde(default)]
    pub task_types: Vec<String>,
    #[serde(default)]
    pub task_keys: Vec<String>,
    #[serde(default)]
    pub task_source_files: Vec<String>,
    #[serde(default)]
    pub task_line_numbers: Vec<Option<u32>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_revision_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_review_approved: Option<bool>,
}

fn default_task_type() -> String {
    "unknown".to_string()
}

fn default_batch_size() -> usize {
    1
}

impl CycleRecord {
    pub fn new(timestamp: f64, task_description: impl Into<String>) -> Self {
        Self {
            timestamp,
            task_description: task_description.into(),
            task_type: default_task_type(),
            success: false,
            commit_hash: String::new(),
            cost_usd: 0.0,
            duration_seconds: 0.0,
            validation_summary: String::new(),
            error: String::new(),
            task_descriptions: Vec::new(),
            task_types: Vec::new(),
            task_keys: Vec::new(),
            task_source_files: Vec::new(),
            task_line_numbers: Vec::new(),
            batch_size: 1,
            pipeline_mode: None,
            pipeline_revision_count: None,
            pipeline_review_approved: None,
        }
    }
}

struct HistoryCache {
    records: Vec<CycleRecord>,
    mtime: Option<SystemTime>,
}

/// Reads and writes the cycle history file.
pub struct StateManager {
    history_file: PathBuf,
    max_history_records: usize,
    cache: Mutex<Option<HistoryCache>>,
}

impl StateManager {
    pub fn new(config: &Config) -> Self {
        Self {
            history_file: PathBuf::from(&config.paths.history_file),
            max_history_records: config.safety.max_history_records,
            cache: Mutex::new(None),
        }
    }

    pub fn history_file(&self) -> &Path {
        &self.history_file
    }

    /// Drop the in-memory snapshot so the next read hits the disk. Used by
    /// the locked wrapper so interleaved writers see each other's updates.
    pub fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        if let Some(parent) = self.history_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state dir {}", parent.display()))?;
        }
        Ok(())
    }

    fn load_history(&self) -> Vec<CycleRecord> {
        if !self.history_file.exists() {
            if let Ok(mut cache) = self.cache.lock() {
                *cache = Some(HistoryCache { records: Vec::new(), mtime: None });
            }
            return Vec::new();
        }

        let current_mtime = std::fs::metadata(&self.history_file)
            .and_then(|m| m.modified())
            .ok();

        if let Ok(cache) = self.cache.lock()
            && let Some(ref cached) = *cache
            && cached.mtime.is_some()
            && cached.mtime == current_mtime
        {
            return cached.records.clone();
        }

        let records = match std::fs::read_to_string(&self.history_file) {
            Ok(text) if text.trim().is_empty() => Vec::new(),
            Ok(text) => match serde_json::from_str::<Vec<CycleRecord>>(&text) {
                Ok(records) => records,
                Err(e) => {
                    warn!("Failed to parse history: {}", e);
                    return Vec::new();
                }
            },
            Err(e) => {
                warn!("Failed to read history: {}", e);
                return Vec::new();
            }
        };

        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(HistoryCache { records: records.clone(), mtime: current_mtime });
        }
        records
    }

    /// Atomic write: temp file in the same directory, fsync, rename with
    /// backoff.
    fn save_history(&self, records: Vec<CycleRecord>) -> Result<()> {
        self.ensure_dir()?;
        let dir = self
            .history_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut tmp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(&dir)
            .context("Failed to create temp history file")?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &records)
            .context("Failed to serialize history")?;
        tmp.as_file().sync_all().context("Failed to sync history")?;

        let mut pending = tmp;
        let mut last_err = None;
        let mut renamed = false;
        for (attempt, delay) in RENAME_RETRY_DELAYS.iter().enumerate() {
            match pending.persist(&self.history_file) {
                Ok(_) => {
                    renamed = true;
                    break;
                }
                Err(e) => {
                    pending = e.file;
                    last_err = Some(e.error);
                    if attempt < RENAME_RETRY_DELAYS.len() - 1 {
                        std::thread::sleep(Duration::from_secs_f64(*delay));
                    }
                }
            }
        }
        if !renamed {
            let err = last_err.map(anyhow::Error::from).unwrap_or_else(|| {
                anyhow::anyhow!("history rename failed with no recorded error")
            });
            return Err(err.context("Failed to replace history file"));
        }

        let mtime = std::fs::metadata(&self.history_file)
            .and_then(|m| m.modified())
            .ok();
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(HistoryCache { records, mtime });
        }
        Ok(())
    }

    fn prune(&self, mut records: Vec<CycleRecord>) -> Vec<CycleRecord> {
        if records.len() > self.max_history_records {
            let excess = records.len() - self.max_history_records;
            records.drain(..excess);
        }
        records
    }

    /// Append a cycle record to history.
    pub fn record_cycle(&self, record: CycleRecord) -> Result<()> {
        let mut records = self.load_history();
        let description = record.task_description.clone();
        let success = record.success;
        records.push(record);
        let records = self.prune(records);
        self.save_history(records)?;
        info!("Recorded cycle: {} (success={})", description, success);
        Ok(())
    }

    /// Whether a task was attempted within the lookback window, matched by
    /// key when one is supplied, and by description otherwise.
    pub fn was_recently_attempted(
        &self,
        task_description: &str,
        lookback: Duration,
        task_key: &str,
    ) -> bool {
        let cutoff = now_ts() - lookback.as_secs_f64();
        self.load_history().iter().any(|r| {
            if r.timestamp < cutoff {
                return false;
            }
            if !task_key.is_empty() && r.task_keys.iter().any(|k| k == task_key) {
                return true;
            }
            r.task_description == task_description
                || r.task_descriptions.iter().any(|d| d == task_description)
        })
    }

    pub fn get_cycle_count_last_hour(&self) -> usize {
        let cutoff = now_ts() - 3600.0;
        self.load_history().iter().filter(|r| r.timestamp >= cutoff).count()
    }

    /// Total cost in USD over the lookback period.
    pub fn get_total_cost(&self, lookback: Duration) -> f64 {
        let cutoff = now_ts() - lookback.as_secs_f64();
        self.load_history()
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .map(|r| r.cost_usd)
            .sum()
    }

    /// Number of consecutive failures at the end of history.
    pub fn get_consecutive_failures(&self) -> usize {
        self.load_history()
            .iter()
            .rev()
            .take_while(|r| !r.success)
            .count()
    }

    /// Number of failed attempts for a specific task, matched by key or
    /// description, optionally filtered by task type.
    pub fn get_task_failure_count(
        &self,
        task_description: &str,
        task_type: &str,
        task_key: &str,
    ) -> usize {
        self.load_history()
            .iter()
            .filter(|r| !r.success)
            .filter(|r| {
                let key_match =
                    !task_key.is_empty() && r.task_keys.iter().any(|k| k == task_key);
                let desc_match = r.task_description == task_description
                    || r.task_descriptions.iter().any(|d| d == task_description);
                key_match || desc_match
            })
            .filter(|r| {
                task_type.is_empty()
                    || r.task_type == task_type
                    || r.task_types.iter().any(|t| t == task_type)
            })
            .count()
    }
}

/// Concurrency-safe wrapper: every read-modify-write (and every read, so the
/// cache is invalidated) is guarded by an advisory lock on `history.lock`.
pub struct LockedStateManager {
    inner: StateManager,
    lock_path: PathBuf,
}

impl LockedStateManager {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: StateManager::new(config),
            lock_path: Path::new(&config.paths.state_dir).join("history.lock"),
        }
    }

    pub fn history_file(&self) -> &Path {
        self.inner.history_file()
    }

    fn with_lock<T>(&self, f: impl FnOnce(&StateManager) -> T) -> Result<T> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open {}", self.lock_path.display()))?;
        file.lock_exclusive().context("Failed to lock history.lock")?;
        // Another process may have written while we waited for the lock.
        self.inner.invalidate_cache();
        let result = f(&self.inner);
        let _ = fs2::FileExt::unlock(&file);
        Ok(result)
    }

    pub fn record_cycle(&self, record: CycleRecord) -> Result<()> {
        self.with_lock(|state| state.record_cycle(record))?
    }

    pub fn was_recently_attempted(
        &self,
        task_description: &str,
        lookback: Duration,
        task_key: &str,
    ) -> Result<bool> {
        self.with_lock(|state| state.was_recently_attempted(task_description, lookback, task_key))
    }

    pub fn get_cycle_count_last_hour(&self) -> Result<usize> {
        self.with_lock(|state| state.get_cycle_count_last_hour())
    }

    pub fn get_total_cost(&self, lookback: Duration) -> Result<f64> {
        self.with_lock(|state| state.get_total_cost(lookback))
    }

    pub fn get_consecutive_failures(&self) -> Result<usize> {
        self.with_lock(|state| state.get_consecutive_failures())
    }

    pub fn get_task_failure_count(
        &self,
        task_description: &str,
        task_type: &str,
        task_key: &str,
    ) -> Result<usize> {
        self.with_lock(|state| {
            state.get_task_failure_count(task_description, task_type, task_key)
        })
    }
}

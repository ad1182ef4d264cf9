//! Live cycle state published for dashboard visibility.
//!
//! The orchestrator rewrites `state/current_cycle.json` (or a per-worker
//! variant) atomically at phase transitions; readers poll it to see what is
//! happening right now. Crash detection belongs to the reader: the file
//! existing while the orchestrator process is dead means a stale cycle.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Phase/task/cost snapshot of one in-flight cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    /// e.g. "task_selected", "planning", "executing", "validating", "retrying"
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub task_descriptions: Vec<String>,
    #[serde(default)]
    pub started_at: f64,
    /// e.g. "planner", "coder", "tester", "reviewer"
    #[serde(default)]
    pub pipeline_agent: String,
    #[serde(default)]
    pub pipeline_revision: u32,
    #[serde(default)]
    pub accumulated_cost: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub retry_count: u32,
}

fn default_batch_size() -> usize {
    1
}

impl Default for CycleState {
    fn default() -> Self {
        Self {
            phase: String::new(),
            task_description: String::new(),
            task_type: String::new(),
            task_descriptions: Vec::new(),
            started_at: 0.0,
            pipeline_agent: String::new(),
            pipeline_revision: 0,
            accumulated_cost: 0.0,
            batch_size: 1,
            retry_count: 0,
        }
    }
}

/// Writes current cycle state atomically to a JSON file.
pub struct CycleStateWriter {
    path: PathBuf,
}

impl CycleStateWriter {
    pub fn new(state_dir: impl AsRef<Path>, worker_id: Option<usize>) -> Self {
        let filename = match worker_id {
            Some(id) => format!("current_cycle_worker_{}.json", id),
            None => "current_cycle.json".to_string(),
        };
        Self {
            path: state_dir.as_ref().join(filename),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically write cycle state via temp file + rename. Failures are
    /// warned, never propagated: a dashboard gap must not fail a cycle.
    pub fn write(&self, state: &CycleState) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("Failed to create state dir {}: {}", parent.display(), e);
            return;
        }
        let result = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(parent)
            .and_then(|mut tmp| {
                serde_json::to_writer(tmp.as_file_mut(), state)
                    .map_err(std::io::Error::other)?;
                tmp.persist(&self.path).map_err(|e| e.error)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!("Failed to write cycle state: {}", e);
        }
    }

    /// Remove the cycle state file (cycle completed). Idempotent.
    pub fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to clear cycle state: {}", e);
        }
    }

    /// Read the current state, apply the mutation, and write it back.
    /// Starts from a default state when the file is absent or unreadable.
    pub fn update(&self, mutate: impl FnOnce(&mut CycleState)) {
        let mut state = read_cycle_state_file(&self.path).unwrap_or_default();
        mutate(&mut state);
        self.write(&state);
    }
}

/// Read the orchestrator-level cycle state. None when no cycle is active.
pub fn read_cycle_state(state_dir: impl AsRef<Path>) -> Option<CycleState> {
    read_cycle_state_file(&state_dir.as_ref().join("current_cycle.json"))
}

fn read_cycle_state_file(path: &Path) -> Option<CycleState> {
    let text = std::fs::read_to_string(path).ok()?;
    if text.trim().is_empty() {
        return None;
    }
    serde_json::from_str(&text).ok()
}

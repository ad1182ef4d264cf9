//! Process-group-aware subprocess execution.
//!
//! Every child is launched in its own session so that the child and all of
//! its descendants share a process group distinct from the orchestrator's.
//! On timeout the entire group is killed, preventing orphaned grandchildren
//! from shell pipelines or git hooks.

use anyhow::Result;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, setsid};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::warn;

/// How long to wait for remaining output after killing a timed-out group.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of [`run_argv`] / [`run_shell`], mirroring a completed process.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Options for a subprocess run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// When set, the spawned group's pgid is published here so another task
    /// can kill it cooperatively (see [`ProcessGroup::kill`]).
    pub group: Option<Arc<ProcessGroup>>,
}

/// Handle to the process group of a currently running child.
///
/// The pgid is published after spawn and cleared when the run completes, so
/// `kill()` from a signal handler or timeout thread only ever targets a live
/// group owned by this orchestrator.
#[derive(Debug, Default)]
pub struct ProcessGroup {
    pgid: Mutex<Option<i32>>,
}

impl ProcessGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn publish(&self, pgid: i32) {
        if let Ok(mut slot) = self.pgid.lock() {
            *slot = Some(pgid);
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.pgid.lock() {
            *slot = None;
        }
    }

    /// Send SIGKILL to the published group, if any. Safe to call at any time.
    pub fn kill(&self) {
        let pgid = self.pgid.lock().ok().and_then(|slot| *slot);
        if let Some(pgid) = pgid {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }
}

/// Kill a child and its entire process group.
///
/// Sends SIGKILL to the group, then a redundant kill on the leader in case
/// the group lookup failed, and waits briefly for the leader to be reaped.
pub async fn kill_process_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    let _ = child.start_kill();
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, child.wait()).await;
}

/// Run an argv-style command, killing its entire process group on timeout.
pub async fn run_argv(argv: &[String], opts: RunOptions) -> Result<RunOutput> {
    anyhow::ensure!(!argv.is_empty(), "empty command");
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    run_command(cmd, opts).await
}

/// Run a command line through `sh -c`, killing its process group on timeout.
pub async fn run_shell(command: &str, opts: RunOptions) -> Result<RunOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    run_command(cmd, opts).await
}

async fn run_command(mut cmd: Command, opts: RunOptions) -> Result<RunOutput> {
    if let Some(ref cwd) = opts.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // New session => dedicated process group whose pgid is the child's pid.
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    // Exec errors (not found, permission) surface to the caller here;
    // normal child failure is reported through `returncode`.
    let mut child = cmd.spawn()?;
    let child_pid = child.id().map(|p| p as i32).unwrap_or(0);
    if let Some(ref group) = opts.group {
        group.publish(child_pid);
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let wait_result = match opts.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await,
        None => Ok(child.wait().await),
    };

    let output = match wait_result {
        Ok(status) => {
            let status = status?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            RunOutput {
                returncode: status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                timed_out: false,
            }
        }
        Err(_) => {
            kill_process_group(&mut child).await;
            // Capture any partial output produced before the timeout; the
            // readers hit EOF once the group is dead, but bound the drain
            // in case a leaked descendant still holds the pipe open.
            let stdout = match tokio::time::timeout(DRAIN_TIMEOUT, stdout_task).await {
                Ok(Ok(buf)) => buf,
                _ => Vec::new(),
            };
            let stderr = match tokio::time::timeout(DRAIN_TIMEOUT, stderr_task).await {
                Ok(Ok(buf)) => buf,
                _ => Vec::new(),
            };
            let secs = opts.timeout.map(|t| t.as_secs()).unwrap_or(0);
            let prefix = format!("[TIMEOUT after {}s] ", secs);
            let partial_stdout = String::from_utf8_lossy(&stdout).into_owned();
            let partial_stderr = String::from_utf8_lossy(&stderr).into_owned();
            warn!("Command timed out after {}s, killed process group {}", secs, child_pid);
            RunOutput {
                returncode: -1,
                stdout: format!("{}{}", prefix, partial_stdout),
                stderr: if partial_stderr.is_empty() {
                    String::new()
                } else {
                    format!("{}{}", prefix, partial_stderr)
                },
                timed_out: true,
            }
        }
    };

    if let Some(ref group) = opts.group {
        group.clear();
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn run_argv_captures_stdout_and_exit_code() {
        let out = run_argv(&argv(&["echo", "hello"]), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(out.returncode, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn run_shell_captures_stderr_and_nonzero_exit() {
        let out = run_shell("echo oops >&2; exit 3", RunOptions::default())
            .await
            .unwrap();
        assert_eq!(out.returncode, 3);
        assert_eq!(out.stderr.trim(), "oops");
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn run_argv_missing_binary_is_an_error() {
        let result = run_argv(
            &argv(&["definitely-not-a-real-binary-xyz"]),
            RunOptions::default(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn timeout_kills_group_and_prefixes_output() {
        let start = std::time::Instant::now();
        let out = run_shell(
            "echo partial; sleep 30",
            RunOptions {
                timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.returncode, -1);
        assert!(out.stdout.starts_with("[TIMEOUT after 1s] "));
        assert!(out.stdout.contains("partial"));
        assert!(out.stderr.is_empty());
        // The whole group (sh + sleep) must be dead well before 30s.
        assert!(start.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn timeout_kills_grandchildren_in_shell_pipeline() {
        // The backgrounded sleep is a grandchild; group kill must reach it
        // so the stdout pipe closes and the drain does not hang.
        let start = std::time::Instant::now();
        let out = run_shell(
            "sleep 30 & wait",
            RunOptions {
                timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn cwd_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell(
            "pwd",
            RunOptions {
                cwd: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let printed = std::path::PathBuf::from(out.stdout.trim())
            .canonicalize()
            .unwrap();
        assert_eq!(printed, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn process_group_handle_kills_running_child() {
        let group = ProcessGroup::new();
        let group_clone = group.clone();
        let killer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            group_clone.kill();
        });
        let start = std::time::Instant::now();
        let out = run_shell(
            "sleep 30",
            RunOptions {
                group: Some(group),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        killer.await.unwrap();
        assert_ne!(out.returncode, 0);
        assert!(start.elapsed() < Duration::from_secs(15));
    }
}

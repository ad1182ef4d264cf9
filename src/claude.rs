//! Invoke the external LLM CLI and parse its JSON envelope.
//!
//! The CLI is expected to accept `-p`, `--model`, `--max-turns`,
//! `--output-format json` and optional repeated `--add-dir` flags, and to
//! emit a JSON object on stdout, possibly surrounded by banner and log lines.
//! Transient failures are retried with a fixed schedule (rate limits get
//! exponential backoff instead); repeated provider-side failures trip a
//! circuit breaker that short-circuits further calls.

use crate::config::Config;
use crate::process::{ProcessGroup, RunOptions, run_argv};
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rate limit|429|too many requests").unwrap());

/// Failures that count toward opening the circuit breaker.
static BREAKER_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate limit|429|too many requests|5\d{2}|server is overloaded").unwrap()
});

/// Structured outcome of one CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct ClaudeResult {
    pub success: bool,
    pub result_text: String,
    pub cost_usd: f64,
    pub duration_seconds: f64,
    pub raw_json: Option<Value>,
    pub error: String,
}

impl ClaudeResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
            half_open_max_calls: 1,
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

/// Short-lived throttle protecting the provider from further calls after
/// repeated failures. One per runner instance, never shared across workers.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                half_open_calls: 0,
            }),
        }
    }

    /// Current state. Reading auto-transitions open → half_open once the
    /// recovery timeout has elapsed; closed never becomes half_open directly.
    pub fn state(&self) -> BreakerState {
        let Ok(mut inner) = self.inner.lock() else {
            return BreakerState::Closed;
        };
        if inner.state == BreakerState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.recovery_timeout
        {
            inner.state = BreakerState::HalfOpen;
            inner.half_open_calls = 0;
            debug!("Circuit breaker half-open, allowing probe calls");
        }
        inner.state
    }

    /// Whether a call may proceed right now. Half-open grants up to
    /// `half_open_max_calls` probes.
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                let Ok(mut inner) = self.inner.lock() else {
                    return false;
                };
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state != BreakerState::Closed {
                info!("Circuit breaker closed after successful call");
            }
            inner.state = BreakerState::Closed;
            inner.failure_count = 0;
            inner.half_open_calls = 0;
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failure_count += 1;
            match inner.state {
                BreakerState::HalfOpen => {
                    // Failed probe reopens with a fresh timestamp
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.half_open_calls = 0;
                    warn!("Circuit breaker reopened after failed probe");
                }
                BreakerState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        "Circuit breaker opened after {} consecutive failures",
                        inner.failure_count
                    );
                }
                _ => {}
            }
        }
    }
}

/// Runs the external LLM CLI with retry, backoff and a circuit breaker.
pub struct ClaudeRunner {
    config: Config,
    add_dirs: Vec<PathBuf>,
    breaker: CircuitBreaker,
    group: Arc<ProcessGroup>,
    terminated: AtomicBool,
}

impl ClaudeRunner {
    pub fn new(config: Config) -> Self {
        Self::with_breaker(config, CircuitBreakerConfig::default())
    }

    pub fn with_breaker(config: Config, breaker: CircuitBreakerConfig) -> Self {
        Self {
            config,
            add_dirs: Vec::new(),
            breaker: CircuitBreaker::new(breaker),
            group: ProcessGroup::new(),
            terminated: AtomicBool::new(false),
        }
    }

    /// Extra directories passed to the CLI via repeated `--add-dir` flags.
    pub fn with_add_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.add_dirs = dirs;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Kill the active subprocess group and refuse further invocations.
    /// Thread-safe: callable from a signal handler task.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.group.kill();
    }

    fn build_command(&self, prompt: &str) -> Vec<String> {
        let cc = &self.config.claude;
        let mut cmd = vec![
            cc.command.clone(),
            "-p".to_string(),
            prompt.to_string(),
            "--model".to_string(),
            self.config.effective_model().to_string(),
            "--max-turns".to_string(),
            cc.max_turns.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        for dir in &self.add_dirs {
            cmd.push("--add-dir".to_string());
            cmd.push(dir.display().to_string());
        }
        cmd
    }

    fn fixed_delay(&self, attempt: u32) -> Duration {
        let delays = &self.config.claude.retry_delays;
        if delays.is_empty() {
            return Duration::from_secs(2);
        }
        let index = (attempt as usize).min(delays.len() - 1);
        Duration::from_secs(delays[index])
    }

    fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let cc = &self.config.claude;
        let secs = cc.rate_limit_base_delay * cc.rate_limit_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Run the CLI with the given prompt and return the parsed result.
    pub async fn run(&self, prompt: &str, working_dir: Option<&Path>) -> ClaudeResult {
        if !self.breaker.try_acquire() {
            return ClaudeResult::failure("Circuit breaker open");
        }

        let cmd = self.build_command(prompt);
        let cwd = working_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&self.config.target_dir));
        let timeout = Duration::from_secs(self.config.claude.timeout_seconds);
        let max_retries = self.config.claude.max_retries;

        info!("Running Claude CLI in {}", cwd.display());
        debug!("Command: {}", cmd.join(" "));

        let mut attempt = 0u32;
        let output = loop {
            if self.terminated.load(Ordering::SeqCst) {
                return ClaudeResult::failure("Runner was terminated");
            }

            let run = run_argv(
                &cmd,
                RunOptions {
                    cwd: Some(cwd.clone()),
                    timeout: Some(timeout),
                    group: Some(self.group.clone()),
                },
            )
            .await;

            match run {
                Err(e) => {
                    let not_found = e
                        .downcast_ref::<std::io::Error>()
                        .map(|io| io.kind() == std::io::ErrorKind::NotFound)
                        .unwrap_or(false);
                    if not_found {
                        return ClaudeResult::failure(format!(
                            "Claude CLI command not found: {}",
                            self.config.claude.command
                        ));
                    }
                    if attempt < max_retries {
                        let delay = self.fixed_delay(attempt);
                        warn!(
                            "Claude CLI OS error (attempt {}/{}): {}, retrying in {:?}",
                            attempt + 1,
                            max_retries + 1,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return ClaudeResult::failure(format!("Failed to run Claude CLI: {}", e));
                }
                Ok(out) if out.timed_out => {
                    if attempt < max_retries {
                        let delay = self.fixed_delay(attempt);
                        warn!(
                            "Claude CLI timed out (attempt {}/{}), retrying in {:?}",
                            attempt + 1,
                            max_retries + 1,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return ClaudeResult::failure(format!(
                        "Claude CLI timed out after {}s",
                        self.config.claude.timeout_seconds
                    ));
                }
                Ok(out) if out.returncode != 0 => {
                    if BREAKER_FAILURE_RE.is_match(&out.stderr) {
                        self.breaker.record_failure();
                    }
                    if attempt < max_retries {
                        let delay = if RATE_LIMIT_RE.is_match(&out.stderr) {
                            let delay = self.rate_limit_delay(attempt);
                            warn!(
                                "Rate limited (attempt {}/{}), backing off {:?}",
                                attempt + 1,
                                max_retries + 1,
                                delay
                            );
                            delay
                        } else {
                            let delay = self.fixed_delay(attempt);
                            warn!(
                                "Claude CLI exited with code {} (attempt {}/{}), retrying in {:?}",
                                out.returncode,
                                attempt + 1,
                                max_retries + 1,
                                delay
                            );
                            delay
                        };
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return ClaudeResult::failure(format!(
                        "Claude CLI exited with code {}: {}",
                        out.returncode,
                        out.stderr.trim()
                    ));
                }
                Ok(out) => break out,
            }
        };

        let data = match parse_json_response(&output.stdout) {
            Some(data) => data,
            None => {
                return ClaudeResult {
                    success: false,
                    result_text: output.stdout,
                    error: "Failed to parse Claude CLI output: no JSON object found".to_string(),
                    ..Default::default()
                };
            }
        };

        let result_text = match data.get("result").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => {
                warn!("Claude CLI response has no 'result' key");
                String::new()
            }
        };
        let cost_usd = data
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .or_else(|| data.get("cost_usd").and_then(Value::as_f64))
            .unwrap_or(0.0);
        let duration_seconds = data
            .get("duration_ms")
            .and_then(Value::as_f64)
            .map(|ms| ms / 1000.0)
            .or_else(|| data.get("duration_seconds").and_then(Value::as_f64))
            .unwrap_or(0.0);

        self.breaker.record_success();
        ClaudeResult {
            success: true,
            result_text,
            cost_usd,
            duration_seconds,
            raw_json: Some(data),
            error: String::new(),
        }
    }
}

/// Extract the first top-level JSON object from noisy CLI stdout.
///
/// Strategies, in order:
/// 1. each trimmed line beginning with `{` parsed as a complete object;
/// 2. each line scanned for later `{` positions, parsing the suffix;
/// 3. a streaming parse from every `{` in the whole output, tolerating
///    trailing log lines.
pub fn parse_json_response(stdout: &str) -> Option<Value> {
    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line)
            && value.is_object()
        {
            return Some(value);
        }
    }

    for line in stdout.lines() {
        let line = line.trim();
        for (pos, _) in line.match_indices('{') {
            if pos == 0 {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(&line[pos..])
                && value.is_object()
            {
                return Some(value);
            }
        }
    }

    for (pos, ch) in stdout.char_indices() {
        if ch != '{' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&stdout[pos..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next()
            && value.is_object()
        {
            return Some(value);
        }
    }

    None
}

/// Resolve a model alias to its canonical ID via a minimal CLI probe.
///
/// Runs `<cmd> -p x --model <alias> --output-format json --max-turns 1
/// --tools ""` and reads the first key of the `modelUsage` object. Returns
/// None on any failure; callers keep using the alias.
pub async fn resolve_model_id(
    model_alias: &str,
    claude_command: &str,
    timeout: Duration,
) -> Option<String> {
    let cmd: Vec<String> = [
        claude_command,
        "-p",
        "x",
        "--model",
        model_alias,
        "--output-format",
        "json",
        "--max-turns",
        "1",
        "--tools",
        "",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let out = match run_argv(
        &cmd,
        RunOptions {
            timeout: Some(timeout),
            ..Default::default()
        },
    )
    .await
    {
        Ok(out) => out,
        Err(e) => {
            warn!("Model resolution failed (CLI error): {}", e);
            return None;
        }
    };
    if out.timed_out || out.returncode != 0 {
        warn!(
            "Model resolution failed (exit code {}): {}",
            out.returncode,
            out.stderr.trim().chars().take(200).collect::<String>()
        );
        return None;
    }

    for line in out.stdout.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line)
            && let Some(Value::Object(usage)) = map.get("modelUsage")
            && let Some(resolved) = usage.keys().next()
        {
            info!("Resolved model '{}' -> '{}'", model_alias, resolved);
            return Some(resolved.clone());
        }
    }

    warn!("Model resolution failed: no modelUsage in CLI output");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{TempDir, tempdir};

    fn write_cli(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-claude");
        fs::write(&path, format!("#!/bin/sh\ndir=$(dirname \"$0\")\n{}\n", body)).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn runner_for(dir: &TempDir, cli: &Path) -> ClaudeRunner {
        let mut config = Config::default();
        config.target_dir = dir.path().display().to_string();
        config.claude.command = cli.display().to_string();
        config.claude.max_retries = 0;
        config.claude.timeout_seconds = 20;
        ClaudeRunner::new(config)
    }

    fn attempts(dir: &TempDir) -> u32 {
        fs::read_to_string(dir.path().join("attempts"))
            .map(|s| s.trim().parse().unwrap_or(0))
            .unwrap_or(0)
    }

    const COUNT_ATTEMPTS: &str =
        "n=$(cat \"$dir/attempts\" 2>/dev/null || echo 0)\nn=$((n+1))\necho \"$n\" > \"$dir/attempts\"";

    #[tokio::test]
    async fn successful_run_parses_envelope() {
        let dir = tempdir().unwrap();
        let cli = write_cli(
            dir.path(),
            r#"echo "Welcome banner"
echo '{"result": "did the thing", "total_cost_usd": 0.25, "duration_ms": 1500}'
echo "trailing log line""#,
        );
        let runner = runner_for(&dir, &cli);
        let result = runner.run("do the thing", None).await;
        assert!(result.success, "error: {}", result.error);
        assert_eq!(result.result_text, "did the thing");
        assert!((result.cost_usd - 0.25).abs() < 1e-9);
        assert!((result.duration_seconds - 1.5).abs() < 1e-9);
        assert!(result.raw_json.is_some());
    }

    #[tokio::test]
    async fn cost_falls_back_to_cost_usd_and_duration_seconds() {
        let dir = tempdir().unwrap();
        let cli = write_cli(
            dir.path(),
            r#"echo '{"result": "ok", "cost_usd": 0.1, "duration_seconds": 2.0}'"#,
        );
        let runner = runner_for(&dir, &cli);
        let result = runner.run("x", None).await;
        assert!(result.success);
        assert!((result.cost_usd - 0.1).abs() < 1e-9);
        assert!((result.duration_seconds - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_result_key_is_success_with_empty_text() {
        let dir = tempdir().unwrap();
        let cli = write_cli(dir.path(), r#"echo '{"subtype": "success"}'"#);
        let runner = runner_for(&dir, &cli);
        let result = runner.run("x", None).await;
        assert!(result.success);
        assert_eq!(result.result_text, "");
    }

    #[tokio::test]
    async fn unparseable_output_fails_without_retry() {
        let dir = tempdir().unwrap();
        let cli = write_cli(dir.path(), &format!("{}\necho 'not json at all'", COUNT_ATTEMPTS));
        let mut runner = runner_for(&dir, &cli);
        runner.config.claude.max_retries = 3;
        let result = runner.run("x", None).await;
        assert!(!result.success);
        assert!(result.error.contains("parse"));
        assert_eq!(result.result_text.trim(), "not json at all");
        assert_eq!(attempts(&dir), 1);
    }

    #[tokio::test]
    async fn missing_binary_fails_without_retry() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.target_dir = dir.path().display().to_string();
        config.claude.command = "definitely-not-a-real-claude".to_string();
        config.claude.max_retries = 3;
        let runner = ClaudeRunner::new(config);
        let result = runner.run("x", None).await;
        assert!(!result.success);
        assert!(result.error.contains("not found"));
    }

    #[tokio::test]
    async fn nonzero_exit_retries_on_fixed_schedule() {
        let dir = tempdir().unwrap();
        let cli = write_cli(
            dir.path(),
            &format!(
                "{}\nif [ \"$n\" -le 2 ]; then echo transient >&2; exit 1; fi\necho '{{\"result\": \"ok\"}}'",
                COUNT_ATTEMPTS
            ),
        );
        let mut runner = runner_for(&dir, &cli);
        runner.config.claude.max_retries = 3;
        runner.config.claude.retry_delays = vec![0];
        let result = runner.run("x", None).await;
        assert!(result.success, "error: {}", result.error);
        assert_eq!(attempts(&dir), 3);
    }

    #[tokio::test]
    async fn rate_limited_exit_uses_exponential_backoff_and_recovers() {
        let dir = tempdir().unwrap();
        let cli = write_cli(
            dir.path(),
            &format!(
                "{}\nif [ \"$n\" -le 1 ]; then echo '429 too many requests' >&2; exit 1; fi\necho '{{\"result\": \"recovered\"}}'",
                COUNT_ATTEMPTS
            ),
        );
        let mut runner = runner_for(&dir, &cli);
        runner.config.claude.max_retries = 1;
        runner.config.claude.rate_limit_base_delay = 0.01;
        let result = runner.run("x", None).await;
        assert!(result.success);
        assert_eq!(result.result_text, "recovered");
        assert_eq!(attempts(&dir), 2);
    }

    #[tokio::test]
    async fn timeout_is_reported_after_exhausting_retries() {
        let dir = tempdir().unwrap();
        let cli = write_cli(dir.path(), "sleep 30");
        let mut runner = runner_for(&dir, &cli);
        runner.config.claude.timeout_seconds = 1;
        let result = runner.run("x", None).await;
        assert!(!result.success);
        assert!(result.error.contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_short_circuits() {
        let dir = tempdir().unwrap();
        let cli = write_cli(
            dir.path(),
            &format!("{}\necho 'server is overloaded' >&2\nexit 1", COUNT_ATTEMPTS),
        );
        let mut config = Config::default();
        config.target_dir = dir.path().display().to_string();
        config.claude.command = cli.display().to_string();
        config.claude.max_retries = 0;
        let runner = ClaudeRunner::with_breaker(
            config,
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
        );

        assert!(!runner.run("x", None).await.success);
        assert!(!runner.run("x", None).await.success);
        assert_eq!(runner.breaker().state(), BreakerState::Open);

        // Third call is rejected without touching the subprocess
        let result = runner.run("x", None).await;
        assert_eq!(result.error, "Circuit breaker open");
        assert_eq!(attempts(&dir), 2);
    }

    #[test]
    fn breaker_state_machine_follows_transitions() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(0),
            half_open_max_calls: 1,
        });
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        // Reading after the (zero) recovery window transitions to half-open
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // One probe allowed, a second denied
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn breaker_failed_probe_reopens_with_fresh_timestamp() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        });
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());

        // Force the half-open transition by expiring the window
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(0),
            half_open_max_calls: 1,
        });
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire());
        breaker.record_failure();
        // Reopened; with a zero window the next read is half-open again,
        // but the probe quota was reset.
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire());
    }

    #[tokio::test]
    async fn terminate_prevents_further_runs() {
        let dir = tempdir().unwrap();
        let cli = write_cli(dir.path(), r#"echo '{"result": "ok"}'"#);
        let runner = runner_for(&dir, &cli);
        runner.terminate();
        let result = runner.run("x", None).await;
        assert!(!result.success);
        assert!(result.error.contains("terminated"));
    }

    #[tokio::test]
    async fn add_dirs_appear_in_command() {
        let dir = tempdir().unwrap();
        let cli = write_cli(dir.path(), "true");
        let runner = runner_for(&dir, &cli).with_add_dirs(vec![PathBuf::from("/a"), "/b".into()]);
        let cmd = runner.build_command("p");
        let joined = cmd.join(" ");
        assert!(joined.contains("--add-dir /a"));
        assert!(joined.contains("--add-dir /b"));
        assert!(joined.contains("--output-format json"));
    }

    #[test]
    fn rate_limit_markers_are_detected_case_insensitively() {
        for stderr in ["Rate Limit hit", "HTTP 429", "Too Many Requests, slow down"] {
            assert!(RATE_LIMIT_RE.is_match(stderr), "should match: {}", stderr);
        }
        assert!(!RATE_LIMIT_RE.is_match("connection reset by peer"));
        // Breaker-countable failures include 5xx and overload markers
        assert!(BREAKER_FAILURE_RE.is_match("upstream returned 503"));
        assert!(BREAKER_FAILURE_RE.is_match("the server is overloaded"));
        assert!(!BREAKER_FAILURE_RE.is_match("file not found"));
    }

    #[test]
    fn parse_extracts_object_from_noisy_lines() {
        let noisy = "banner\nlog: starting {\"not\": \"complete\"\nprefix {\"result\": \"mid\"}\n";
        let value = parse_json_response(noisy).unwrap();
        assert_eq!(value["result"], "mid");
    }

    #[test]
    fn parse_handles_multi_line_json() {
        let multi = "banner\n{\n  \"result\": \"spread\",\n  \"cost_usd\": 0.1\n}\ntrailing";
        let value = parse_json_response(multi).unwrap();
        assert_eq!(value["result"], "spread");
    }

    #[test]
    fn parse_returns_none_when_no_object() {
        assert!(parse_json_response("no json here\n[1, 2, 3]\n").is_none());
    }

    #[tokio::test]
    async fn resolver_reads_model_usage_key() {
        let dir = tempdir().unwrap();
        let cli = write_cli(
            dir.path(),
            r#"echo '{"result": "x", "modelUsage": {"claude-opus-4-1": {"tokens": 10}}}'"#,
        );
        let resolved = resolve_model_id("opus", &cli.display().to_string(), Duration::from_secs(10))
            .await;
        assert_eq!(resolved.as_deref(), Some("claude-opus-4-1"));
    }

    #[tokio::test]
    async fn resolver_returns_none_on_failure_or_garbage() {
        let dir = tempdir().unwrap();
        let failing = write_cli(dir.path(), "exit 1");
        assert!(
            resolve_model_id("opus", &failing.display().to_string(), Duration::from_secs(10))
                .await
                .is_none()
        );

        let garbage = write_cli(dir.path(), "echo not-json");
        assert!(
            resolve_model_id("opus", &garbage.display().to_string(), Duration::from_secs(10))
                .await
                .is_none()
        );
    }
}

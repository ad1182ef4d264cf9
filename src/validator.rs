//! Run validation commands (lint, tests, build) and report results.

use crate::config::Config;
use crate::process::{RunOptions, run_shell};
use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ValidationStep {
    pub name: String,
    pub command: String,
    pub passed: bool,
    pub output: String,
    pub return_code: i32,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub passed: bool,
    pub steps: Vec<ValidationStep>,
}

impl ValidationResult {
    /// One-line digest like "lint: PASS, tests: FAIL".
    pub fn summary(&self) -> String {
        if self.steps.is_empty() {
            return "no validations run".to_string();
        }
        self.steps
            .iter()
            .map(|s| format!("{}: {}", s.name, if s.passed { "PASS" } else { "FAIL" }))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct Validator {
    config: Config,
}

impl Validator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn run_step(&self, name: &str, command: &str, timeout: u64, cwd: &Path) -> ValidationStep {
        if command.trim().is_empty() {
            return ValidationStep {
                name: name.to_string(),
                command: String::new(),
                passed: true,
                output: "skipped".to_string(),
                return_code: 0,
            };
        }

        info!("Running {}: {}", name, command);
        let result = run_shell(
            command,
            RunOptions {
                cwd: Some(cwd.to_path_buf()),
                timeout: Some(Duration::from_secs(timeout)),
                group: None,
            },
        )
        .await;

        match result {
            Ok(out) if out.timed_out => ValidationStep {
                name: name.to_string(),
                command: command.to_string(),
                passed: false,
                output: format!("Timed out after {}s", timeout),
                return_code: -1,
            },
            Ok(out) => ValidationStep {
                name: name.to_string(),
                command: command.to_string(),
                passed: out.returncode == 0,
                output: format!("{}{}", out.stdout, out.stderr).trim().to_string(),
                return_code: out.returncode,
            },
            Err(e) => ValidationStep {
                name: name.to_string(),
                command: command.to_string(),
                passed: false,
                output: e.to_string(),
                return_code: -1,
            },
        }
    }

    /// Run lint, tests, build sequentially, short-circuiting on the first
    /// non-empty step that fails.
    pub async fn validate(&self, working_dir: Option<&Path>) -> Result<ValidationResult> {
        let cwd = working_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.target_dir.clone().into());
        let vc = &self.config.validation;

        let commands = [
            ("lint", vc.lint_command.as_str(), vc.lint_timeout),
            ("tests", vc.test_command.as_str(), vc.test_timeout),
            ("build", vc.build_command.as_str(), vc.build_timeout),
        ];

        let mut steps = Vec::new();
        for (name, command, timeout) in commands {
            let step = self.run_step(name, command, timeout, &cwd).await;
            let failed = !step.passed;
            steps.push(step);
            if failed && !command.trim().is_empty() {
                warn!(
                    "{} failed (rc={})",
                    name,
                    steps.last().map(|s| s.return_code).unwrap_or(-1)
                );
                return Ok(ValidationResult { passed: false, steps });
            }
        }

        Ok(ValidationResult { passed: true, steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_with(lint: &str, test: &str, build: &str, dir: &Path) -> Config {
        let mut config = Config::default();
        config.target_dir = dir.display().to_string();
        config.validation.lint_command = lint.to_string();
        config.validation.test_command = test.to_string();
        config.validation.build_command = build.to_string();
        config
    }

    #[tokio::test]
    async fn empty_commands_are_skipped_as_passed() {
        let dir = tempdir().unwrap();
        let validator = Validator::new(config_with("", "", "", dir.path()));
        let result = validator.validate(None).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.steps.len(), 3);
        assert!(result.steps.iter().all(|s| s.output == "skipped"));
        assert_eq!(result.summary(), "lint: PASS, tests: PASS, build: PASS");
    }

    #[tokio::test]
    async fn failing_tests_short_circuit_before_build() {
        let dir = tempdir().unwrap();
        let validator = Validator::new(config_with(
            "true",
            "echo boom >&2; exit 1",
            "echo should-not-run",
            dir.path(),
        ));
        let result = validator.validate(None).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.summary(), "lint: PASS, tests: FAIL");
        assert!(result.steps[1].output.contains("boom"));
        assert_eq!(result.steps[1].return_code, 1);
    }

    #[tokio::test]
    async fn output_concatenates_stdout_and_stderr() {
        let dir = tempdir().unwrap();
        let validator = Validator::new(config_with("", "echo out; echo err >&2", "", dir.path()));
        let result = validator.validate(None).await.unwrap();
        assert!(result.passed);
        let step = &result.steps[1];
        assert!(step.output.contains("out"));
        assert!(step.output.contains("err"));
    }

    #[tokio::test]
    async fn timeout_fails_the_step() {
        let dir = tempdir().unwrap();
        let mut config = config_with("", "sleep 30", "", dir.path());
        config.validation.test_timeout = 1;
        let validator = Validator::new(config);
        let result = validator.validate(None).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.steps[1].return_code, -1);
        assert!(result.steps[1].output.contains("Timed out after 1s"));
    }

    #[tokio::test]
    async fn working_dir_override_is_used() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        std::fs::write(other.path().join("marker"), "x").unwrap();
        let validator = Validator::new(config_with("", "test -f marker", "", dir.path()));
        let result = validator.validate(Some(other.path())).await.unwrap();
        assert!(result.passed);
    }
}

//! Boundary to the browser test runner.

use std::process::Stdio;
use std::time::Instant;

use serde::Serialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ExecutionError;
use crate::config::ExecutorConfig;
use crate::healing::FailureReport;
use crate::scheduler::ExecutionOptions;

/// Prefix of a stdout line carrying a JSON [`FailureReport`].
pub const HEALING_PREFIX: &str = "HEALING:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCase {
    pub id: String,
}

impl TestCase {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    /// Never started, or stopped before finishing.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub status: TestStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Interaction failures reported by the runner, for healing.
    #[serde(skip)]
    pub failures: Vec<FailureReport>,
}

impl TestOutcome {
    pub fn passed(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            status: TestStatus::Passed,
            exit_code: Some(0),
            duration_ms: 0,
            error: None,
            failures: Vec::new(),
        }
    }

    pub fn failed(test_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            status: TestStatus::Failed,
            exit_code: None,
            duration_ms: 0,
            error: Some(error.into()),
            failures: Vec::new(),
        }
    }

    pub fn skipped(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            status: TestStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
            error: None,
            failures: Vec::new(),
        }
    }
}

/// Runs individual tests. Implementations must honor `cancel` promptly.
#[async_trait::async_trait]
pub trait TestExecutor: Send + Sync {
    /// Expand a suite into its constituent tests, in stable order.
    async fn resolve_suite(&self, suite_id: &str) -> Result<Vec<TestCase>, ExecutionError>;

    async fn run_test(
        &self,
        case: &TestCase,
        options: &ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<TestOutcome, ExecutionError>;
}

// ---------------------------------------------------------------------------
// CommandExecutor
// ---------------------------------------------------------------------------

/// Spawns the configured runner command once per test.
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Program and arguments for one test, placeholders substituted per
    /// argument so values with spaces stay a single argument.
    pub fn command_line(&self, case: &TestCase, options: &ExecutionOptions) -> Result<Vec<String>, ExecutionError> {
        let argv: Vec<String> = self
            .config
            .command
            .split_whitespace()
            .map(|arg| {
                arg.replace("{test}", &case.id)
                    .replace("{browser}", &options.browser)
                    .replace("{mode}", options.mode.as_str())
                    .replace("{environment}", &options.environment)
            })
            .collect();
        if argv.is_empty() {
            return Err(ExecutionError::InvalidCommand("command template is empty".to_string()));
        }
        Ok(argv)
    }
}

#[async_trait::async_trait]
impl TestExecutor for CommandExecutor {
    async fn resolve_suite(&self, suite_id: &str) -> Result<Vec<TestCase>, ExecutionError> {
        match self.config.suites.iter().find(|s| s.id == suite_id) {
            Some(suite) if suite.tests.is_empty() => Err(ExecutionError::EmptySuite(suite_id.to_string())),
            Some(suite) => Ok(suite.tests.iter().map(TestCase::new).collect()),
            // Unlisted suites are handed to the runner as one test path.
            None => Ok(vec![TestCase::new(suite_id)]),
        }
    }

    async fn run_test(
        &self,
        case: &TestCase,
        options: &ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<TestOutcome, ExecutionError> {
        let argv = self.command_line(case, options)?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env("RUNWARDEN_TEST", &case.id)
            .env("RUNWARDEN_BROWSER", &options.browser)
            .env("RUNWARDEN_MODE", options.mode.as_str())
            .env("RUNWARDEN_ENVIRONMENT", &options.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        debug!(test = %case.id, program = %argv[0], "spawning test runner");
        let started = Instant::now();
        let child = cmd.spawn()?;

        // Dropping the child on cancel kills the process.
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = cancel.cancelled() => {
                debug!(test = %case.id, "test cancelled");
                return Ok(TestOutcome::skipped(&case.id));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let failures = parse_failure_reports(&stdout);
        let exit_code = output.status.code();
        let duration_ms = started.elapsed().as_millis() as u64;

        if output.status.success() {
            return Ok(TestOutcome {
                duration_ms,
                failures,
                ..TestOutcome::passed(&case.id)
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let error = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| match exit_code {
                Some(code) => format!("runner exited with code {code}"),
                None => "runner terminated by signal".to_string(),
            });

        Ok(TestOutcome {
            exit_code,
            duration_ms,
            failures,
            ..TestOutcome::failed(&case.id, error)
        })
    }
}

/// Collect `HEALING:` lines from runner output. Malformed lines are skipped.
pub fn parse_failure_reports(stdout: &str) -> Vec<FailureReport> {
    stdout
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix(HEALING_PREFIX))
        .filter_map(|json| match serde_json::from_str::<FailureReport>(json.trim()) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "ignoring malformed healing report");
                None
            }
        })
        .collect()
}

//! Schedules, the schedule store, and the run ledger.

pub mod history;
pub mod queue;
pub mod store;

pub use self::history::{NewRun, Run, RunKind, RunLedger, RunOutcome, RunStatus, StatsSummary};
pub use self::store::{Claim, ClaimKind, ScheduleStore};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{self, ClockError, ScheduledInstant};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error("invalid execution options: {0}")]
    InvalidOptions(String),
    #[error("schedule {0} not found")]
    NotFound(String),
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("schedule {id} changed concurrently: expected {expected}, found {found}")]
    Conflict {
        id: String,
        expected: String,
        found: String,
    },
    #[error("run {0} is already sealed")]
    RunSealed(String),
    #[error(transparent)]
    Storage(StorageError),
}

crate::impl_storage_error_from!(ScheduleError);

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScheduleStatus {
    pub const ALL: [ScheduleStatus; 5] = [
        ScheduleStatus::Scheduled,
        ScheduleStatus::Running,
        ScheduleStatus::Completed,
        ScheduleStatus::Failed,
        ScheduleStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::Running => "running",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Failed => "failed",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ScheduleStatus::Scheduled),
            "running" => Ok(ScheduleStatus::Running),
            "completed" => Ok(ScheduleStatus::Completed),
            "failed" => Ok(ScheduleStatus::Failed),
            "cancelled" | "canceled" => Ok(ScheduleStatus::Cancelled),
            other => Err(format!("unknown schedule status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserMode {
    Headed,
    #[default]
    Headless,
}

impl BrowserMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserMode::Headed => "headed",
            BrowserMode::Headless => "headless",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
}

/// How a schedule's tests are executed. Retries reuse these unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub mode: BrowserMode,
    pub execution: ExecutionStrategy,
    pub retries: i32,
    pub browser: String,
    pub environment: String,
    /// Sequential only: stop after the first failing test.
    #[serde(alias = "failFast")]
    pub fail_fast: bool,
    /// Per-run hard timeout; falls back to the worker default.
    #[serde(alias = "timeoutSecs")]
    pub timeout_secs: Option<u64>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            mode: BrowserMode::Headless,
            execution: ExecutionStrategy::Sequential,
            retries: 0,
            browser: "chromium".to_string(),
            environment: "default".to_string(),
            fail_fast: false,
            timeout_secs: None,
        }
    }
}

impl ExecutionOptions {
    pub fn validate(&self, max_retries: u32) -> Result<(), ScheduleError> {
        if self.retries < 0 {
            return Err(ScheduleError::InvalidOptions(format!(
                "retries must be >= 0, got {}",
                self.retries
            )));
        }
        if self.retries as u32 > max_retries {
            return Err(ScheduleError::InvalidOptions(format!(
                "retries {} exceeds the configured maximum of {max_retries}",
                self.retries
            )));
        }
        if self.fail_fast && self.execution == ExecutionStrategy::Parallel {
            return Err(ScheduleError::InvalidOptions(
                "fail_fast only applies to sequential execution".to_string(),
            ));
        }
        if self.browser.trim().is_empty() {
            return Err(ScheduleError::InvalidOptions("browser must not be empty".to_string()));
        }
        if self.timeout_secs == Some(0) {
            return Err(ScheduleError::InvalidOptions(
                "timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial options supplied with a manual run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptionsOverride {
    pub mode: Option<BrowserMode>,
    pub execution: Option<ExecutionStrategy>,
    pub retries: Option<i32>,
    pub browser: Option<String>,
    pub environment: Option<String>,
    #[serde(alias = "failFast")]
    pub fail_fast: Option<bool>,
    #[serde(alias = "timeoutSecs")]
    pub timeout_secs: Option<u64>,
}

impl ExecutionOptionsOverride {
    pub fn apply(&self, base: &ExecutionOptions) -> ExecutionOptions {
        ExecutionOptions {
            mode: self.mode.unwrap_or(base.mode),
            execution: self.execution.unwrap_or(base.execution),
            retries: self.retries.unwrap_or(base.retries),
            browser: self.browser.clone().unwrap_or_else(|| base.browser.clone()),
            environment: self
                .environment
                .clone()
                .unwrap_or_else(|| base.environment.clone()),
            fail_fast: self.fail_fast.unwrap_or(base.fail_fast),
            timeout_secs: self.timeout_secs.or(base.timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Request to create a schedule. `run_at` is wall-clock time in `timezone`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    #[serde(alias = "suiteId")]
    pub suite_id: String,
    #[serde(default, alias = "suiteName")]
    pub suite_name: Option<String>,
    #[serde(alias = "runAt")]
    pub run_at: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, alias = "executionOptions")]
    pub execution_options: ExecutionOptions,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub suite_id: String,
    pub suite_name: String,
    pub run_at_utc: DateTime<Utc>,
    pub timezone: String,
    pub status: ScheduleStatus,
    pub priority: i64,
    pub execution_options: ExecutionOptions,
    pub notes: Option<String>,
    /// A run currently holds the claim on this schedule.
    pub claimed: bool,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// The due instant with its origin zone. Unknown stored zones display as UTC.
    pub fn instant(&self) -> ScheduledInstant {
        let zone = clock::parse_timezone(&self.timezone).unwrap_or(chrono_tz::Tz::UTC);
        ScheduledInstant::new(self.run_at_utc, zone)
    }

    pub fn view(&self, now: DateTime<Utc>) -> ScheduleView {
        ScheduleView {
            run_at_local: self.instant().local_display(),
            minutes_until_run: clock::minutes_until(&self.run_at_utc, now),
            schedule: self.clone(),
        }
    }
}

/// A schedule plus the display fields derived from `now`.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleView {
    #[serde(flatten)]
    pub schedule: Schedule,
    pub run_at_local: String,
    pub minutes_until_run: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleFilter {
    pub status: Option<ScheduleStatus>,
    #[serde(alias = "suiteId")]
    pub suite_id: Option<String>,
    pub limit: Option<usize>,
}

//! Claims due schedules and executes their tests.

pub mod dispatcher;
pub mod executor;
pub mod fanout;

pub use self::dispatcher::{ActiveExecution, Dispatcher, RunNowResult, WorkerStatus};
pub use self::executor::{CommandExecutor, TestCase, TestExecutor, TestOutcome, TestStatus};

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::ScheduleError;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("invalid runner command: {0}")]
    InvalidCommand(String),
    #[error("failed to launch test runner: {0}")]
    Launch(#[from] std::io::Error),
    #[error("suite {0} has no tests")]
    EmptySuite(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

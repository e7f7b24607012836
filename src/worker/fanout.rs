//! Fan a run's tests out over the shared test pool.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::executor::{TestCase, TestExecutor, TestOutcome, TestStatus};
use crate::scheduler::{ExecutionOptions, ExecutionStrategy};

/// Aggregate of one attempt's test outcomes, in test order.
#[derive(Debug, Default)]
pub struct FanoutSummary {
    pub outcomes: Vec<TestOutcome>,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl FanoutSummary {
    fn from_outcomes(outcomes: Vec<TestOutcome>) -> Self {
        let count = |s: TestStatus| outcomes.iter().filter(|o| o.status == s).count() as u32;
        Self {
            total: outcomes.len() as u32,
            passed: count(TestStatus::Passed),
            failed: count(TestStatus::Failed),
            skipped: count(TestStatus::Skipped),
            outcomes,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }

    /// Exit code of the first failing test.
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcomes.iter().find(|o| o.status == TestStatus::Failed) {
            Some(failed) => failed.exit_code,
            None if self.all_passed() => Some(0),
            None => None,
        }
    }

    pub fn first_error(&self) -> Option<String> {
        self.outcomes
            .iter()
            .find(|o| o.status == TestStatus::Failed)
            .map(|o| match &o.error {
                Some(e) => format!("{}: {e}", o.test_id),
                None => format!("{} failed", o.test_id),
            })
    }
}

pub async fn run_tests(
    executor: Arc<dyn TestExecutor>,
    tests: &[TestCase],
    options: &ExecutionOptions,
    pool: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> FanoutSummary {
    let outcomes = match options.execution {
        ExecutionStrategy::Parallel => parallel(executor, tests, options, pool, cancel).await,
        ExecutionStrategy::Sequential => sequential(executor, tests, options, pool, cancel).await,
    };
    FanoutSummary::from_outcomes(outcomes)
}

/// Every test runs to completion regardless of sibling failures.
async fn parallel(
    executor: Arc<dyn TestExecutor>,
    tests: &[TestCase],
    options: &ExecutionOptions,
    pool: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Vec<TestOutcome> {
    let mut set = JoinSet::new();
    for (index, case) in tests.iter().cloned().enumerate() {
        let executor = executor.clone();
        let pool = pool.clone();
        let options = options.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            let outcome = run_one(executor.as_ref(), &case, &options, &pool, &cancel).await;
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<TestOutcome>> = vec![None; tests.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, outcome)) => slots[index] = Some(outcome),
            Err(e) => warn!(error = %e, "test task aborted"),
        }
    }

    slots
        .into_iter()
        .zip(tests)
        .map(|(slot, case)| slot.unwrap_or_else(|| TestOutcome::failed(&case.id, "test task aborted")))
        .collect()
}

/// One test at a time in the given order. With `fail_fast`, the first failure
/// skips the rest.
async fn sequential(
    executor: Arc<dyn TestExecutor>,
    tests: &[TestCase],
    options: &ExecutionOptions,
    pool: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Vec<TestOutcome> {
    let mut outcomes = Vec::with_capacity(tests.len());
    let mut stop = false;
    for case in tests {
        if stop || cancel.is_cancelled() {
            outcomes.push(TestOutcome::skipped(&case.id));
            continue;
        }
        let outcome = run_one(executor.as_ref(), case, options, &pool, cancel).await;
        if outcome.status == TestStatus::Failed && options.fail_fast {
            debug!(test = %case.id, "fail-fast: skipping remaining tests");
            stop = true;
        }
        outcomes.push(outcome);
    }
    outcomes
}

async fn run_one(
    executor: &dyn TestExecutor,
    case: &TestCase,
    options: &ExecutionOptions,
    pool: &Semaphore,
    cancel: &CancellationToken,
) -> TestOutcome {
    let _permit = tokio::select! {
        permit = pool.acquire() => match permit {
            Ok(p) => p,
            Err(_) => return TestOutcome::skipped(&case.id),
        },
        _ = cancel.cancelled() => return TestOutcome::skipped(&case.id),
    };
    if cancel.is_cancelled() {
        return TestOutcome::skipped(&case.id);
    }

    debug!(test = %case.id, "test started");
    match executor.run_test(case, options, cancel.child_token()).await {
        Ok(outcome) => outcome,
        Err(e) => TestOutcome::failed(&case.id, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ExecutionError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails the listed tests and tracks peak concurrency.
    struct Scripted {
        failing: Vec<&'static str>,
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(failing: Vec<&'static str>, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                failing,
                delay: Duration::from_millis(delay_ms),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl TestExecutor for Scripted {
        async fn resolve_suite(&self, _suite_id: &str) -> Result<Vec<TestCase>, ExecutionError> {
            Ok(Vec::new())
        }

        async fn run_test(
            &self,
            case: &TestCase,
            _options: &ExecutionOptions,
            _cancel: CancellationToken,
        ) -> Result<TestOutcome, ExecutionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(case.id.clone());
            if self.failing.iter().any(|f| *f == case.id) {
                Ok(TestOutcome::failed(&case.id, "assertion failed"))
            } else {
                Ok(TestOutcome::passed(&case.id))
            }
        }
    }

    fn cases(ids: &[&str]) -> Vec<TestCase> {
        ids.iter().map(|id| TestCase::new(*id)).collect()
    }

    fn opts(execution: ExecutionStrategy, fail_fast: bool) -> ExecutionOptions {
        ExecutionOptions {
            execution,
            fail_fast,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_parallel_partial_failure_runs_all() {
        let exec = Scripted::new(vec!["t2"], 20);
        let summary = run_tests(
            exec.clone(),
            &cases(&["t1", "t2", "t3"]),
            &opts(ExecutionStrategy::Parallel, false),
            Arc::new(Semaphore::new(4)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!((summary.total, summary.passed, summary.failed), (3, 2, 1));
        assert_eq!(summary.outcomes[0].status, TestStatus::Passed);
        assert_eq!(summary.outcomes[2].status, TestStatus::Passed);
        assert_eq!(exec.order.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_parallel_respects_pool_size() {
        let exec = Scripted::new(vec![], 30);
        run_tests(
            exec.clone(),
            &cases(&["a", "b", "c", "d", "e"]),
            &opts(ExecutionStrategy::Parallel, false),
            Arc::new(Semaphore::new(2)),
            &CancellationToken::new(),
        )
        .await;
        assert!(exec.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_sequential_keeps_order() {
        let exec = Scripted::new(vec!["b"], 5);
        let summary = run_tests(
            exec.clone(),
            &cases(&["a", "b", "c"]),
            &opts(ExecutionStrategy::Sequential, false),
            Arc::new(Semaphore::new(4)),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(*exec.order.lock().unwrap(), ["a", "b", "c"]);
        assert_eq!(exec.peak.load(Ordering::SeqCst), 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.first_error().unwrap(), "b: assertion failed");
    }

    #[tokio::test]
    async fn test_sequential_fail_fast_skips_rest() {
        let exec = Scripted::new(vec!["a"], 1);
        let summary = run_tests(
            exec.clone(),
            &cases(&["a", "b", "c"]),
            &opts(ExecutionStrategy::Sequential, true),
            Arc::new(Semaphore::new(4)),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!((summary.failed, summary.skipped), (1, 2));
        assert_eq!(exec.order.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let exec = Scripted::new(vec![], 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = run_tests(
            exec,
            &cases(&["a", "b"]),
            &opts(ExecutionStrategy::Parallel, false),
            Arc::new(Semaphore::new(4)),
            &cancel,
        )
        .await;
        assert_eq!(summary.skipped, 2);
        assert!(!summary.all_passed());
        assert_eq!(summary.exit_code(), None);
    }
}

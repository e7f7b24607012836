//! End-to-end worker scenarios against a scripted test runner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use runwarden::config::WorkerConfig;
use runwarden::scheduler::{
    ExecutionOptions, ExecutionOptionsOverride, ExecutionStrategy, NewRun, NewSchedule, Run,
    RunKind, RunLedger, RunStatus, ScheduleError, ScheduleStatus, ScheduleStore,
};
use runwarden::storage::{open_pool, Pool};
use runwarden::worker::{Dispatcher, ExecutionError, TestCase, TestExecutor, TestOutcome};

// ---------------------------------------------------------------------------
// Scripted runner
// ---------------------------------------------------------------------------

struct Scripted {
    suites: HashMap<String, Vec<String>>,
    /// Tests that fail while the call counter is below the given value.
    failing: HashMap<String, usize>,
    delay: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    /// Most tests seen executing at once.
    peak: Arc<AtomicUsize>,
}

impl Scripted {
    fn new() -> Self {
        Self {
            suites: HashMap::new(),
            failing: HashMap::new(),
            delay: Duration::from_millis(5),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn peak(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }

    fn suite(mut self, id: &str, tests: &[&str]) -> Self {
        self.suites
            .insert(id.to_string(), tests.iter().map(|t| t.to_string()).collect());
        self
    }

    fn always_failing(mut self, test: &str) -> Self {
        self.failing.insert(test.to_string(), usize::MAX);
        self
    }

    fn failing_first(mut self, test: &str, calls: usize) -> Self {
        self.failing.insert(test.to_string(), calls);
        self
    }

    fn delay(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }
}

#[async_trait::async_trait]
impl TestExecutor for Scripted {
    async fn resolve_suite(&self, suite_id: &str) -> Result<Vec<TestCase>, ExecutionError> {
        match self.suites.get(suite_id) {
            Some(tests) => Ok(tests.iter().map(TestCase::new).collect()),
            None => Ok(vec![TestCase::new(suite_id)]),
        }
    }

    async fn run_test(
        &self,
        case: &TestCase,
        _options: &ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<TestOutcome, ExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = cancel.cancelled() => true,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            return Ok(TestOutcome::skipped(&case.id));
        }
        match self.failing.get(&case.id) {
            Some(until) if call < *until => Ok(TestOutcome::failed(&case.id, "assertion failed")),
            _ => Ok(TestOutcome::passed(&case.id)),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    pool: Pool,
    store: ScheduleStore,
    ledger: RunLedger,
    dispatcher: Dispatcher,
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval_secs: 1,
        max_concurrency: 4,
        max_active_schedules: 4,
        run_timeout_secs: 30,
        retry_backoff_ms: 0,
        max_retries: 5,
        ..Default::default()
    }
}

fn harness(executor: Scripted) -> Harness {
    harness_with(executor, worker_config())
}

fn harness_with(executor: Scripted, config: WorkerConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(dir.path().join("worker.db").to_str().unwrap()).unwrap();
    let store = ScheduleStore::new(pool.clone(), config.max_retries);
    let ledger = RunLedger::new(pool.clone());
    let dispatcher = Dispatcher::new(store.clone(), ledger.clone(), Arc::new(executor), config, None);
    Harness {
        _dir: dir,
        pool,
        store,
        ledger,
        dispatcher,
    }
}

/// A schedule due one minute after `now`, in UTC.
fn schedule(h: &Harness, suite: &str, options: ExecutionOptions, now: DateTime<Utc>) -> String {
    schedule_at(h, suite, options, now + chrono::Duration::minutes(1), now)
}

/// A schedule due at `run_at` (whole seconds), in UTC.
fn schedule_at(
    h: &Harness,
    suite: &str,
    options: ExecutionOptions,
    run_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> String {
    let run_at = run_at.format("%Y-%m-%dT%H:%M:%S").to_string();
    h.store
        .create(
            NewSchedule {
                suite_id: suite.to_string(),
                suite_name: None,
                run_at,
                timezone: "UTC".to_string(),
                notes: None,
                priority: 0,
                execution_options: options,
            },
            now,
        )
        .unwrap()
        .id
}

fn later(now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::minutes(2)
}

/// Runs oldest attempt first.
fn runs(h: &Harness, id: &str) -> Vec<Run> {
    let mut runs = h.ledger.list_by_schedule(id, None).unwrap();
    runs.sort_by_key(|r| r.retry_index);
    runs
}

async fn settle(h: &Harness) {
    tokio::time::timeout(Duration::from_secs(10), h.dispatcher.wait_idle())
        .await
        .expect("executions did not finish");
}

/// Start the poll loop in the background.
fn start_loop(h: &Harness) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let token = CancellationToken::new();
    let dispatcher = h.dispatcher.clone();
    let shutdown = token.clone();
    let handle = tokio::spawn(async move { dispatcher.run_loop(shutdown).await });
    (token, handle)
}

async fn stop_loop(h: &Harness, (token, handle): (CancellationToken, tokio::task::JoinHandle<()>)) {
    token.cancel();
    handle.await.unwrap();
    settle(h).await;
}

/// Wait until the schedule reaches `status` with its claim released.
async fn wait_for_status(h: &Harness, id: &str, status: ScheduleStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let schedule = h.store.get(id).unwrap();
        if schedule.status == status && !schedule.claimed {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "schedule stuck in {} (claimed: {})",
            schedule.status,
            schedule.claimed
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_schedule_runs_only_once_due() {
    let h = harness(Scripted::new());
    let now = Utc::now();
    let id = schedule(&h, "smoke", ExecutionOptions::default(), now);

    assert_eq!(h.dispatcher.tick(now).await.unwrap(), 0);
    assert_eq!(h.store.get(&id).unwrap().status, ScheduleStatus::Scheduled);

    assert_eq!(h.dispatcher.tick(later(now)).await.unwrap(), 1);
    settle(&h).await;

    let schedule = h.store.get(&id).unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Completed);
    assert!(!schedule.claimed);

    let runs = runs(&h, &id);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].kind, RunKind::Scheduled);
    assert_eq!(runs[0].status, RunStatus::Passed);
    assert!(runs[0].finished_at.is_some());

    // Terminal schedules are never picked up again.
    assert_eq!(h.dispatcher.tick(later(later(now))).await.unwrap(), 0);
}

#[tokio::test]
async fn test_retries_produce_one_run_per_attempt() {
    let h = harness(Scripted::new().always_failing("flaky"));
    let now = Utc::now();
    let options = ExecutionOptions {
        retries: 2,
        ..Default::default()
    };
    let id = schedule(&h, "flaky", options, now);

    h.dispatcher.tick(later(now)).await.unwrap();
    settle(&h).await;

    let runs = runs(&h, &id);
    assert_eq!(runs.len(), 3);
    assert_eq!(runs.iter().map(|r| r.retry_index).collect::<Vec<_>>(), [0, 1, 2]);
    assert!(runs.iter().all(|r| r.status == RunStatus::Failed));
    let last_error = runs[2].error_message.as_deref().unwrap();
    assert!(last_error.starts_with("retries exhausted after 3 attempts"), "{last_error}");
    assert_eq!(h.store.get(&id).unwrap().status, ScheduleStatus::Failed);
}

#[tokio::test]
async fn test_retry_stops_at_first_pass() {
    let h = harness(Scripted::new().failing_first("wobbly", 1));
    let now = Utc::now();
    let options = ExecutionOptions {
        retries: 3,
        ..Default::default()
    };
    let id = schedule(&h, "wobbly", options, now);

    h.dispatcher.tick(later(now)).await.unwrap();
    settle(&h).await;

    let runs = runs(&h, &id);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[1].status, RunStatus::Passed);
    assert_eq!(h.store.get(&id).unwrap().status, ScheduleStatus::Completed);
}

#[tokio::test]
async fn test_parallel_suite_counts_partial_failure() {
    let h = harness(
        Scripted::new()
            .suite("checkout", &["cart", "payment", "receipt"])
            .always_failing("payment"),
    );
    let now = Utc::now();
    let options = ExecutionOptions {
        execution: ExecutionStrategy::Parallel,
        ..Default::default()
    };
    let id = schedule(&h, "checkout", options, now);

    h.dispatcher.tick(later(now)).await.unwrap();
    settle(&h).await;

    let runs = runs(&h, &id);
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!((run.tests_total, run.tests_passed, run.tests_failed), (3, 2, 1));
    assert_eq!(run.error_message.as_deref(), Some("payment: assertion failed"));
    assert_eq!(h.store.get(&id).unwrap().status, ScheduleStatus::Failed);
}

#[tokio::test]
async fn test_run_now_keeps_schedule_and_blocks_second_claim() {
    let h = harness(Scripted::new().delay(300));
    let now = Utc::now();
    let id = schedule(&h, "smoke", ExecutionOptions::default(), now);

    let started = h
        .dispatcher
        .run_now(&id, &ExecutionOptionsOverride::default(), Some("hotfix check".into()), now)
        .await
        .unwrap();
    assert!(started.schedule_remains);
    assert_eq!(started.run.kind, RunKind::Manual);

    // The schedule is due but already held by the manual run.
    assert_eq!(h.dispatcher.tick(later(now)).await.unwrap(), 0);
    let second = h
        .dispatcher
        .run_now(&id, &ExecutionOptionsOverride::default(), None, now)
        .await;
    assert!(matches!(second, Err(ScheduleError::Conflict { .. })));
    assert_eq!(h.ledger.in_flight(&id).unwrap().len(), 1);

    settle(&h).await;
    let schedule = h.store.get(&id).unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Scheduled);
    assert!(!schedule.claimed);
    let runs = runs(&h, &id);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].notes.as_deref(), Some("hotfix check"));

    // Once released, the due run still happens.
    assert_eq!(h.dispatcher.tick(later(now)).await.unwrap(), 1);
    settle(&h).await;
    assert_eq!(h.store.get(&id).unwrap().status, ScheduleStatus::Completed);
}

#[tokio::test]
async fn test_stop_cancels_in_flight_run() {
    let h = harness(Scripted::new().delay(5_000));
    let now = Utc::now();
    let id = schedule(&h, "slow", ExecutionOptions::default(), now);

    h.dispatcher.tick(later(now)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = h.dispatcher.status().await;
    assert_eq!(status.active.len(), 1);

    let flagged = h.dispatcher.stop(&id, Utc::now()).await.unwrap();
    assert!(flagged.cancel_requested);
    settle(&h).await;

    let runs = runs(&h, &id);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Cancelled);
    assert_eq!(h.store.get(&id).unwrap().status, ScheduleStatus::Cancelled);
    assert!(h.dispatcher.status().await.active.is_empty());
}

#[tokio::test]
async fn test_timeout_seals_run_timed_out() {
    let h = harness(Scripted::new().delay(10_000));
    let now = Utc::now();
    let options = ExecutionOptions {
        timeout_secs: Some(1),
        ..Default::default()
    };
    let id = schedule(&h, "hangs", options, now);

    h.dispatcher.tick(later(now)).await.unwrap();
    settle(&h).await;

    let runs = runs(&h, &id);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::TimedOut);
    assert_eq!(runs[0].error_message.as_deref(), Some("execution timed out after 1s"));
    assert_eq!(h.store.get(&id).unwrap().status, ScheduleStatus::Failed);
}

#[tokio::test]
async fn test_cancel_waiting_schedule_is_never_run() {
    let h = harness(Scripted::new());
    let now = Utc::now();
    let id = schedule(&h, "smoke", ExecutionOptions::default(), now);

    h.dispatcher.cancel(&id, now).unwrap();
    assert_eq!(h.dispatcher.tick(later(now)).await.unwrap(), 0);
    assert!(runs(&h, &id).is_empty());
    assert!(matches!(
        h.dispatcher.cancel(&id, now),
        Err(ScheduleError::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_adhoc_run_is_recorded_without_schedule() {
    let h = harness(Scripted::new());
    let run = h
        .dispatcher
        .run_adhoc("login.spec.ts", Default::default(), Utc::now())
        .await
        .unwrap();
    assert_eq!(run.kind, RunKind::Adhoc);
    settle(&h).await;

    let sealed = h.ledger.get(&run.id).unwrap();
    assert_eq!(sealed.status, RunStatus::Passed);
    assert_eq!(sealed.tests_total, 1);
}

#[tokio::test]
async fn test_seal_failure_does_not_open_another_attempt() {
    let h = harness(Scripted::new().always_failing("flaky"));
    let now = Utc::now();
    let options = ExecutionOptions {
        retries: 2,
        ..Default::default()
    };
    let id = schedule(&h, "flaky", options, now);

    // Runs can still be opened and refreshed, but never sealed.
    h.pool
        .get()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER runs_unsealable BEFORE UPDATE OF finished_at ON runs
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
        )
        .unwrap();

    assert_eq!(h.dispatcher.tick(later(now)).await.unwrap(), 1);
    settle(&h).await;

    let runs = runs(&h, &id);
    assert_eq!(runs.len(), 1, "no retry run may be opened after a failed seal");
    assert!(runs[0].finished_at.is_none());
    assert_eq!(h.ledger.in_flight(&id).unwrap().len(), 1);

    let schedule = h.store.get(&id).unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Failed);
    assert!(!schedule.claimed);
}

#[tokio::test]
async fn test_run_record_failure_fails_due_schedule() {
    let h = harness(Scripted::new());
    let now = Utc::now();
    let id = schedule(&h, "smoke", ExecutionOptions::default(), now);

    h.pool.get().unwrap().execute_batch("DROP TABLE runs;").unwrap();

    assert_eq!(h.dispatcher.tick(later(now)).await.unwrap(), 0);
    let schedule = h.store.get(&id).unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Failed);
    assert!(!schedule.claimed);
    assert!(h.dispatcher.status().await.active.is_empty());

    // Released, so it can be moved to a new time.
    let next = (later(now) + chrono::Duration::hours(1)).format("%Y-%m-%dT%H:%M:%S").to_string();
    let again = h.store.reschedule(&id, &next, "UTC", later(now)).unwrap();
    assert_eq!(again.status, ScheduleStatus::Scheduled);
}

#[tokio::test]
async fn test_poll_loop_leaves_live_manual_run_alone() {
    let executor = Scripted::new().delay(2_000);
    let peak = executor.peak();
    let h = harness(executor);
    let now = Utc::now();
    let id = schedule_at(&h, "smoke", ExecutionOptions::default(), now, now);

    let started = h
        .dispatcher
        .run_now(&id, &ExecutionOptionsOverride::default(), None, now)
        .await
        .unwrap();
    let poller = start_loop(&h);

    // Two poll passes while the manual run is still executing.
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    let open = h.ledger.in_flight(&id).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, started.run.id);
    assert!(h.store.get(&id).unwrap().claimed);

    // Once the manual run releases the claim the due run follows.
    wait_for_status(&h, &id, ScheduleStatus::Completed).await;
    stop_loop(&h, poller).await;

    let runs = h.ledger.list_by_schedule(&id, None).unwrap();
    assert_eq!(runs.len(), 2);
    let manual = h.ledger.get(&started.run.id).unwrap();
    assert_eq!(manual.status, RunStatus::Passed);
    assert!(manual.error_message.is_none());
    assert!(runs.iter().any(|r| r.kind == RunKind::Scheduled && r.status == RunStatus::Passed));
    assert_eq!(peak.load(Ordering::SeqCst), 1, "one schedule executed twice at once");
}

#[tokio::test]
async fn test_restarted_worker_does_not_steal_live_claim() {
    let h = harness(Scripted::new().delay(1_000));
    let now = Utc::now();
    let id = schedule(&h, "smoke", ExecutionOptions::default(), now);

    let started = h
        .dispatcher
        .run_now(&id, &ExecutionOptionsOverride::default(), None, now)
        .await
        .unwrap();

    // A second process starting up on the same database.
    let restarted = Dispatcher::new(
        h.store.clone(),
        h.ledger.clone(),
        Arc::new(Scripted::new()),
        worker_config(),
        None,
    );
    restarted.recover(Utc::now()).unwrap();

    assert!(h.store.get(&id).unwrap().claimed);
    assert_eq!(h.ledger.in_flight(&id).unwrap().len(), 1);

    settle(&h).await;
    assert_eq!(h.ledger.get(&started.run.id).unwrap().status, RunStatus::Passed);
    assert_eq!(h.store.get(&id).unwrap().status, ScheduleStatus::Scheduled);
}

#[tokio::test]
async fn test_recovery_takes_over_lapsed_lease() {
    let h = harness(Scripted::new());
    let past = Utc::now() - chrono::Duration::minutes(10);
    let id = schedule_at(&h, "smoke", ExecutionOptions::default(), past, past);

    // A worker that claimed and opened a run, then died.
    h.store.claim_due(&id, past).unwrap();
    let run = h
        .ledger
        .record(
            NewRun {
                schedule_id: Some(id.clone()),
                test_id: None,
                kind: RunKind::Scheduled,
                retry_index: 0,
                notes: None,
            },
            past,
        )
        .unwrap();

    h.dispatcher.recover(Utc::now()).unwrap();

    let schedule = h.store.get(&id).unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Failed);
    assert!(!schedule.claimed);
    let sealed = h.ledger.get(&run.id).unwrap();
    assert_eq!(sealed.status, RunStatus::Failed);
    assert!(sealed.error_message.unwrap().starts_with("interrupted"));
}

#[tokio::test]
async fn test_poll_loop_starts_run_within_one_interval() {
    let h = harness(Scripted::new());
    let now = Utc::now();
    let id = schedule_at(&h, "smoke", ExecutionOptions::default(), now + chrono::Duration::seconds(2), now);
    let due = h.store.get(&id).unwrap().run_at_utc;

    let poller = start_loop(&h);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let first = loop {
        if let Some(run) = runs(&h, &id).into_iter().next() {
            break run;
        }
        // Counting down inside the last minute.
        assert_eq!(h.store.get(&id).unwrap().view(Utc::now()).minutes_until_run, 0);
        assert!(tokio::time::Instant::now() < deadline, "schedule was never picked up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    stop_loop(&h, poller).await;

    assert_eq!(first.kind, RunKind::Scheduled);
    assert!(first.started_at >= due);
    // One poll interval, plus scheduling slack.
    let lag = first.started_at - due;
    assert!(lag <= chrono::Duration::milliseconds(1_500), "picked up {lag} after due");
    assert_eq!(h.store.get(&id).unwrap().status, ScheduleStatus::Completed);
}

#[tokio::test]
async fn test_retries_keep_one_run_in_flight() {
    let config = WorkerConfig {
        retry_backoff_ms: 50,
        ..worker_config()
    };
    let h = harness_with(Scripted::new().always_failing("flaky").delay(50), config);
    let now = Utc::now();
    let options = ExecutionOptions {
        retries: 3,
        ..Default::default()
    };
    let id = schedule_at(&h, "flaky", options, now, now);

    let poller = start_loop(&h);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let mut most_open = 0;
    loop {
        let open = h.ledger.in_flight(&id).unwrap().len();
        assert!(open <= 1, "{open} runs in flight for one schedule");
        most_open = most_open.max(open);

        let schedule = h.store.get(&id).unwrap();
        if schedule.status == ScheduleStatus::Failed && !schedule.claimed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "retries never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stop_loop(&h, poller).await;

    assert_eq!(most_open, 1);
    let runs = runs(&h, &id);
    assert_eq!(runs.len(), 4);
    assert!(runs.iter().all(|r| r.status == RunStatus::Failed && r.finished_at.is_some()));
}

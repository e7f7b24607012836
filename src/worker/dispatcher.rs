//! The worker: polls for due schedules, claims them and drives their runs.
//!
//! A `Dispatcher` is a cheap handle over shared state. The poll loop, the API
//! handlers and every in-flight execution hold clones of the same handle.
//!
//! Claims and open runs carry a lease. Each execution refreshes its own lease
//! every quarter of `claim_lease_secs`. Recovery only takes over leases that
//! stopped being refreshed, whichever process (daemon or CLI `run-now`)
//! holds them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::{TestCase, TestExecutor};
use super::fanout::{self, FanoutSummary};
use super::ExecutionError;
use crate::config::WorkerConfig;
use crate::healing::service::HealingQueue;
use crate::scheduler::queue;
use crate::scheduler::{
    BrowserMode, Claim, ClaimKind, ExecutionOptions, ExecutionOptionsOverride, NewRun, Run, RunKind,
    RunLedger, RunOutcome, RunStatus, Schedule, ScheduleError, ScheduleStatus, ScheduleStore,
};

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

/// An execution currently owned by this worker.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveExecution {
    pub schedule_id: Option<String>,
    pub test_id: Option<String>,
    pub kind: RunKind,
    pub run_id: String,
    pub retry_index: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub enabled: bool,
    pub polling: bool,
    pub poll_interval_secs: u64,
    pub polls: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub max_concurrency: usize,
    pub available_test_slots: usize,
    pub max_active_schedules: usize,
    pub available_schedule_slots: usize,
    pub active: Vec<ActiveExecution>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunNowResult {
    pub run: Run,
    /// The schedule itself is untouched by a manual run.
    pub schedule_remains: bool,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Inner {
    store: ScheduleStore,
    ledger: RunLedger,
    executor: Arc<dyn TestExecutor>,
    config: WorkerConfig,
    test_permits: Arc<Semaphore>,
    schedule_permits: Arc<Semaphore>,
    /// Keyed by schedule id, or by run id for ad-hoc runs.
    active: RwLock<HashMap<String, ActiveExecution>>,
    idle: Notify,
    healing: Option<HealingQueue>,
    polling: AtomicBool,
    polls: AtomicU64,
    last_poll: RwLock<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Everything a spawned execution needs.
struct Execution {
    key: String,
    claim: Option<Claim>,
    tests: Vec<TestCase>,
    options: ExecutionOptions,
    kind: RunKind,
    schedule_id: Option<String>,
    test_id: Option<String>,
    notes: Option<String>,
    cancel: CancellationToken,
    /// Stops the lease heartbeat.
    lease: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: ScheduleStore,
        ledger: RunLedger,
        executor: Arc<dyn TestExecutor>,
        config: WorkerConfig,
        healing: Option<HealingQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                test_permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
                schedule_permits: Arc::new(Semaphore::new(config.max_active_schedules.max(1))),
                store,
                ledger,
                executor,
                config,
                active: RwLock::new(HashMap::new()),
                idle: Notify::new(),
                healing,
                polling: AtomicBool::new(false),
                polls: AtomicU64::new(0),
                last_poll: RwLock::new(None),
            }),
        }
    }

    /// Clean up after a process that died mid-run: release claims and seal
    /// runs whose lease lapsed more than `claim_lease_secs` before `now`.
    pub fn recover(&self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let stale_before = now - chrono::Duration::seconds(self.lease_secs() as i64);
        let schedules = self.inner.store.release_orphaned_claims(stale_before, now)?;
        let runs = self.inner.ledger.seal_orphans(stale_before, now)?;
        if schedules > 0 || runs > 0 {
            warn!(schedules, runs, "recovered orphaned executions");
        }
        Ok(())
    }

    /// One poll pass. Claims as many due schedules as there are free schedule
    /// slots and starts them. Returns the number claimed.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, ScheduleError> {
        let inner = &self.inner;
        let due = inner.store.due(now)?;
        let ordered = queue::order(due, now, inner.config.aging_minutes_per_level);

        let mut claimed = 0;
        for queued in ordered {
            let Ok(permit) = inner.schedule_permits.clone().try_acquire_owned() else {
                debug!(waiting = %queued.schedule.id, "no free schedule slot");
                break;
            };
            let schedule = queued.schedule;
            let claim = match inner.store.claim_due(&schedule.id, now) {
                Ok(claim) => claim,
                Err(ScheduleError::Conflict { .. } | ScheduleError::NotFound(_)) => {
                    debug!(schedule_id = %schedule.id, "lost claim race");
                    continue;
                }
                Err(e) => return Err(e),
            };
            info!(
                schedule_id = %schedule.id,
                priority = schedule.priority,
                effective_priority = queued.effective_priority,
                "schedule claimed"
            );

            match self.begin(&schedule, claim, schedule.execution_options.clone(), RunKind::Scheduled, None, now).await {
                Ok((exec, run)) => {
                    self.spawn(exec, run, Some(permit));
                    claimed += 1;
                }
                Err(e) => error!(schedule_id = %schedule.id, error = %e, "failed to start schedule"),
            }
        }

        inner.polls.fetch_add(1, Ordering::Relaxed);
        *inner.last_poll.write().await = Some(now);
        Ok(claimed)
    }

    /// Poll every `poll_interval_secs` until `shutdown` fires. Each pass also
    /// sweeps lapsed leases.
    pub async fn run_loop(&self, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.inner.config.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.inner.polling.store(true, Ordering::Relaxed);
        info!(poll_interval_secs = period.as_secs(), "worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let now = Utc::now();
            if let Err(e) = self.recover(now) {
                error!(error = %e, "orphan recovery failed");
            }
            match self.tick(now).await {
                Ok(0) => {}
                Ok(claimed) => debug!(claimed, "poll pass"),
                Err(e) => error!(error = %e, "poll pass failed"),
            }
        }

        self.inner.polling.store(false, Ordering::Relaxed);
        info!("worker stopped");
    }

    /// Run a schedule immediately without touching its status.
    pub async fn run_now(
        &self,
        schedule_id: &str,
        overrides: &ExecutionOptionsOverride,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RunNowResult, ScheduleError> {
        let schedule = self.inner.store.get(schedule_id)?;
        let options = overrides.apply(&schedule.execution_options);
        options.validate(self.inner.config.max_retries)?;

        let claim = self.inner.store.claim_manual(schedule_id, now)?;
        let (exec, run) = self.begin(&schedule, claim, options, RunKind::Manual, notes, now).await?;

        let dispatcher = self.clone();
        let permits = self.inner.schedule_permits.clone();
        let first = run.clone();
        tokio::spawn(async move {
            let permit = permits.acquire_owned().await.ok();
            dispatcher.drive(exec, first, permit).await;
        });

        info!(schedule_id = %schedule_id, run_id = %run.id, "manual run started");
        Ok(RunNowResult {
            run,
            schedule_remains: true,
        })
    }

    /// Run a single test outside any schedule.
    pub async fn run_adhoc(
        &self,
        test_id: &str,
        mode: BrowserMode,
        now: DateTime<Utc>,
    ) -> Result<Run, ScheduleError> {
        if test_id.trim().is_empty() {
            return Err(ScheduleError::InvalidOptions("test id must not be empty".to_string()));
        }
        let options = ExecutionOptions {
            mode,
            ..Default::default()
        };
        let run = self.inner.ledger.record(
            NewRun {
                schedule_id: None,
                test_id: Some(test_id.to_string()),
                kind: RunKind::Adhoc,
                retry_index: 0,
                notes: None,
            },
            now,
        )?;

        let exec = Execution {
            key: run.id.clone(),
            claim: None,
            tests: vec![TestCase::new(test_id)],
            options,
            kind: RunKind::Adhoc,
            schedule_id: None,
            test_id: Some(test_id.to_string()),
            notes: None,
            cancel: CancellationToken::new(),
            lease: CancellationToken::new(),
        };
        self.register(&exec, &run).await;
        self.spawn(exec, run.clone(), None);
        Ok(run)
    }

    /// Cancel a schedule that is waiting to run.
    pub fn cancel(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        self.inner.store.cancel(schedule_id, now)
    }

    /// Ask the in-flight execution of a schedule to stop.
    pub async fn stop(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        let schedule = self.inner.store.request_stop(schedule_id, now)?;
        if let Some(active) = self.inner.active.read().await.get(schedule_id) {
            active.cancel.cancel();
        }
        Ok(schedule)
    }

    pub async fn status(&self) -> WorkerStatus {
        let inner = &self.inner;
        let mut active: Vec<ActiveExecution> = inner.active.read().await.values().cloned().collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        WorkerStatus {
            enabled: inner.config.enabled,
            polling: inner.polling.load(Ordering::Relaxed),
            poll_interval_secs: inner.config.poll_interval_secs,
            polls: inner.polls.load(Ordering::Relaxed),
            last_poll: *inner.last_poll.read().await,
            max_concurrency: inner.config.max_concurrency,
            available_test_slots: inner.test_permits.available_permits(),
            max_active_schedules: inner.config.max_active_schedules,
            available_schedule_slots: inner.schedule_permits.available_permits(),
            active,
        }
    }

    /// Wait until no execution is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.active.read().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Resolve tests and open the first run for a claimed schedule. The claim
    /// is released again if anything fails before the run exists.
    async fn begin(
        &self,
        schedule: &Schedule,
        claim: Claim,
        options: ExecutionOptions,
        kind: RunKind,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Execution, Run), ScheduleError> {
        let tests = match self.inner.executor.resolve_suite(&schedule.suite_id).await {
            Ok(tests) if !tests.is_empty() => tests,
            Ok(_) => vec![TestCase::new(&schedule.suite_id)],
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "suite resolution failed");
                return self.abort_claim(&claim, kind, e.to_string(), now);
            }
        };

        let run = match self.inner.ledger.record(
            NewRun {
                schedule_id: Some(schedule.id.clone()),
                test_id: None,
                kind,
                retry_index: 0,
                notes: notes.clone(),
            },
            now,
        ) {
            Ok(run) => run,
            Err(e) => {
                // A due claim already moved the schedule to `running`.
                let final_status = (claim.kind == ClaimKind::Due).then_some(ScheduleStatus::Failed);
                if let Err(release_err) = self.inner.store.release(&claim, final_status, now) {
                    error!(schedule_id = %schedule.id, error = %release_err, "failed to release claim");
                }
                return Err(e);
            }
        };

        let exec = Execution {
            key: schedule.id.clone(),
            claim: Some(claim),
            tests,
            options,
            kind,
            schedule_id: Some(schedule.id.clone()),
            test_id: None,
            notes,
            cancel: CancellationToken::new(),
            lease: CancellationToken::new(),
        };
        self.register(&exec, &run).await;
        Ok((exec, run))
    }

    /// Record a failed run for a schedule whose tests could not be resolved
    /// and give the claim back.
    fn abort_claim(
        &self,
        claim: &Claim,
        kind: RunKind,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<(Execution, Run), ScheduleError> {
        let run = self.inner.ledger.record(
            NewRun {
                schedule_id: Some(claim.schedule_id.clone()),
                test_id: None,
                kind,
                retry_index: 0,
                notes: None,
            },
            now,
        )?;
        self.inner.ledger.seal(
            &run.id,
            &RunOutcome {
                status: RunStatus::Failed,
                exit_code: None,
                tests_total: 0,
                tests_passed: 0,
                tests_failed: 0,
                tests_skipped: 0,
                error_message: Some(message.clone()),
            },
            now,
        )?;
        let final_status = (claim.kind == ClaimKind::Due).then_some(ScheduleStatus::Failed);
        self.inner.store.release(claim, final_status, now)?;
        Err(ScheduleError::InvalidOptions(message))
    }

    async fn register(&self, exec: &Execution, run: &Run) {
        let entry = ActiveExecution {
            schedule_id: exec.schedule_id.clone(),
            test_id: exec.test_id.clone(),
            kind: exec.kind,
            run_id: run.id.clone(),
            retry_index: run.retry_index,
            started_at: run.started_at,
            cancel: exec.cancel.clone(),
        };
        self.inner.active.write().await.insert(exec.key.clone(), entry);
        self.start_heartbeat(exec.key.clone(), exec.claim.clone(), exec.lease.clone());
    }

    fn lease_secs(&self) -> u64 {
        self.inner.config.claim_lease_secs.max(1)
    }

    /// Refresh the claim and open-run leases of one execution until `stop`.
    fn start_heartbeat(&self, key: String, claim: Option<Claim>, stop: CancellationToken) {
        let dispatcher = self.clone();
        let period = Duration::from_secs((self.lease_secs() / 4).max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                dispatcher.beat(&key, claim.as_ref(), Utc::now()).await;
            }
        });
    }

    async fn beat(&self, key: &str, claim: Option<&Claim>, now: DateTime<Utc>) {
        let inner = &self.inner;
        if let Some(claim) = claim {
            match inner.store.touch_claim(claim, now) {
                Ok(true) => {}
                Ok(false) => debug!(schedule_id = %claim.schedule_id, "claim no longer held"),
                Err(e) => warn!(schedule_id = %claim.schedule_id, error = %e, "failed to refresh claim lease"),
            }
        }
        let run_id = inner.active.read().await.get(key).map(|a| a.run_id.clone());
        if let Some(run_id) = run_id {
            if let Err(e) = inner.ledger.touch(&run_id, now) {
                warn!(run_id = %run_id, error = %e, "failed to refresh run lease");
            }
        }
    }

    fn spawn(&self, exec: Execution, first: Run, permit: Option<OwnedSemaphorePermit>) {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.drive(exec, first, permit).await });
    }

    /// Run attempts until one passes, retries run out, or a stop arrives.
    async fn drive(self, exec: Execution, first: Run, _permit: Option<OwnedSemaphorePermit>) {
        let inner = &self.inner;
        let max_attempts = exec.options.retries.max(0) as u32 + 1;
        let timeout = Duration::from_secs(
            exec.options
                .timeout_secs
                .unwrap_or(inner.config.run_timeout_secs)
                .max(1),
        );

        let mut run = first;
        let final_status = loop {
            let outcome = self.attempt(&exec, timeout).await;
            let stopped = self.stop_requested(&exec);
            let (status, mut outcome) = match outcome {
                Ok(summary) if stopped => (RunStatus::Cancelled, summary_outcome(&summary, RunStatus::Cancelled)),
                Ok(summary) if summary.all_passed() => (RunStatus::Passed, summary_outcome(&summary, RunStatus::Passed)),
                Ok(summary) => (RunStatus::Failed, summary_outcome(&summary, RunStatus::Failed)),
                Err(e) => (
                    RunStatus::TimedOut,
                    RunOutcome {
                        status: RunStatus::TimedOut,
                        exit_code: None,
                        tests_total: exec.tests.len() as u32,
                        tests_passed: 0,
                        tests_failed: 0,
                        tests_skipped: exec.tests.len() as u32,
                        error_message: Some(e.to_string()),
                    },
                ),
            };

            let attempts = run.retry_index + 1;
            let retry_left = attempts < max_attempts;
            if status.is_failure() && !retry_left && max_attempts > 1 {
                outcome.error_message = Some(
                    ExecutionError::RetriesExhausted {
                        attempts,
                        last_error: outcome.error_message.take().unwrap_or_else(|| "failed".to_string()),
                    }
                    .to_string(),
                );
            }

            // An unsealed run blocks the next attempt. Lease recovery seals it.
            if let Err(e) = inner.ledger.seal(&run.id, &outcome, Utc::now()) {
                error!(key = %exec.key, run_id = %run.id, error = %e, "failed to seal run, abandoning execution");
                break ScheduleStatus::Failed;
            }

            match status {
                RunStatus::Passed => break ScheduleStatus::Completed,
                RunStatus::Cancelled => break ScheduleStatus::Cancelled,
                _ if !retry_left => {
                    warn!(key = %exec.key, attempts, "execution failed, retries exhausted");
                    break ScheduleStatus::Failed;
                }
                _ => {}
            }

            warn!(
                key = %exec.key,
                run_id = %run.id,
                retry_index = run.retry_index,
                error = ?outcome.error_message,
                "attempt failed, retrying"
            );
            if inner.config.retry_backoff_ms > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(inner.config.retry_backoff_ms)) => {}
                    _ = exec.cancel.cancelled() => {}
                }
            }
            if self.stop_requested(&exec) {
                break ScheduleStatus::Cancelled;
            }

            run = match inner.ledger.record(
                NewRun {
                    schedule_id: exec.schedule_id.clone(),
                    test_id: exec.test_id.clone(),
                    kind: exec.kind,
                    retry_index: run.retry_index + 1,
                    notes: exec.notes.clone(),
                },
                Utc::now(),
            ) {
                Ok(next) => next,
                Err(e) => {
                    error!(key = %exec.key, error = %e, "failed to open retry run");
                    break ScheduleStatus::Failed;
                }
            };
            if let Some(active) = inner.active.write().await.get_mut(&exec.key) {
                active.run_id = run.id.clone();
                active.retry_index = run.retry_index;
            }
        };

        exec.lease.cancel();
        if let Some(claim) = &exec.claim {
            let status = match claim.kind {
                ClaimKind::Due => Some(final_status),
                ClaimKind::Manual => None,
            };
            if let Err(e) = inner.store.release(claim, status, Utc::now()) {
                error!(schedule_id = %claim.schedule_id, error = %e, "failed to release claim");
            }
        }
        info!(key = %exec.key, status = %final_status, "execution finished");

        inner.active.write().await.remove(&exec.key);
        inner.idle.notify_waiters();
    }

    /// One attempt over all tests, bounded by the run timeout.
    async fn attempt(&self, exec: &Execution, timeout: Duration) -> Result<FanoutSummary, ExecutionError> {
        let inner = &self.inner;
        let attempt_cancel = exec.cancel.child_token();
        let fan = fanout::run_tests(
            inner.executor.clone(),
            &exec.tests,
            &exec.options,
            inner.test_permits.clone(),
            &attempt_cancel,
        );
        let summary = match tokio::time::timeout(timeout, fan).await {
            Ok(summary) => summary,
            Err(_) => {
                attempt_cancel.cancel();
                warn!(key = %exec.key, timeout_secs = timeout.as_secs(), "run timed out");
                return Err(ExecutionError::Timeout(timeout));
            }
        };

        if let Some(queue) = &inner.healing {
            for report in summary.outcomes.iter().flat_map(|o| o.failures.iter().cloned()) {
                if let Err(e) = queue.submit(report) {
                    warn!(key = %exec.key, error = %e, "failure report not queued");
                }
            }
        }
        Ok(summary)
    }

    fn stop_requested(&self, exec: &Execution) -> bool {
        if exec.cancel.is_cancelled() {
            return true;
        }
        match &exec.claim {
            Some(claim) => self.inner.store.stop_requested(claim).unwrap_or_else(|e| {
                error!(schedule_id = %claim.schedule_id, error = %e, "failed to read stop flag");
                false
            }),
            None => false,
        }
    }
}

fn summary_outcome(summary: &FanoutSummary, status: RunStatus) -> RunOutcome {
    RunOutcome {
        status,
        exit_code: summary.exit_code(),
        tests_total: summary.total,
        tests_passed: summary.passed,
        tests_failed: summary.failed,
        tests_skipped: summary.skipped,
        error_message: match status {
            RunStatus::Cancelled => Some("stopped on request".to_string()),
            _ => summary.first_error(),
        },
    }
}

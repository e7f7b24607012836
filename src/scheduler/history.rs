//! Append-only execution history.
//!
//! A run row is opened when an attempt starts and sealed exactly once when
//! it ends. Sealed rows are never updated; corrections are new rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{ScheduleError, ScheduleStatus};
use crate::storage::{fmt_ts, parse_opt_ts, parse_ts, Pool};

const RUN_COLUMNS: &str = "id, schedule_id, test_id, kind, status, retry_index, started_at, \
     finished_at, exit_code, tests_total, tests_passed, tests_failed, tests_skipped, duration_ms, \
     error_message, notes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Claimed by the poller when due.
    Scheduled,
    /// Run-now on an existing schedule.
    Manual,
    /// A single test outside the schedule model.
    Adhoc,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Scheduled => "scheduled",
            RunKind::Manual => "manual",
            RunKind::Adhoc => "adhoc",
        }
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunKind::Scheduled),
            "manual" => Ok(RunKind::Manual),
            "adhoc" => Ok(RunKind::Adhoc),
            other => Err(format!("unknown run kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::TimedOut)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "passed" => Ok(RunStatus::Passed),
            "failed" => Ok(RunStatus::Failed),
            "timed_out" => Ok(RunStatus::TimedOut),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// One execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub schedule_id: Option<String>,
    pub test_id: Option<String>,
    pub kind: RunKind,
    pub status: RunStatus,
    pub retry_index: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub tests_total: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub notes: Option<String>,
}

impl Run {
    pub fn is_sealed(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Fields known when an attempt starts.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub schedule_id: Option<String>,
    pub test_id: Option<String>,
    pub kind: RunKind,
    pub retry_index: u32,
    pub notes: Option<String>,
}

/// Fields known when an attempt ends.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub tests_total: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,
    pub error_message: Option<String>,
}

/// Shape of `/api/schedules/stats/summary`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSummary {
    pub total_schedules: u64,
    pub scheduled: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub due_next_24h: u64,
    pub overdue: u64,
    pub total_runs: u64,
    pub runs_in_flight: u64,
    pub runs_passed: u64,
    pub runs_failed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RunLedger {
    pool: Pool,
}

impl RunLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open a new run row. `finished_at` stays NULL until [`RunLedger::seal`].
    pub fn record(&self, new: NewRun, now: DateTime<Utc>) -> Result<Run, ScheduleError> {
        let run = Run {
            id: Uuid::new_v4().to_string(),
            schedule_id: new.schedule_id,
            test_id: new.test_id,
            kind: new.kind,
            status: RunStatus::Running,
            retry_index: new.retry_index,
            started_at: now,
            finished_at: None,
            exit_code: None,
            tests_total: 0,
            tests_passed: 0,
            tests_failed: 0,
            tests_skipped: 0,
            duration_ms: None,
            error_message: None,
            notes: new.notes,
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO runs (id, schedule_id, test_id, kind, status, retry_index, started_at, notes,
                               heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?7)",
            params![
                run.id,
                run.schedule_id,
                run.test_id,
                run.kind.as_str(),
                run.status.as_str(),
                run.retry_index,
                fmt_ts(&run.started_at),
                run.notes,
            ],
        )?;

        info!(
            run_id = %run.id,
            schedule_id = ?run.schedule_id,
            retry_index = run.retry_index,
            kind = run.kind.as_str(),
            "run started"
        );
        Ok(run)
    }

    /// Set the terminal fields of a run. Fails if it was already sealed.
    pub fn seal(
        &self,
        run_id: &str,
        outcome: &RunOutcome,
        now: DateTime<Utc>,
    ) -> Result<Run, ScheduleError> {
        let started = self.get(run_id)?;
        if started.is_sealed() {
            return Err(ScheduleError::RunSealed(run_id.to_string()));
        }
        let duration_ms = (now - started.started_at).num_milliseconds().max(0);

        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs
             SET status = ?2, finished_at = ?3, exit_code = ?4, tests_total = ?5,
                 tests_passed = ?6, tests_failed = ?7, tests_skipped = ?8, duration_ms = ?9,
                 error_message = ?10
             WHERE id = ?1 AND finished_at IS NULL",
            params![
                run_id,
                outcome.status.as_str(),
                fmt_ts(&now),
                outcome.exit_code,
                outcome.tests_total,
                outcome.tests_passed,
                outcome.tests_failed,
                outcome.tests_skipped,
                duration_ms,
                outcome.error_message,
            ],
        )?;
        drop(conn);

        if changed != 1 {
            return Err(ScheduleError::RunSealed(run_id.to_string()));
        }

        let sealed = self.get(run_id)?;
        info!(
            run_id = %sealed.id,
            status = %sealed.status,
            passed = sealed.tests_passed,
            failed = sealed.tests_failed,
            duration_ms,
            "run sealed"
        );
        Ok(sealed)
    }

    pub fn get(&self, run_id: &str) -> Result<Run, ScheduleError> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![run_id],
            row_to_run,
        )
        .optional()?
        .ok_or_else(|| ScheduleError::RunNotFound(run_id.to_string()))
    }

    /// Runs for a schedule, newest first.
    pub fn list_by_schedule(
        &self,
        schedule_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Run>, ScheduleError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE schedule_id = ?1
             ORDER BY started_at DESC, retry_index DESC
             LIMIT ?2"
        ))?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![schedule_id, limit], row_to_run)?;

        let mut runs = Vec::new();
        for r in rows {
            runs.push(r?);
        }
        Ok(runs)
    }

    /// Unsealed runs for a schedule. Never more than one while claims hold.
    pub fn in_flight(&self, schedule_id: &str) -> Result<Vec<Run>, ScheduleError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE schedule_id = ?1 AND finished_at IS NULL"
        ))?;
        let rows = stmt.query_map(params![schedule_id], row_to_run)?;

        let mut runs = Vec::new();
        for r in rows {
            runs.push(r?);
        }
        Ok(runs)
    }

    /// Refresh the lease of an open run.
    pub fn touch(&self, run_id: &str, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE runs SET heartbeat_at = ?2 WHERE id = ?1 AND finished_at IS NULL",
            params![run_id, fmt_ts(&now)],
        )?;
        Ok(())
    }

    /// Seal open runs whose lease was last refreshed before `stale_before`,
    /// i.e. runs left open by a process that died mid-attempt.
    pub fn seal_orphans(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, ScheduleError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'failed', finished_at = ?2,
                 error_message = 'interrupted: worker stopped before the run finished'
             WHERE finished_at IS NULL AND COALESCE(heartbeat_at, started_at) < ?1",
            params![fmt_ts(&stale_before), fmt_ts(&now)],
        )?;
        if changed > 0 {
            warn!(count = changed, "sealed orphaned runs");
        }
        Ok(changed)
    }

    /// Schedule counts by status plus run totals.
    pub fn stats_summary(&self, now: DateTime<Utc>) -> Result<StatsSummary, ScheduleError> {
        let conn = self.pool.get()?;
        let mut summary = StatsSummary::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM schedules GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for r in rows {
            let (status, count) = r?;
            let count = count as u64;
            summary.total_schedules += count;
            match status.parse::<ScheduleStatus>() {
                Ok(ScheduleStatus::Scheduled) => summary.scheduled = count,
                Ok(ScheduleStatus::Running) => summary.running = count,
                Ok(ScheduleStatus::Completed) => summary.completed = count,
                Ok(ScheduleStatus::Failed) => summary.failed = count,
                Ok(ScheduleStatus::Cancelled) => summary.cancelled = count,
                Err(e) => warn!(error = %e, "unexpected schedule status in store"),
            }
        }

        let (due_next_24h, overdue): (i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN run_at_utc > ?1 AND run_at_utc <= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN run_at_utc <= ?1 THEN 1 ELSE 0 END), 0)
             FROM schedules WHERE status = 'scheduled'",
            params![fmt_ts(&now), fmt_ts(&(now + Duration::hours(24)))],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        summary.due_next_24h = due_next_24h as u64;
        summary.overdue = overdue as u64;

        let (total, in_flight, passed, failed, last): (i64, i64, i64, i64, Option<String>) = conn
            .query_row(
                "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN finished_at IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'passed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status IN ('failed', 'timed_out') THEN 1 ELSE 0 END), 0),
                    MAX(started_at)
                 FROM runs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;
        summary.total_runs = total as u64;
        summary.runs_in_flight = in_flight as u64;
        summary.runs_passed = passed as u64;
        summary.runs_failed = failed as u64;
        summary.last_run_at = parse_opt_ts(last)?;

        Ok(summary)
    }
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let kind: String = row.get(3)?;
    let status: String = row.get(4)?;
    let conv = |idx: usize, e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    };

    Ok(Run {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        test_id: row.get(2)?,
        kind: kind.parse().map_err(|e| conv(3, e))?,
        status: status.parse().map_err(|e| conv(4, e))?,
        retry_index: row.get(5)?,
        started_at: parse_ts(&row.get::<_, String>(6)?)?,
        finished_at: parse_opt_ts(row.get(7)?)?,
        exit_code: row.get(8)?,
        tests_total: row.get(9)?,
        tests_passed: row.get(10)?,
        tests_failed: row.get(11)?,
        tests_skipped: row.get(12)?,
        duration_ms: row.get(13)?,
        error_message: row.get(14)?,
        notes: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ExecutionOptions, NewSchedule, ScheduleStore};
    use crate::storage::open_pool;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()
    }

    fn setup() -> (TempDir, Pool) {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("ledger.db").to_str().unwrap()).unwrap();
        (dir, pool)
    }

    fn passed(total: u32) -> RunOutcome {
        RunOutcome {
            status: RunStatus::Passed,
            exit_code: Some(0),
            tests_total: total,
            tests_passed: total,
            tests_failed: 0,
            tests_skipped: 0,
            error_message: None,
        }
    }

    fn new_run(schedule_id: &str, retry_index: u32) -> NewRun {
        NewRun {
            schedule_id: Some(schedule_id.to_string()),
            test_id: None,
            kind: RunKind::Scheduled,
            retry_index,
            notes: None,
        }
    }

    #[test]
    fn test_record_then_seal() {
        let (_dir, pool) = setup();
        let ledger = RunLedger::new(pool);

        let run = ledger.record(new_run("s-1", 0), now()).unwrap();
        assert!(!run.is_sealed());
        assert_eq!(ledger.in_flight("s-1").unwrap().len(), 1);

        let sealed = ledger
            .seal(&run.id, &passed(3), now() + Duration::milliseconds(1500))
            .unwrap();
        assert_eq!(sealed.status, RunStatus::Passed);
        assert_eq!(sealed.tests_total, 3);
        assert_eq!(sealed.duration_ms, Some(1500));
        assert!(ledger.in_flight("s-1").unwrap().is_empty());
    }

    #[test]
    fn test_sealed_run_is_immutable() {
        let (_dir, pool) = setup();
        let ledger = RunLedger::new(pool);
        let run = ledger.record(new_run("s-1", 0), now()).unwrap();
        ledger.seal(&run.id, &passed(1), now()).unwrap();

        let mut failing = passed(1);
        failing.status = RunStatus::Failed;
        assert!(matches!(
            ledger.seal(&run.id, &failing, now()),
            Err(ScheduleError::RunSealed(_))
        ));
        assert_eq!(ledger.get(&run.id).unwrap().status, RunStatus::Passed);
    }

    #[test]
    fn test_list_by_schedule_newest_first() {
        let (_dir, pool) = setup();
        let ledger = RunLedger::new(pool);
        for i in 0..3 {
            let run = ledger
                .record(new_run("s-1", i), now() + Duration::seconds(i as i64))
                .unwrap();
            ledger.seal(&run.id, &passed(1), now() + Duration::seconds(i as i64)).unwrap();
        }
        ledger.record(new_run("s-2", 0), now()).unwrap();

        let runs = ledger.list_by_schedule("s-1", None).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].retry_index, 2);
        assert_eq!(runs[2].retry_index, 0);
        assert_eq!(ledger.list_by_schedule("s-1", Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_runs_survive_schedule_deletion() {
        let (_dir, pool) = setup();
        let store = ScheduleStore::new(pool.clone(), 3);
        let ledger = RunLedger::new(pool);

        let s = store
            .create(
                NewSchedule {
                    suite_id: "smoke".to_string(),
                    suite_name: None,
                    run_at: "2026-06-01T09:00".to_string(),
                    timezone: "UTC".to_string(),
                    notes: None,
                    priority: 0,
                    execution_options: ExecutionOptions::default(),
                },
                now(),
            )
            .unwrap();
        let run = ledger.record(new_run(&s.id, 0), now()).unwrap();
        ledger.seal(&run.id, &passed(1), now()).unwrap();

        store.delete(&s.id).unwrap();
        assert_eq!(ledger.list_by_schedule(&s.id, None).unwrap().len(), 1);
    }

    #[test]
    fn test_stats_summary_counts() {
        let (_dir, pool) = setup();
        let store = ScheduleStore::new(pool.clone(), 3);
        let ledger = RunLedger::new(pool);

        let mk = |run_at: &str| NewSchedule {
            suite_id: "smoke".to_string(),
            suite_name: None,
            run_at: run_at.to_string(),
            timezone: "UTC".to_string(),
            notes: None,
            priority: 0,
            execution_options: ExecutionOptions::default(),
        };
        store.create(mk("2026-06-01T10:00"), now()).unwrap();
        store.create(mk("2026-06-03T10:00"), now()).unwrap();
        let c = store.create(mk("2026-06-01T11:00"), now()).unwrap();
        store.cancel(&c.id, now()).unwrap();

        let r = ledger.record(new_run("x", 0), now()).unwrap();
        let mut failed = passed(2);
        failed.status = RunStatus::Failed;
        failed.tests_passed = 1;
        failed.tests_failed = 1;
        ledger.seal(&r.id, &failed, now()).unwrap();
        ledger.record(new_run("y", 0), now()).unwrap();

        let summary = ledger.stats_summary(now()).unwrap();
        assert_eq!(summary.total_schedules, 3);
        assert_eq!(summary.scheduled, 2);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.due_next_24h, 1);
        assert_eq!(summary.overdue, 0);
        assert_eq!(summary.total_runs, 2);
        assert_eq!(summary.runs_in_flight, 1);
        assert_eq!(summary.runs_failed, 1);
        assert_eq!(summary.last_run_at, Some(now()));
    }

    #[test]
    fn test_seal_orphans_only_takes_lapsed_leases() {
        let (_dir, pool) = setup();
        let ledger = RunLedger::new(pool);
        let stale = ledger.record(new_run("s-1", 0), now()).unwrap();
        let live = ledger.record(new_run("s-2", 0), now()).unwrap();

        let later = now() + chrono::Duration::minutes(10);
        ledger.touch(&live.id, later).unwrap();

        let cutoff = later - chrono::Duration::minutes(2);
        assert_eq!(ledger.seal_orphans(cutoff, later).unwrap(), 1);
        let sealed = ledger.get(&stale.id).unwrap();
        assert_eq!(sealed.status, RunStatus::Failed);
        assert!(sealed.is_sealed());
        assert!(!ledger.get(&live.id).unwrap().is_sealed());
    }
}

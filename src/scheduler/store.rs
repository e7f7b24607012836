use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ExecutionOptions, NewSchedule, Schedule, ScheduleError, ScheduleFilter, ScheduleStatus,
};
use crate::clock;
use crate::storage::{fmt_ts, parse_ts, Pool};

const SCHEDULE_COLUMNS: &str = "id, suite_id, suite_name, run_at_utc, timezone, status, priority, \
     options_json, notes, claim_token, cancel_requested, created_at, updated_at";

/// How a claim was obtained. Due claims move the schedule to `running`;
/// manual claims leave its status alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Due,
    Manual,
}

/// Exclusive right to execute a schedule. At most one exists per schedule.
#[derive(Debug, Clone)]
pub struct Claim {
    pub schedule_id: String,
    pub token: String,
    pub kind: ClaimKind,
}

/// Persists schedules in SQLite. Every status change is a guarded UPDATE so
/// that concurrent callers serialize on the database write lock.
#[derive(Clone)]
pub struct ScheduleStore {
    pool: Pool,
    max_retries: u32,
}

impl ScheduleStore {
    pub fn new(pool: Pool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    /// Validate and persist a new schedule.
    pub fn create(&self, spec: NewSchedule, now: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        if spec.suite_id.trim().is_empty() {
            return Err(ScheduleError::InvalidOptions("suite_id must not be empty".to_string()));
        }
        spec.execution_options.validate(self.max_retries)?;
        let instant = clock::normalize(&spec.run_at, &spec.timezone, now)?;

        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            suite_name: spec
                .suite_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| spec.suite_id.clone()),
            suite_id: spec.suite_id,
            run_at_utc: instant.utc(),
            timezone: instant.zone().name().to_string(),
            status: ScheduleStatus::Scheduled,
            priority: spec.priority,
            execution_options: spec.execution_options,
            notes: spec.notes,
            claimed: false,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO schedules (id, suite_id, suite_name, run_at_utc, timezone, status, priority,
                                    options_json, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                schedule.id,
                schedule.suite_id,
                schedule.suite_name,
                fmt_ts(&schedule.run_at_utc),
                schedule.timezone,
                schedule.status.as_str(),
                schedule.priority,
                serde_json::to_string(&schedule.execution_options)?,
                schedule.notes,
                fmt_ts(&now),
            ],
        )?;

        info!(
            schedule_id = %schedule.id,
            suite = %schedule.suite_id,
            run_at_utc = %schedule.run_at_utc,
            timezone = %schedule.timezone,
            "schedule created"
        );
        Ok(schedule)
    }

    pub fn get(&self, id: &str) -> Result<Schedule, ScheduleError> {
        self.find(id)?
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }

    fn find(&self, id: &str) -> Result<Option<Schedule>, ScheduleError> {
        let conn = self.pool.get()?;
        let schedule = conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id],
                row_to_schedule,
            )
            .optional()?;
        Ok(schedule)
    }

    /// List schedules, soonest first.
    pub fn list(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>, ScheduleError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR suite_id = ?2)
             ORDER BY run_at_utc ASC, priority DESC
             LIMIT ?3"
        ))?;

        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![filter.status.map(|s| s.as_str()), filter.suite_id, limit],
            row_to_schedule,
        )?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    /// Unclaimed `scheduled` schedules whose due instant is at or before `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ScheduleError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE status = 'scheduled' AND claim_token IS NULL AND run_at_utc <= ?1
             ORDER BY priority DESC, run_at_utc ASC"
        ))?;
        let rows = stmt.query_map(params![fmt_ts(&now)], row_to_schedule)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    /// Cancel a schedule that is `scheduled` and not claimed. Loses cleanly to
    /// a concurrent claim with [`ScheduleError::Conflict`].
    pub fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules SET status = 'cancelled', updated_at = ?2
             WHERE id = ?1 AND status = 'scheduled' AND claim_token IS NULL",
            params![id, fmt_ts(&now)],
        )?;
        drop(conn);

        if changed != 1 {
            return Err(self.conflict(id, "scheduled and unclaimed")?);
        }
        info!(schedule_id = %id, "schedule cancelled");
        self.get(id)
    }

    /// Put a finished schedule back to `scheduled` at a new time. The only
    /// path back into `scheduled`.
    pub fn reschedule(
        &self,
        id: &str,
        run_at: &str,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<Schedule, ScheduleError> {
        let instant = clock::normalize(run_at, timezone, now)?;
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules
             SET status = 'scheduled', run_at_utc = ?2, timezone = ?3, cancel_requested = 0,
                 updated_at = ?4
             WHERE id = ?1 AND status IN ('completed', 'failed', 'cancelled') AND claim_token IS NULL",
            params![
                id,
                fmt_ts(&instant.utc()),
                instant.zone().name(),
                fmt_ts(&now)
            ],
        )?;
        drop(conn);

        if changed != 1 {
            return Err(self.conflict(id, "completed, failed or cancelled")?);
        }
        info!(schedule_id = %id, run_at_utc = %instant.utc(), "schedule rescheduled");
        self.get(id)
    }

    /// Remove a schedule that no run is executing. Its runs stay in the ledger.
    pub fn delete(&self, id: &str) -> Result<(), ScheduleError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "DELETE FROM schedules WHERE id = ?1 AND claim_token IS NULL",
            params![id],
        )?;
        drop(conn);

        if changed != 1 {
            return Err(self.conflict(id, "unclaimed")?);
        }
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    /// Flag an in-flight execution for cooperative stop.
    pub fn request_stop(&self, id: &str, now: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules SET cancel_requested = 1, updated_at = ?2
             WHERE id = ?1 AND claim_token IS NOT NULL",
            params![id, fmt_ts(&now)],
        )?;
        drop(conn);

        if changed != 1 {
            return Err(self.conflict(id, "claimed by an in-flight run")?);
        }
        info!(schedule_id = %id, "stop requested");
        self.get(id)
    }

    pub fn stop_requested(&self, claim: &Claim) -> Result<bool, ScheduleError> {
        let conn = self.pool.get()?;
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM schedules WHERE id = ?1 AND claim_token = ?2",
                params![claim.schedule_id, claim.token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Atomically move a due schedule from `scheduled` to `running`.
    pub fn claim_due(&self, id: &str, now: DateTime<Utc>) -> Result<Claim, ScheduleError> {
        let token = Uuid::new_v4().to_string();
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules
             SET status = 'running', claim_token = ?2, claim_heartbeat_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'scheduled' AND claim_token IS NULL AND run_at_utc <= ?3",
            params![id, token, fmt_ts(&now)],
        )?;
        drop(conn);

        if changed != 1 {
            return Err(self.conflict(id, "scheduled, unclaimed and due")?);
        }
        debug!(schedule_id = %id, "schedule claimed");
        Ok(Claim {
            schedule_id: id.to_string(),
            token,
            kind: ClaimKind::Due,
        })
    }

    /// Claim a schedule for a manual run without touching its status.
    pub fn claim_manual(&self, id: &str, now: DateTime<Utc>) -> Result<Claim, ScheduleError> {
        let token = Uuid::new_v4().to_string();
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules SET claim_token = ?2, claim_heartbeat_at = ?3, updated_at = ?3
             WHERE id = ?1 AND claim_token IS NULL AND status <> 'cancelled'",
            params![id, token, fmt_ts(&now)],
        )?;
        drop(conn);

        if changed != 1 {
            return Err(self.conflict(id, "unclaimed and not cancelled")?);
        }
        debug!(schedule_id = %id, "schedule claimed for manual run");
        Ok(Claim {
            schedule_id: id.to_string(),
            token,
            kind: ClaimKind::Manual,
        })
    }

    /// Drop a claim, optionally moving the schedule to its final status.
    pub fn release(
        &self,
        claim: &Claim,
        final_status: Option<ScheduleStatus>,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules
             SET claim_token = NULL, claim_heartbeat_at = NULL, cancel_requested = 0,
                 status = COALESCE(?3, status), updated_at = ?4
             WHERE id = ?1 AND claim_token = ?2",
            params![
                claim.schedule_id,
                claim.token,
                final_status.map(|s| s.as_str()),
                fmt_ts(&now)
            ],
        )?;
        drop(conn);

        if changed != 1 {
            return Err(self.conflict(&claim.schedule_id, "held by this claim")?);
        }
        debug!(schedule_id = %claim.schedule_id, status = ?final_status, "claim released");
        Ok(())
    }

    /// Refresh the lease of a held claim. Returns false once the claim is gone.
    pub fn touch_claim(&self, claim: &Claim, now: DateTime<Utc>) -> Result<bool, ScheduleError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules SET claim_heartbeat_at = ?3 WHERE id = ?1 AND claim_token = ?2",
            params![claim.schedule_id, claim.token, fmt_ts(&now)],
        )?;
        Ok(changed == 1)
    }

    /// Release claims whose lease was last refreshed before `stale_before`,
    /// i.e. claims left behind by a process that died mid-run. Schedules
    /// caught in `running` end up `failed`. Claims still being refreshed are
    /// untouched, whichever process holds them.
    pub fn release_orphaned_claims(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, ScheduleError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE schedules
             SET claim_token = NULL, claim_heartbeat_at = NULL, cancel_requested = 0,
                 status = CASE status WHEN 'running' THEN 'failed' ELSE status END,
                 updated_at = ?2
             WHERE claim_token IS NOT NULL
               AND COALESCE(claim_heartbeat_at, updated_at) < ?1",
            params![fmt_ts(&stale_before), fmt_ts(&now)],
        )?;
        if changed > 0 {
            info!(count = changed, "released orphaned schedule claims");
        }
        Ok(changed)
    }

    /// Build the error for a guarded update that matched nothing.
    fn conflict(&self, id: &str, expected: &str) -> Result<ScheduleError, ScheduleError> {
        let Some(current) = self.find(id)? else {
            return Ok(ScheduleError::NotFound(id.to_string()));
        };
        let found = if current.claimed {
            format!("{} (claimed)", current.status)
        } else {
            current.status.to_string()
        };
        Ok(ScheduleError::Conflict {
            id: id.to_string(),
            expected: expected.to_string(),
            found,
        })
    }
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let status_str: String = row.get(5)?;
    let status = status_str.parse::<ScheduleStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
    })?;
    let options_json: String = row.get(7)?;
    let execution_options: ExecutionOptions = serde_json::from_str(&options_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Schedule {
        id: row.get(0)?,
        suite_id: row.get(1)?,
        suite_name: row.get(2)?,
        run_at_utc: parse_ts(&row.get::<_, String>(3)?)?,
        timezone: row.get(4)?,
        status,
        priority: row.get(6)?,
        execution_options,
        notes: row.get(8)?,
        claimed: row.get::<_, Option<String>>(9)?.is_some(),
        cancel_requested: row.get::<_, i64>(10)? != 0,
        created_at: parse_ts(&row.get::<_, String>(11)?)?,
        updated_at: parse_ts(&row.get::<_, String>(12)?)?,
    })
}

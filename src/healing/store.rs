use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Candidate, HealingError, HealingOutcome, HealingRecord, HealingStats, RecordContext, RecordFilter,
};
use crate::storage::{fmt_ts, parse_opt_ts, parse_ts, Pool};

const RECORD_COLUMNS: &str = "id, fingerprint, original_selector, url, action_type, dom_snapshot_ref, \
     error_message, candidates_json, applied_selector, outcome, superseded_by, created_at, decided_at";

/// Stable identity of a failure: same selector, page and error.
pub fn fingerprint(selector: &str, url: Option<&str>, error: &str) -> String {
    let key = format!("{selector}\0{}\0{error}", url.unwrap_or_default());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// Append-only store of healing records. Only `outcome`, `applied_selector`,
/// `decided_at` and `superseded_by` ever change after insert.
#[derive(Clone)]
pub struct HealingStore {
    pool: Pool,
}

impl HealingStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Pending record with the same fingerprint, if any.
    pub fn find_pending(&self, fingerprint: &str) -> Result<Option<HealingRecord>, HealingError> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM healing_records
                     WHERE fingerprint = ?1 AND outcome = 'pending' AND superseded_by IS NULL
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![fingerprint],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert a new record and mark older records for the same selector as
    /// superseded by it.
    pub fn insert(&self, record: &HealingRecord) -> Result<usize, HealingError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO healing_records ({RECORD_COLUMNS}, top_confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                record.id,
                record.fingerprint,
                record.original_selector,
                record.context.url,
                record.context.action_type,
                record.context.dom_snapshot_ref,
                record.error_message,
                serde_json::to_string(&record.candidates)?,
                record.applied_selector,
                record.outcome.as_str(),
                record.superseded_by,
                fmt_ts(&record.created_at),
                record.decided_at.as_ref().map(fmt_ts),
                record.top().map(|c| c.confidence),
            ],
        )?;
        let superseded = tx.execute(
            "UPDATE healing_records SET superseded_by = ?1
             WHERE original_selector = ?2 AND id <> ?1 AND superseded_by IS NULL",
            params![record.id, record.original_selector],
        )?;
        tx.commit()?;

        debug!(record_id = %record.id, superseded, "healing record stored");
        Ok(superseded)
    }

    pub fn get(&self, id: &str) -> Result<HealingRecord, HealingError> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM healing_records WHERE id = ?1"),
            params![id],
            row_to_record,
        )
        .optional()?
        .ok_or_else(|| HealingError::NotFound(id.to_string()))
    }

    /// Newest first.
    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<HealingRecord>, HealingError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM healing_records
             WHERE (?1 IS NULL OR outcome = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(params![filter.outcome.map(|o| o.as_str()), limit], row_to_record)?;
        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    /// Move a pending, current record to accepted or rejected. A record is
    /// decided once, and never after a newer record superseded it.
    pub fn decide(
        &self,
        id: &str,
        outcome: HealingOutcome,
        applied_selector: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<HealingRecord, HealingError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE healing_records SET outcome = ?2, applied_selector = ?3, decided_at = ?4
             WHERE id = ?1 AND outcome = 'pending' AND superseded_by IS NULL",
            params![id, outcome.as_str(), applied_selector, fmt_ts(&now)],
        )?;
        drop(conn);

        if changed != 1 {
            let current = self.get(id)?;
            return Err(match current.superseded_by {
                Some(by) if current.outcome == HealingOutcome::Pending => HealingError::Superseded {
                    id: id.to_string(),
                    by,
                },
                _ => HealingError::AlreadyDecided {
                    id: id.to_string(),
                    outcome: current.outcome,
                },
            });
        }
        info!(record_id = %id, outcome = %outcome, applied = ?applied_selector, "healing record decided");
        self.get(id)
    }

    pub fn stats(&self) -> Result<HealingStats, HealingError> {
        let conn = self.pool.get()?;
        let (total, pending, accepted, rejected, avg_top): (i64, i64, i64, i64, Option<f64>) = conn
            .query_row(
                "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN outcome = 'pending' AND superseded_by IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN outcome = 'accepted' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN outcome = 'rejected' THEN 1 ELSE 0 END), 0),
                    AVG(top_confidence)
                 FROM healing_records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;

        let decided = accepted + rejected;
        Ok(HealingStats {
            total: total as u64,
            pending: pending as u64,
            accepted: accepted as u64,
            rejected: rejected as u64,
            success_rate: if decided == 0 {
                0.0
            } else {
                accepted as f64 / decided as f64
            },
            average_top_confidence: avg_top.unwrap_or(0.0),
        })
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<HealingRecord> {
    let candidates_json: String = row.get(7)?;
    let candidates: Vec<Candidate> = serde_json::from_str(&candidates_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let outcome: String = row.get(9)?;

    Ok(HealingRecord {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        original_selector: row.get(2)?,
        context: RecordContext {
            url: row.get(3)?,
            action_type: row.get(4)?,
            dom_snapshot_ref: row.get(5)?,
        },
        error_message: row.get(6)?,
        candidates,
        applied_selector: row.get(8)?,
        outcome: outcome.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, e.into())
        })?,
        superseded_by: row.get(10)?,
        created_at: parse_ts(&row.get::<_, String>(11)?)?,
        decided_at: parse_opt_ts(row.get(12)?)?,
    })
}

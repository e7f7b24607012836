//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 3;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            suite_id TEXT NOT NULL,
            suite_name TEXT NOT NULL,
            run_at_utc TEXT NOT NULL,
            timezone TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled',
            priority INTEGER NOT NULL DEFAULT 0,
            options_json TEXT NOT NULL,
            notes TEXT,
            claim_token TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- schedule_id is not a foreign key: runs outlive their schedule.
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            schedule_id TEXT,
            test_id TEXT,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_index INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            exit_code INTEGER,
            tests_total INTEGER NOT NULL DEFAULT 0,
            tests_passed INTEGER NOT NULL DEFAULT 0,
            tests_failed INTEGER NOT NULL DEFAULT 0,
            tests_skipped INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER,
            error_message TEXT,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS healing_records (
            id TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            original_selector TEXT NOT NULL,
            url TEXT,
            action_type TEXT,
            dom_snapshot_ref TEXT,
            error_message TEXT,
            candidates_json TEXT NOT NULL,
            top_confidence REAL,
            applied_selector TEXT,
            outcome TEXT NOT NULL DEFAULT 'pending',
            superseded_by TEXT,
            created_at TEXT NOT NULL,
            decided_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(status, run_at_utc);
        CREATE INDEX IF NOT EXISTS idx_runs_schedule ON runs(schedule_id, retry_index);
        CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
        CREATE INDEX IF NOT EXISTS idx_healing_selector ON healing_records(original_selector);
        CREATE INDEX IF NOT EXISTS idx_healing_fingerprint ON healing_records(fingerprint);",
    )?;

    // Migration: cooperative stop flag added after the first schema cut.
    add_column(conn, "schedules", "cancel_requested", "INTEGER NOT NULL DEFAULT 0")?;
    // Migration: claim and run leases, refreshed by the executing worker.
    add_column(conn, "schedules", "claim_heartbeat_at", "TEXT")?;
    add_column(conn, "runs", "heartbeat_at", "TEXT")?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let present: i32 = conn
        .query_row(
            &format!("SELECT count(*) FROM pragma_table_info('{table}') WHERE name = ?1"),
            [column],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if present == 0 {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])?;
    }
    Ok(())
}

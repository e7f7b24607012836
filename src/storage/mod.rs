//! SQLite storage layer -- pool, schema, timestamp encoding.

pub mod schema;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Store-level failure. Always propagated to the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Implement `From` for the storage error sources on a domain error enum that
/// has a `Storage(StorageError)` variant, so `?` works on pool and query calls.
#[macro_export]
macro_rules! impl_storage_error_from {
    ($target:ty) => {
        impl From<r2d2::Error> for $target {
            fn from(e: r2d2::Error) -> Self {
                Self::Storage($crate::storage::StorageError::from(e))
            }
        }

        impl From<rusqlite::Error> for $target {
            fn from(e: rusqlite::Error) -> Self {
                Self::Storage($crate::storage::StorageError::from(e))
            }
        }

        impl From<serde_json::Error> for $target {
            fn from(e: serde_json::Error) -> Self {
                Self::Storage($crate::storage::StorageError::from(e))
            }
        }
    };
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Encode an instant for storage. Fixed-width UTC so that string comparison
/// in SQL matches chronological order.
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decode a stored instant. Used inside `query_map` closures, hence the
/// rusqlite error type.
pub fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

//! SQLite backend.
//!
//! The `(subject_id, day)` primary key is the uniqueness constraint;
//! `INSERT OR IGNORE` is the insert-if-absent primitive and a single
//! `UPDATE ... RETURNING` performs the atomic increment. Counters are stored
//! as `INTEGER` and saturate at `i64::MAX`; SQLite would otherwise promote an
//! overflowing sum to `REAL`. Each call opens its own connection on the
//! blocking pool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::OptionalExtension;

use crate::error::{LedgerError, Result};

use super::backend::{InsertOutcome, UsageBackend};
use super::{DayKey, UsageRecord};

const SELECT_COLUMNS: &str = "subject_id, day, consumed_units, request_count, \
     last_reset_at_ms, created_at_ms, updated_at_ms";

#[derive(Clone, Debug)]
pub struct SqliteBackend {
    path: PathBuf,
}

impl SqliteBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the database file and schema if missing.
    pub async fn init(&self) -> Result<()> {
        let path = self.path.clone();
        run_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl UsageBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn fetch(&self, key: &DayKey) -> Result<Option<UsageRecord>> {
        let path = self.path.clone();
        let key = key.clone();
        run_blocking(move || {
            let conn = open_connection(path)?;
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM usage_records WHERE subject_id = ?1 AND day = ?2"
            );
            let row = conn
                .query_row(
                    &sql,
                    rusqlite::params![key.subject_id, key.day.to_string()],
                    row_to_raw,
                )
                .optional()?;
            row.map(RawRow::into_record).transpose()
        })
        .await
    }

    async fn try_insert(&self, record: UsageRecord) -> Result<InsertOutcome> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(path)?;
            let changed = conn.execute(
                "INSERT OR IGNORE INTO usage_records
                 (subject_id, day, consumed_units, request_count,
                  last_reset_at_ms, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.subject_id,
                    record.day.to_string(),
                    u64_to_i64(record.consumed_units),
                    u64_to_i64(record.request_count),
                    record.last_reset_at.timestamp_millis(),
                    record.created_at.timestamp_millis(),
                    record.updated_at.timestamp_millis(),
                ],
            )?;
            Ok(if changed == 1 {
                InsertOutcome::Inserted
            } else {
                InsertOutcome::Conflict
            })
        })
        .await
    }

    async fn increment(
        &self,
        key: &DayKey,
        units: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>> {
        let path = self.path.clone();
        let key = key.clone();
        run_blocking(move || {
            let conn = open_connection(path)?;
            let sql = format!(
                "UPDATE usage_records
                 SET consumed_units = CASE
                         WHEN consumed_units > 9223372036854775807 - ?3
                         THEN 9223372036854775807
                         ELSE consumed_units + ?3
                     END,
                     request_count = CASE
                         WHEN request_count = 9223372036854775807
                         THEN request_count
                         ELSE request_count + 1
                     END,
                     updated_at_ms = ?4
                 WHERE subject_id = ?1 AND day = ?2
                 RETURNING {SELECT_COLUMNS}"
            );
            let row = conn
                .query_row(
                    &sql,
                    rusqlite::params![
                        key.subject_id,
                        key.day.to_string(),
                        u64_to_i64(units),
                        at.timestamp_millis(),
                    ],
                    row_to_raw,
                )
                .optional()?;
            row.map(RawRow::into_record).transpose()
        })
        .await
    }

    async fn list(&self) -> Result<Vec<UsageRecord>> {
        let path = self.path.clone();
        run_blocking(move || {
            let conn = open_connection(path)?;
            let sql = format!("SELECT {SELECT_COLUMNS} FROM usage_records");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_raw)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?.into_record()?);
            }
            Ok(records)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

struct RawRow {
    subject_id: String,
    day: String,
    consumed_units: i64,
    request_count: i64,
    last_reset_at_ms: i64,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl RawRow {
    fn into_record(self) -> Result<UsageRecord> {
        let day = NaiveDate::parse_from_str(&self.day, "%Y-%m-%d").map_err(|e| {
            LedgerError::StoreUnavailable(format!("corrupt day '{}': {}", self.day, e))
        })?;
        Ok(UsageRecord {
            subject_id: self.subject_id,
            day,
            consumed_units: i64_to_u64(self.consumed_units),
            request_count: i64_to_u64(self.request_count),
            last_reset_at: millis_to_utc(self.last_reset_at_ms)?,
            created_at: millis_to_utc(self.created_at_ms)?,
            updated_at: millis_to_utc(self.updated_at_ms)?,
        })
    }
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        subject_id: row.get(0)?,
        day: row.get(1)?,
        consumed_units: row.get(2)?,
        request_count: row.get(3)?,
        last_reset_at_ms: row.get(4)?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
    })
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LedgerError::StoreUnavailable(format!("sqlite join error: {e}")))?
}

fn init_schema(conn: &rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage_records (
            subject_id TEXT NOT NULL,
            day TEXT NOT NULL,
            consumed_units INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            last_reset_at_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (subject_id, day)
        );",
    )
}

fn open_connection(path: PathBuf) -> std::result::Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| LedgerError::StoreUnavailable(format!("corrupt timestamp {ms}")))
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 {
        0
    } else {
        value as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn record(subject: &str) -> UsageRecord {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        UsageRecord::new(subject, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(), start, start)
    }

    async fn backend(dir: &tempfile::TempDir) -> SqliteBackend {
        let store = SqliteBackend::new(dir.path().join("usage.sqlite"));
        store.init().await.expect("init");
        store
    }

    #[tokio::test]
    async fn sqlite_insert_fetch_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = backend(&dir).await;
        let r = record("u1");
        assert_eq!(store.try_insert(r.clone()).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.fetch(&r.key()).await.unwrap(), Some(r));
    }

    #[tokio::test]
    async fn sqlite_primary_key_rejects_duplicate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = backend(&dir).await;
        store.try_insert(record("u1")).await.unwrap();
        assert_eq!(
            store.try_insert(record("u1")).await.unwrap(),
            InsertOutcome::Conflict
        );
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sqlite_increment_missing_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = backend(&dir).await;
        let key = record("ghost").key();
        assert!(store.increment(&key, 1, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_increment_saturates_at_i64_max() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = backend(&dir).await;
        let mut r = record("heavy");
        r.consumed_units = i64::MAX as u64 - 3;
        let key = r.key();
        store.try_insert(r).await.unwrap();

        let after = store.increment(&key, 10, Utc::now()).await.unwrap().unwrap();
        assert_eq!(after.consumed_units, i64::MAX as u64);
        assert_eq!(after.request_count, 1);

        let again = store.increment(&key, u64::MAX, Utc::now()).await.unwrap().unwrap();
        assert_eq!(again.consumed_units, i64::MAX as u64);
        assert_eq!(again.request_count, 2);
        assert_eq!(store.fetch(&key).await.unwrap(), Some(again));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_concurrent_increments_sum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(backend(&dir).await);
        let r = record("hot");
        let key = r.key();
        store.try_insert(r).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.increment(&key, 5, Utc::now()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let stored = store.fetch(&key).await.unwrap().unwrap();
        assert_eq!(stored.consumed_units, 80);
        assert_eq!(stored.request_count, 16);
    }
}

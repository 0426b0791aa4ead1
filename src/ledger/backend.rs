//! The persistence collaborator behind the ledger store, and its factory.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{BackendKind, LedgerConfig};
use crate::error::Result;

use super::json_file::JsonFileBackend;
use super::memory::MemoryBackend;
use super::{DayKey, UsageRecord};

/// Outcome of [`UsageBackend::try_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was stored.
    Inserted,
    /// A record with the same `(subject_id, day)` already existed; nothing
    /// was written.
    Conflict,
}

/// Durable keyed storage for [`UsageRecord`]s.
///
/// Implementations must enforce uniqueness of [`DayKey`] and make
/// [`increment`](UsageBackend::increment) a single atomic read-modify-write:
/// N concurrent increments of the same key must sum without lost updates.
/// Any failure to reach the underlying storage is reported as
/// [`LedgerError::StoreUnavailable`](crate::error::LedgerError::StoreUnavailable).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageBackend: Send + Sync {
    /// Short identifier used in logs (`"memory"`, `"json"`, `"sqlite"`).
    fn name(&self) -> &str;

    /// Read the record for `key`, if any.
    async fn fetch(&self, key: &DayKey) -> Result<Option<UsageRecord>>;

    /// Store `record` unless its key is already taken.
    async fn try_insert(&self, record: UsageRecord) -> Result<InsertOutcome>;

    /// Atomically add `units` to `consumed_units` and 1 to `request_count`.
    ///
    /// Returns the post-increment record, or `None` when no record exists for
    /// `key`.
    async fn increment(
        &self,
        key: &DayKey,
        units: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>>;

    /// All stored records, in no particular order.
    async fn list(&self) -> Result<Vec<UsageRecord>>;
}

/// Create the configured backend.
///
/// If SQLite is requested but the `store-sqlite` feature was not compiled in,
/// logs a warning and falls back to the JSON file backend at the same path.
pub async fn create_backend(config: &LedgerConfig) -> Result<Arc<dyn UsageBackend>> {
    let path = config.store_path();
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendKind::Json => Ok(Arc::new(JsonFileBackend::open(path).await?)),
        BackendKind::Sqlite => {
            #[cfg(feature = "store-sqlite")]
            {
                let store = super::sqlite::SqliteBackend::new(path);
                store.init().await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "store-sqlite"))]
            {
                tracing::warn!("store-sqlite feature not compiled; falling back to json. Rebuild with: cargo build --features store-sqlite");
                let path = path.with_extension("json");
                Ok(Arc::new(JsonFileBackend::open(path).await?))
            }
        }
    }
}

//! Single-file JSON backend.
//!
//! The whole record set lives in memory behind one async mutex. A mutation is
//! staged on a copy, written to disk (write-to-temp, then rename), and only
//! then published to the in-memory map. Staging, writing and publishing run on
//! a detached task, so a caller that is cancelled mid-write cannot leave memory
//! and disk disagreeing: the change lands in both or in neither.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{LedgerError, Result};

use super::backend::{InsertOutcome, UsageBackend};
use super::{DayKey, UsageRecord};

type Records = HashMap<DayKey, UsageRecord>;

/// On-disk layout. Records are kept as a list because JSON object keys must
/// be strings.
#[derive(Debug, Default, Serialize, Deserialize)]
struct UsageFile {
    records: Vec<UsageRecord>,
}

/// Result of staging a mutation against a copy of the records.
enum Staged<T> {
    /// Nothing changed; no write needed.
    Unchanged(T),
    /// The copy was modified and must reach disk before it is published.
    Changed(T),
}

/// File-backed [`UsageBackend`].
pub struct JsonFileBackend {
    path: PathBuf,
    state: Arc<Mutex<Records>>,
}

impl JsonFileBackend {
    /// Open the store at `path`, loading any existing records.
    ///
    /// A missing file yields an empty store. An unreadable or corrupt file is
    /// an error: silently starting empty would reset every subject's quota.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = load_state(&path).await?;
        debug!(path = %path.display(), records = state.len(), "Opened usage file");
        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage `change` on a copy of the records, persist the copy, then swap
    /// it in. The in-memory map is never touched unless the write succeeded.
    async fn commit<T, F>(&self, op: &'static str, change: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Records) -> Staged<T> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let path = self.path.clone();
        let task = tokio::spawn(async move {
            let mut guard = state.lock().await;
            let mut candidate = guard.clone();
            let value = match change(&mut candidate) {
                Staged::Unchanged(value) => return Ok(value),
                Staged::Changed(value) => value,
            };
            if let Err(e) = persist(&path, &candidate).await {
                warn!(
                    path = %path.display(),
                    op,
                    error = %e,
                    "Usage write failed; change discarded"
                );
                return Err(e);
            }
            *guard = candidate;
            Ok(value)
        });
        task.await
            .map_err(|e| LedgerError::StoreUnavailable(format!("usage write task failed: {e}")))?
    }
}

impl std::fmt::Debug for JsonFileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileBackend")
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl UsageBackend for JsonFileBackend {
    fn name(&self) -> &str {
        "json"
    }

    async fn fetch(&self, key: &DayKey) -> Result<Option<UsageRecord>> {
        Ok(self.state.lock().await.get(key).cloned())
    }

    async fn try_insert(&self, record: UsageRecord) -> Result<InsertOutcome> {
        self.commit("insert", move |records| {
            let key = record.key();
            if records.contains_key(&key) {
                return Staged::Unchanged(InsertOutcome::Conflict);
            }
            records.insert(key, record);
            Staged::Changed(InsertOutcome::Inserted)
        })
        .await
    }

    async fn increment(
        &self,
        key: &DayKey,
        units: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>> {
        let key = key.clone();
        self.commit("increment", move |records| match records.get_mut(&key) {
            None => Staged::Unchanged(None),
            Some(entry) => {
                entry.apply_increment(units, at);
                Staged::Changed(Some(entry.clone()))
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<UsageRecord>> {
        Ok(self.state.lock().await.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

async fn persist(path: &Path, records: &Records) -> Result<()> {
    let mut sorted: Vec<UsageRecord> = records.values().cloned().collect();
    sorted.sort_by(|a, b| a.key().cmp(&b.key()));
    let json = serde_json::to_string_pretty(&UsageFile { records: sorted })?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
        .await
        .map_err(|e| LedgerError::StoreUnavailable(format!("persist task failed: {e}")))?
}

async fn load_state(path: &Path) -> Result<Records> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(LedgerError::StoreUnavailable(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    if data.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let file: UsageFile = serde_json::from_str(&data)?;
    Ok(file.records.into_iter().map(|r| (r.key(), r)).collect())
}

/// Write `bytes` to a temp file next to `path`, then rename over it.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| {
        LedgerError::StoreUnavailable(format!("failed to create {}: {}", parent.display(), e))
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        LedgerError::StoreUnavailable(format!("failed to write {}: {}", path.display(), e))
    })?;
    Ok(())
}

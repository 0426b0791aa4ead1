//! Process-local backend on a sharded concurrent map.
//!
//! Each `DashMap` entry is guarded by its shard lock, so insert-if-absent and
//! increment are atomic per key without a global mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::Result;

use super::backend::{InsertOutcome, UsageBackend};
use super::{DayKey, UsageRecord};

/// In-memory [`UsageBackend`]. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<DayKey, UsageRecord>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl UsageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, key: &DayKey) -> Result<Option<UsageRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn try_insert(&self, record: UsageRecord) -> Result<InsertOutcome> {
        match self.records.entry(record.key()) {
            Entry::Occupied(_) => Ok(InsertOutcome::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn increment(
        &self,
        key: &DayKey,
        units: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<UsageRecord>> {
        Ok(self.records.get_mut(key).map(|mut r| {
            r.apply_increment(units, at);
            r.clone()
        }))
    }

    async fn list(&self) -> Result<Vec<UsageRecord>> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::Arc;

    fn record(subject: &str) -> UsageRecord {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        UsageRecord::new(subject, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(), start, start)
    }

    #[tokio::test]
    async fn test_insert_then_conflict() {
        let backend = MemoryBackend::new();
        assert_eq!(
            backend.try_insert(record("u1")).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            backend.try_insert(record("u1")).await.unwrap(),
            InsertOutcome::Conflict
        );
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_increment_missing_returns_none() {
        let backend = MemoryBackend::new();
        let key = record("ghost").key();
        assert!(backend.increment(&key, 5, Utc::now()).await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_increment_existing() {
        let backend = MemoryBackend::new();
        let r = record("u1");
        let key = r.key();
        backend.try_insert(r).await.unwrap();
        let after = backend.increment(&key, 7, Utc::now()).await.unwrap().unwrap();
        assert_eq!(after.consumed_units, 7);
        assert_eq!(after.request_count, 1);
        assert_eq!(backend.fetch(&key).await.unwrap(), Some(after));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let backend = Arc::new(MemoryBackend::new());
        let r = record("hot");
        let key = r.key();
        backend.try_insert(r).await.unwrap();

        let mut handles = Vec::new();
        for i in 1..=64u64 {
            let backend = Arc::clone(&backend);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                backend.increment(&key, i, Utc::now()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stored = backend.fetch(&key).await.unwrap().unwrap();
        assert_eq!(stored.consumed_units, (1..=64u64).sum::<u64>());
        assert_eq!(stored.request_count, 64);
    }
}

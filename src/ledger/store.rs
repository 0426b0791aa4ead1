//! The ledger store: race-safe get-or-create and atomic increments.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::error::{LedgerError, Result};

use super::backend::{InsertOutcome, UsageBackend};
use super::day::DayClock;
use super::{DayKey, UsageRecord};

/// Sole writer of [`UsageRecord`]s.
///
/// Holds no state of its own beyond the backend handle and the canonical day
/// zone; cloning is cheap and every clone talks to the same records.
#[derive(Clone)]
pub struct LedgerStore {
    backend: Arc<dyn UsageBackend>,
    days: DayClock,
}

impl LedgerStore {
    pub fn new(backend: Arc<dyn UsageBackend>, days: DayClock) -> Self {
        Self { backend, days }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn days(&self) -> DayClock {
        self.days
    }

    /// Canonical day containing `reference_time`.
    pub fn today(&self, reference_time: DateTime<Utc>) -> NaiveDate {
        self.days.day_of(reference_time)
    }

    /// Return the record for `subject_id` on the day of `reference_time`,
    /// creating a zeroed one if none exists.
    ///
    /// Two callers racing to create the first record of the day both attempt
    /// the insert; the backend's uniqueness constraint rejects the loser,
    /// which then re-reads the winner's record.
    pub async fn get_or_create_daily(
        &self,
        subject_id: &str,
        reference_time: DateTime<Utc>,
    ) -> Result<UsageRecord> {
        let key = self.key_for(subject_id, reference_time)?;

        if let Some(existing) = self.backend.fetch(&key).await? {
            return Ok(existing);
        }

        let fresh = UsageRecord::new(
            key.subject_id.clone(),
            key.day,
            self.days.start_of(key.day),
            reference_time,
        );
        match self.backend.try_insert(fresh.clone()).await? {
            InsertOutcome::Inserted => {
                debug!(
                    subject = %key.subject_id,
                    day = %key.day,
                    backend = self.backend.name(),
                    "Created daily usage record"
                );
                Ok(fresh)
            }
            InsertOutcome::Conflict => {
                debug!(subject = %key.subject_id, day = %key.day, "Lost create race; re-reading");
                self.backend.fetch(&key).await?.ok_or_else(|| {
                    LedgerError::StoreUnavailable(format!(
                        "record for {}/{} rejected as duplicate but not readable",
                        key.subject_id, key.day
                    ))
                })
            }
        }
    }

    /// Atomically add `units_delta` to today's consumption and bump the
    /// request count, creating the record first if needed.
    pub async fn increment_usage(
        &self,
        subject_id: &str,
        reference_time: DateTime<Utc>,
        units_delta: u64,
    ) -> Result<UsageRecord> {
        if units_delta < 1 {
            return Err(LedgerError::InvalidDelta(units_delta));
        }
        let key = self.key_for(subject_id, reference_time)?;

        if let Some(updated) = self
            .backend
            .increment(&key, units_delta, reference_time)
            .await?
        {
            debug!(
                subject = %key.subject_id,
                day = %key.day,
                units = units_delta,
                consumed = updated.consumed_units,
                "Recorded usage"
            );
            return Ok(updated);
        }

        self.get_or_create_daily(subject_id, reference_time).await?;
        let updated = self
            .backend
            .increment(&key, units_delta, reference_time)
            .await?
            .ok_or_else(|| {
                LedgerError::StoreUnavailable(format!(
                    "record for {}/{} missing after create",
                    key.subject_id, key.day
                ))
            })?;
        debug!(
            subject = %key.subject_id,
            day = %key.day,
            units = units_delta,
            consumed = updated.consumed_units,
            "Recorded first usage of the day"
        );
        Ok(updated)
    }

    /// All stored records, sorted by subject then day.
    pub async fn snapshot(&self) -> Result<Vec<UsageRecord>> {
        let mut records = self.backend.list().await?;
        records.sort_by(|a, b| {
            a.subject_id
                .cmp(&b.subject_id)
                .then_with(|| a.day.cmp(&b.day))
        });
        Ok(records)
    }

    fn key_for(&self, subject_id: &str, reference_time: DateTime<Utc>) -> Result<DayKey> {
        if subject_id.trim().is_empty() {
            return Err(LedgerError::InvalidSubject);
        }
        Ok(DayKey::new(subject_id, self.days.day_of(reference_time)))
    }
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("backend", &self.backend.name())
            .field("offset", &self.days.offset())
            .finish()
    }
}

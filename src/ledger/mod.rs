//! Durable per-subject, per-day usage records.
//!
//! The [`LedgerStore`] is the only writer of [`UsageRecord`]s. It talks to a
//! [`UsageBackend`] (the persistence collaborator) that provides a uniqueness
//! constraint over `(subject_id, day)`, an insert-if-absent primitive, and an
//! atomic counter increment.

pub mod backend;
pub mod day;
pub mod json_file;
pub mod memory;
#[cfg(feature = "store-sqlite")]
pub mod sqlite;
pub mod store;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use backend::{create_backend, InsertOutcome, UsageBackend};
pub use day::{Clock, DayClock, FixedClock, SystemClock};
pub use json_file::JsonFileBackend;
pub use memory::MemoryBackend;
pub use store::LedgerStore;

/// Identity of a usage record: one subject on one canonical day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub subject_id: String,
    pub day: NaiveDate,
}

impl DayKey {
    pub fn new(subject_id: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            subject_id: subject_id.into(),
            day,
        }
    }
}

/// Usage accounted to one subject for one canonical day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Opaque identifier of the metered entity.
    pub subject_id: String,
    /// Calendar date in the deployment's canonical zone.
    pub day: NaiveDate,
    /// Units consumed today (e.g. tokens).
    pub consumed_units: u64,
    /// Discrete consumption events recorded today.
    pub request_count: u64,
    /// Start of this day's accounting window.
    pub last_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageRecord {
    /// A zeroed record whose window opened at `last_reset_at`.
    pub fn new(
        subject_id: impl Into<String>,
        day: NaiveDate,
        last_reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            day,
            consumed_units: 0,
            request_count: 0,
            last_reset_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> DayKey {
        DayKey::new(self.subject_id.clone(), self.day)
    }

    /// Apply one consumption event in place.
    ///
    /// Backends call this while holding whatever lock makes the update atomic.
    pub(crate) fn apply_increment(&mut self, units: u64, at: DateTime<Utc>) {
        self.consumed_units = self.consumed_units.saturating_add(units);
        self.request_count = self.request_count.saturating_add(1);
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_record_is_zeroed() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let r = UsageRecord::new("u1", start.date_naive(), start, now);
        assert_eq!(r.consumed_units, 0);
        assert_eq!(r.request_count, 0);
        assert_eq!(r.last_reset_at, start);
        assert_eq!(r.created_at, now);
        assert_eq!(r.key(), DayKey::new("u1", start.date_naive()));
    }

    #[test]
    fn test_apply_increment_bumps_both_counters() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut r = UsageRecord::new("u1", start.date_naive(), start, start);
        r.apply_increment(40, later);
        r.apply_increment(2, later);
        assert_eq!(r.consumed_units, 42);
        assert_eq!(r.request_count, 2);
        assert_eq!(r.updated_at, later);
        assert_eq!(r.created_at, start);
    }

    #[test]
    fn test_record_serde_shape() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let r = UsageRecord::new("api-key-7", start.date_naive(), start, start);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["subject_id"], "api-key-7");
        assert_eq!(json["day"], "2026-03-01");
        assert_eq!(json["consumed_units"], 0);
    }
}

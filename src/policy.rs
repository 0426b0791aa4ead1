//! Stateless interpretation of a [`UsageRecord`] against a daily limit.
//!
//! Every function here is pure: no I/O, no clock. Limits are `i64` so that a
//! misconfigured non-positive limit is representable; such limits are treated
//! as "always exhausted".

use crate::ledger::UsageRecord;

/// Daily limit applied when configuration does not specify one.
pub const DEFAULT_DAILY_LIMIT: i64 = 10_000;

/// Coarse classification of a subject's standing for the day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuotaLevel {
    /// Below the warning threshold.
    Ok,
    /// At or above the warning threshold but below the limit. Inner value is
    /// the utilisation fraction (range: `threshold..1.0`).
    Warning(f64),
    /// At or above the limit.
    Exhausted,
}

/// `true` iff `consumed_units >= daily_limit`. Exactly at the limit counts as
/// exceeded.
pub fn has_exceeded(record: &UsageRecord, daily_limit: i64) -> bool {
    if daily_limit <= 0 {
        return true;
    }
    record.consumed_units >= daily_limit as u64
}

/// Utilisation as a percentage in `[0, 100]`, clamped at 100.
pub fn usage_percentage(record: &UsageRecord, daily_limit: i64) -> f64 {
    if daily_limit <= 0 {
        return 100.0;
    }
    let pct = record.consumed_units as f64 / daily_limit as f64 * 100.0;
    pct.min(100.0)
}

/// Units left today, never negative.
pub fn remaining_units(record: &UsageRecord, daily_limit: i64) -> u64 {
    if daily_limit <= 0 {
        return 0;
    }
    (daily_limit as u64).saturating_sub(record.consumed_units)
}

/// Classify `record` relative to `daily_limit` and a warning threshold
/// expressed as a fraction of the limit.
pub fn level(record: &UsageRecord, daily_limit: i64, warning_threshold: f64) -> QuotaLevel {
    if has_exceeded(record, daily_limit) {
        return QuotaLevel::Exhausted;
    }
    let fraction = usage_percentage(record, daily_limit) / 100.0;
    if fraction >= warning_threshold {
        QuotaLevel::Warning(fraction)
    } else {
        QuotaLevel::Ok
    }
}

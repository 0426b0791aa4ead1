//! The façade request handlers talk to.
//!
//! Call [`UsageAccountant::check_quota`] before expensive work and
//! [`UsageAccountant::record_consumption`] after it. The cap is soft: work
//! that was let through is always accounted, even if it overshoots the limit;
//! the *next* request is the one that gets blocked.
//!
//! # Example
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//! use usage_ledger::accountant::UsageAccountant;
//! use usage_ledger::config::LedgerConfig;
//! use usage_ledger::ledger::{DayClock, LedgerStore, MemoryBackend};
//!
//! let store = LedgerStore::new(Arc::new(MemoryBackend::new()), DayClock::utc());
//! let accountant = UsageAccountant::new(store, &LedgerConfig::default());
//!
//! let status = accountant.check_quota("user-1", Some(100)).await.unwrap();
//! assert!(status.allowed);
//!
//! let status = accountant.record_consumption("user-1", 100, Some(100)).await.unwrap();
//! assert!(!status.allowed);
//! assert_eq!(status.remaining_units, 0);
//! # });
//! ```
//!
//! # Storage outages
//!
//! `StoreUnavailable` is returned unchanged. The accountant never decides
//! between failing open and failing closed; that choice belongs to the caller
//! (see [`crate::guard::OutagePolicy`]).

use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::error::Result;
use crate::ledger::{backend, Clock, DayClock, LedgerStore, SystemClock, UsageRecord};
use crate::policy::{self, QuotaLevel};

/// Outcome of a quota check or a consumption report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    /// Whether the subject may start another metered operation today.
    pub allowed: bool,
    pub remaining_units: u64,
    /// Utilisation in `[0, 100]`.
    pub usage_percentage: f64,
    /// The limit this status was evaluated against.
    pub daily_limit: i64,
    #[serde(skip)]
    pub level: QuotaLevel,
    pub record: UsageRecord,
}

impl QuotaStatus {
    fn evaluate(record: UsageRecord, daily_limit: i64, warning_threshold: f64) -> Self {
        Self {
            allowed: !policy::has_exceeded(&record, daily_limit),
            remaining_units: policy::remaining_units(&record, daily_limit),
            usage_percentage: policy::usage_percentage(&record, daily_limit),
            daily_limit,
            level: policy::level(&record, daily_limit, warning_threshold),
            record,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    daily_limit: i64,
    warning_threshold: f64,
}

impl From<&LedgerConfig> for Limits {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            daily_limit: config.daily_limit,
            warning_threshold: config.warning_threshold,
        }
    }
}

/// Combines the ledger store with the quota policy.
///
/// Cheap to clone; clones share the store and the live limits.
#[derive(Clone)]
pub struct UsageAccountant {
    store: LedgerStore,
    clock: Arc<dyn Clock>,
    limits: Arc<RwLock<Limits>>,
}

impl UsageAccountant {
    /// Build an accountant over `store` using the wall clock.
    pub fn new(store: LedgerStore, config: &LedgerConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            limits: Arc::new(RwLock::new(Limits::from(config))),
        }
    }

    /// Build the store and backend described by `config`.
    pub async fn from_config(config: &LedgerConfig) -> Result<Self> {
        config.validate()?;
        let backend = backend::create_backend(config).await?;
        let store = LedgerStore::new(backend, DayClock::new(config.offset()?));
        Ok(Self::new(store, config))
    }

    /// Replace the time source (used to exercise day rollover).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Configured daily limit used when a call passes `None`.
    pub fn default_limit(&self) -> i64 {
        self.limits().daily_limit
    }

    /// Swap in new limits from a reloaded config. The store and day zone are
    /// fixed for the accountant's lifetime.
    pub fn apply_config(&self, config: &LedgerConfig) {
        let mut guard = self.limits.write().unwrap_or_else(|e| e.into_inner());
        if guard.daily_limit != config.daily_limit {
            debug!(
                old = guard.daily_limit,
                new = config.daily_limit,
                "Daily limit updated"
            );
        }
        *guard = Limits::from(config);
    }

    /// Apply every config delivered on `rx` (typically by a
    /// [`ConfigWatcher`](crate::config::ConfigWatcher)) until the sender is
    /// dropped.
    pub fn follow_config(
        &self,
        mut rx: mpsc::UnboundedReceiver<LedgerConfig>,
    ) -> tokio::task::JoinHandle<()> {
        let accountant = self.clone();
        tokio::spawn(async move {
            while let Some(config) = rx.recv().await {
                accountant.apply_config(&config);
                info!(daily_limit = config.daily_limit, "Applied reloaded ledger config");
            }
        })
    }

    /// Evaluate today's standing for `subject_id` without consuming anything.
    ///
    /// Creates today's record if it does not exist yet.
    pub async fn check_quota(
        &self,
        subject_id: &str,
        daily_limit: Option<i64>,
    ) -> Result<QuotaStatus> {
        let limits = self.resolve(daily_limit);
        let record = self
            .store
            .get_or_create_daily(subject_id, self.clock.now())
            .await?;
        let status = QuotaStatus::evaluate(record, limits.daily_limit, limits.warning_threshold);

        match status.level {
            QuotaLevel::Exhausted => debug!(
                subject = %subject_id,
                consumed = status.record.consumed_units,
                limit = limits.daily_limit,
                "Quota check denied"
            ),
            QuotaLevel::Warning(fraction) => debug!(
                subject = %subject_id,
                utilisation = %format!("{:.0}%", fraction * 100.0),
                "Quota check near limit"
            ),
            QuotaLevel::Ok => {}
        }
        Ok(status)
    }

    /// Account `units_consumed` to `subject_id` for today and return the
    /// post-consumption standing.
    pub async fn record_consumption(
        &self,
        subject_id: &str,
        units_consumed: u64,
        daily_limit: Option<i64>,
    ) -> Result<QuotaStatus> {
        let limits = self.resolve(daily_limit);
        let record = self
            .store
            .increment_usage(subject_id, self.clock.now(), units_consumed)
            .await?;
        let before = record.consumed_units.saturating_sub(units_consumed);
        let status = QuotaStatus::evaluate(record, limits.daily_limit, limits.warning_threshold);

        let crossed =
            |threshold: u64| before < threshold && status.record.consumed_units >= threshold;
        if limits.daily_limit > 0 {
            let limit = limits.daily_limit as u64;
            if crossed(limit) {
                warn!(
                    subject = %subject_id,
                    consumed = status.record.consumed_units,
                    limit = limits.daily_limit,
                    "Daily quota exhausted"
                );
            } else if let QuotaLevel::Warning(fraction) = status.level {
                let warn_at = (limits.warning_threshold * limit as f64).ceil() as u64;
                if crossed(warn_at) {
                    warn!(
                        subject = %subject_id,
                        utilisation = %format!("{:.0}%", fraction * 100.0),
                        "Daily quota warning: approaching limit"
                    );
                }
            }
        }
        Ok(status)
    }

    fn limits(&self) -> Limits {
        *self.limits.read().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, daily_limit: Option<i64>) -> Limits {
        let mut limits = self.limits();
        if let Some(limit) = daily_limit {
            limits.daily_limit = limit;
        }
        limits
    }
}

impl std::fmt::Debug for UsageAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAccountant")
            .field("store", &self.store)
            .field("daily_limit", &self.default_limit())
            .finish()
    }
}

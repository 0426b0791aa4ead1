//! Per-subject daily usage metering with soft quota enforcement.
//!
//! - [`ledger`]: race-safe storage of one [`ledger::UsageRecord`] per subject
//!   per canonical day, over a pluggable [`ledger::UsageBackend`].
//! - [`policy`]: pure limit, percentage, and remaining-units functions.
//! - [`accountant`]: the `check_quota` / `record_consumption` façade.
//! - [`guard`]: check → work → record with an explicit outage policy.
//! - [`config`]: limits, day zone, backend selection, hot reload.

pub mod accountant;
pub mod config;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod policy;

pub use accountant::{QuotaStatus, UsageAccountant};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use guard::{GuardError, Metered, OutagePolicy, QuotaGuard};
pub use ledger::{LedgerStore, UsageRecord};
pub use policy::{QuotaLevel, DEFAULT_DAILY_LIMIT};

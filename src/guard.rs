//! Check → work → record, with an explicit storage-outage policy.
//!
//! [`QuotaGuard`] wraps a unit of metered work the way request handlers are
//! expected to use the accountant: check quota first, reject without running
//! the work when exhausted, and account the actual cost afterwards. What to do
//! when the ledger itself is down is never defaulted; every guard is built
//! with an [`OutagePolicy`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

use crate::accountant::{QuotaStatus, UsageAccountant};
use crate::error::LedgerError;

/// What a guard does when the usage store cannot be reached during the
/// pre-work quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutagePolicy {
    /// Let the request through; usage during the outage may go unmetered.
    FailOpen,
    /// Reject the request with the underlying `StoreUnavailable` error.
    FailClosed,
}

/// Errors returned by [`QuotaGuard::run`].
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The subject has used up today's allowance; the work was not run.
    #[error("{subject} daily quota exceeded (limit {limit})")]
    QuotaExceeded { subject: String, limit: i64 },

    /// The ledger rejected the call (invalid input, or an outage under
    /// [`OutagePolicy::FailClosed`]).
    #[error(transparent)]
    Ledger(LedgerError),

    /// The wrapped work failed. Nothing was recorded.
    #[error("metered work failed: {0}")]
    Work(E),
}

/// Output of a metered operation.
#[derive(Debug, Clone)]
pub struct Metered<T> {
    pub output: T,
    /// Post-consumption standing, or `None` when zero units were reported or
    /// the store failed or timed out while recording (outcome unknown).
    pub status: Option<QuotaStatus>,
}

/// Caller-side wrapper around [`UsageAccountant`].
#[derive(Clone)]
pub struct QuotaGuard {
    accountant: UsageAccountant,
    outage: OutagePolicy,
    timeout: Option<Duration>,
    daily_limit: Option<i64>,
}

impl QuotaGuard {
    pub fn new(accountant: UsageAccountant, outage: OutagePolicy) -> Self {
        Self {
            accountant,
            outage,
            timeout: None,
            daily_limit: None,
        }
    }

    /// Bound each ledger call. An elapsed timeout counts as
    /// `StoreUnavailable`.
    ///
    /// Timing out only abandons the wait. A backend write already handed to
    /// storage may still commit, so after a record-side timeout the
    /// consumption may or may not have been accounted.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use `daily_limit` instead of the accountant's configured limit.
    pub fn with_daily_limit(mut self, daily_limit: i64) -> Self {
        self.daily_limit = Some(daily_limit);
        self
    }

    pub fn outage_policy(&self) -> OutagePolicy {
        self.outage
    }

    /// Run `work` for `subject` if quota allows.
    ///
    /// `work` returns its output together with the units it actually
    /// consumed. Zero units records nothing.
    pub async fn run<T, E, F, Fut>(
        &self,
        subject: &str,
        work: F,
    ) -> Result<Metered<T>, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, u64), E>>,
    {
        match self
            .bounded(self.accountant.check_quota(subject, self.daily_limit))
            .await
        {
            Ok(status) if !status.allowed => {
                return Err(GuardError::QuotaExceeded {
                    subject: subject.to_string(),
                    limit: status.daily_limit,
                });
            }
            Ok(_) => {}
            Err(e) if e.is_store_unavailable() => match self.outage {
                OutagePolicy::FailOpen => {
                    warn!(
                        subject = %subject,
                        error = %e,
                        "Usage store unavailable (fail-open): allowing request through"
                    );
                }
                OutagePolicy::FailClosed => return Err(GuardError::Ledger(e)),
            },
            Err(e) => return Err(GuardError::Ledger(e)),
        }

        let (output, units) = work().await.map_err(GuardError::Work)?;
        if units == 0 {
            return Ok(Metered {
                output,
                status: None,
            });
        }

        let status = match self
            .bounded(
                self.accountant
                    .record_consumption(subject, units, self.daily_limit),
            )
            .await
        {
            Ok(status) => Some(status),
            // The work already happened; dropping its output would not undo it.
            Err(e) if e.is_store_unavailable() => {
                error!(
                    subject = %subject,
                    units,
                    error = %e,
                    "Usage store unavailable: consumption outcome unknown"
                );
                None
            }
            Err(e) => return Err(GuardError::Ledger(e)),
        };
        Ok(Metered { output, status })
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = crate::error::Result<T>>,
    ) -> crate::error::Result<T> {
        match self.timeout {
            None => fut.await,
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                LedgerError::StoreUnavailable(format!(
                    "usage store call timed out after {}ms",
                    limit.as_millis()
                ))
            })?,
        }
    }
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("outage", &self.outage)
            .field("timeout", &self.timeout)
            .finish()
    }
}

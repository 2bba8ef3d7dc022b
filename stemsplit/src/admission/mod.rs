//! Admission control: credential, per-client rate and concurrent-job quota.
//!
//! Checks run in that order and stop at the first rejection. A successful
//! admission yields a [`QuotaReservation`] the caller either commits to a new
//! job or drops to give the slot back.

mod credential;
mod quota;
mod rate_limiter;

pub use credential::CredentialVerifier;
pub use quota::{QuotaLedger, QuotaReservation};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};

use std::sync::Arc;

use tracing::debug;

use crate::config::AppConfig;
use crate::{Error, Result};

/// Gatekeeper for job submissions.
#[derive(Debug)]
pub struct AdmissionController {
    verifier: CredentialVerifier,
    rate_limiter: RateLimiter,
    quota: Arc<QuotaLedger>,
}

impl AdmissionController {
    pub fn new(verifier: CredentialVerifier, rate_limiter: RateLimiter, quota: Arc<QuotaLedger>) -> Self {
        Self {
            verifier,
            rate_limiter,
            quota,
        }
    }

    pub fn from_config(config: &AppConfig, quota: Arc<QuotaLedger>) -> Self {
        Self::new(
            CredentialVerifier::new(&config.api_key),
            RateLimiter::new(RateLimiterConfig {
                max_requests: config.rate_limit_per_minute,
                window: config.rate_limit_window,
            }),
            quota,
        )
    }

    /// Validate the credential only (used by read-only admin endpoints).
    pub fn authenticate(&self, credential: Option<&str>) -> Result<()> {
        self.verifier.verify(credential)
    }

    /// Admit a submission from `client`, reserving one quota slot.
    pub fn admit(&self, client: &str, credential: Option<&str>) -> Result<QuotaReservation> {
        self.verifier.verify(credential)?;

        self.rate_limiter
            .try_acquire(client)
            .map_err(|retry_after| Error::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            })?;

        let reservation = self
            .quota
            .try_reserve(client)
            .ok_or(Error::QuotaExceeded {
                limit: self.quota.max_active(),
            })?;

        debug!(client, "Submission admitted");
        Ok(reservation)
    }

    pub fn quota(&self) -> &Arc<QuotaLedger> {
        &self.quota
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}

//! Per-organization send gating.
//!
//! Quota state (hourly/daily counters) lives in the shared store and is
//! authoritative across worker nodes. The minimum inter-send interval is
//! tracked in a process-local map: it only sees this process's sends, so
//! across multiple nodes it is advisory smoothing, not a guarantee.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};

use mailroom_core::OrganizationId;
use mailroom_delivery::rate_limit::{self, RateLimitConfig, RateLimitDecision};

use crate::store::{JobStoreError, RateLimitStore};

/// Gate deciding whether an organization may send right now.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    default_limits: RateLimitConfig,
    org_limits: HashMap<OrganizationId, RateLimitConfig>,
    last_send: Mutex<HashMap<OrganizationId, Instant>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, default_limits: RateLimitConfig) -> Self {
        Self {
            store,
            default_limits,
            org_limits: HashMap::new(),
            last_send: Mutex::new(HashMap::new()),
        }
    }

    /// Override the limits for one organization.
    pub fn with_org_limits(mut self, organization_id: OrganizationId, limits: RateLimitConfig) -> Self {
        self.org_limits.insert(organization_id, limits);
        self
    }

    fn limits_for(&self, organization_id: OrganizationId) -> &RateLimitConfig {
        self.org_limits
            .get(&organization_id)
            .unwrap_or(&self.default_limits)
    }

    /// Check whether the organization may send one more message at `now`.
    ///
    /// Reads counter usage from the store on every call: limits may have
    /// been consumed since a batch was claimed, including by other nodes.
    pub async fn check(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, JobStoreError> {
        let usage = self.store.usage(organization_id, now).await?;
        let since_last_send = self
            .last_send
            .lock()
            .unwrap()
            .get(&organization_id)
            .map(Instant::elapsed);
        Ok(rate_limit::evaluate(
            self.limits_for(organization_id),
            usage,
            since_last_send,
            1,
        ))
    }

    /// Record an attempt outcome. Both success and failure consume quota;
    /// deferrals never reach this point. Only successful sends move the
    /// minimum-interval clock.
    pub async fn record_outcome(
        &self,
        organization_id: OrganizationId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.store
            .record_outcome(organization_id, success, at)
            .await?;
        if success {
            self.last_send
                .lock()
                .unwrap()
                .insert(organization_id, Instant::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::in_memory::InMemoryStore;
    use mailroom_delivery::DeferralReason;
    use std::time::Duration;

    fn limiter(hourly: u32, daily: u32) -> (RateLimiter, Arc<InMemoryStore>) {
        let store = InMemoryStore::arc();
        let limiter = RateLimiter::new(
            store.clone(),
            RateLimitConfig {
                hourly_limit: hourly,
                daily_limit: daily,
                min_send_interval: Duration::ZERO,
            },
        );
        (limiter, store)
    }

    #[tokio::test]
    async fn blocks_once_hourly_quota_is_used() {
        let (limiter, _store) = limiter(3, 100);
        let org = OrganizationId::new();
        let now = Utc::now();

        for _ in 0..3 {
            assert!(limiter.check(org, now).await.unwrap().can_send);
            limiter.record_outcome(org, true, now).await.unwrap();
        }

        let decision = limiter.check(org, now).await.unwrap();
        assert!(!decision.can_send);
        assert!(matches!(
            decision.reason,
            Some(DeferralReason::HourlyQuotaExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn failures_consume_quota_too() {
        let (limiter, _store) = limiter(2, 100);
        let org = OrganizationId::new();
        let now = Utc::now();

        limiter.record_outcome(org, false, now).await.unwrap();
        limiter.record_outcome(org, false, now).await.unwrap();

        assert!(!limiter.check(org, now).await.unwrap().can_send);
    }

    #[tokio::test]
    async fn min_interval_is_tracked_per_process() {
        let store = InMemoryStore::arc();
        let limiter = RateLimiter::new(
            store,
            RateLimitConfig {
                hourly_limit: 100,
                daily_limit: 100,
                min_send_interval: Duration::from_secs(30),
            },
        );
        let org = OrganizationId::new();
        let now = Utc::now();

        // Nothing sent yet from this process: no interval to wait out.
        assert!(limiter.check(org, now).await.unwrap().can_send);

        limiter.record_outcome(org, true, now).await.unwrap();
        let decision = limiter.check(org, now).await.unwrap();
        assert!(!decision.can_send);
        assert!(matches!(
            decision.reason,
            Some(DeferralReason::MinIntervalNotElapsed { .. })
        ));

        // Another organization is unaffected.
        assert!(limiter.check(OrganizationId::new(), now).await.unwrap().can_send);
    }

    #[tokio::test]
    async fn per_org_overrides_take_precedence() {
        let store = InMemoryStore::arc();
        let strict = OrganizationId::new();
        let limiter = RateLimiter::new(
            store,
            RateLimitConfig {
                hourly_limit: 100,
                daily_limit: 1000,
                min_send_interval: Duration::ZERO,
            },
        )
        .with_org_limits(
            strict,
            RateLimitConfig {
                hourly_limit: 1,
                daily_limit: 1000,
                min_send_interval: Duration::ZERO,
            },
        );
        let now = Utc::now();

        limiter.record_outcome(strict, true, now).await.unwrap();
        assert!(!limiter.check(strict, now).await.unwrap().can_send);
        assert!(limiter.check(OrganizationId::new(), now).await.unwrap().can_send);
    }
}

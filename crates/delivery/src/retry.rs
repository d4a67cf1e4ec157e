//! Retry policy: backoff computation and the terminal-failure decision.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;

/// Backoff policy: maps a retry index to a delay.
///
/// The default is a delay table (5, 15, 60 minutes) that stays flat at its
/// last entry for any further retries. Fixed and exponential variants exist
/// for callers that configure their own behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum BackoffPolicy {
    /// Delay table indexed by retry count; flat at the last entry beyond it.
    Table { delays: Vec<Duration> },
    /// Constant delay between retries.
    Fixed { delay: Duration },
    /// `base * 2^retry_count`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Table {
            delays: vec![
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(60 * 60),
            ],
        }
    }
}

impl BackoffPolicy {
    pub fn table(delays: Vec<Duration>) -> Self {
        Self::Table { delays }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential { base, max }
    }

    /// Delay before the retry following failure number `retry_count`
    /// (0-indexed: the first failure looks up index 0).
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        match self {
            Self::Table { delays } => {
                if delays.is_empty() {
                    return Duration::ZERO;
                }
                let idx = (retry_count as usize).min(delays.len() - 1);
                delays[idx]
            }
            Self::Fixed { delay } => *delay,
            Self::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(retry_count.min(31));
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// Outcome of a failed send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retriable: return to pending, due at the given time.
    Reschedule { at: DateTime<Utc> },
    /// Retries exhausted: terminal failure.
    Terminal,
}

/// Decides what happens to a job after a transport failure.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: BackoffPolicy,
}

impl RetryManager {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Decide the outcome for `job` failing at `now`.
    ///
    /// Jobs with `retry_count < max_retries` are rescheduled with backoff
    /// indexed by the failure count so far; the rest are terminal.
    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> RetryDecision {
        if !job.retries_remaining() {
            return RetryDecision::Terminal;
        }
        let delay = self.policy.delay_for_retry(job.retry_count);
        let at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(24));
        RetryDecision::Reschedule { at }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EmailContent, NewJob, Recipient};
    use mailroom_core::{CampaignId, OrganizationId};

    fn job_with_retries(retry_count: u32, max_retries: u32) -> Job {
        let now = Utc::now();
        let mut job = Job::create(
            NewJob {
                campaign_id: CampaignId::new(),
                organization_id: OrganizationId::new(),
                recipient: Recipient::new("lead@example.com"),
                content: EmailContent::new("Hello"),
                scheduled_for: now,
                priority: 0,
                max_retries,
            },
            now,
        );
        job.retry_count = retry_count;
        job
    }

    #[test]
    fn default_table_and_flat_fallback() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(300));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(900));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(3600));
        // Flat beyond the table.
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(3600));
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(3600));
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(30));
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_retry(7), Duration::from_secs(30));
    }

    #[test]
    fn exponential_policy_doubles_and_caps() {
        let policy =
            BackoffPolicy::exponential(Duration::from_secs(60), Duration::from_secs(600));
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(240));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(480));
        assert_eq!(policy.delay_for_retry(4), Duration::from_secs(600));
        assert_eq!(policy.delay_for_retry(20), Duration::from_secs(600));
    }

    #[test]
    fn reschedules_while_retries_remain() {
        let manager = RetryManager::default();
        let now = Utc::now();

        let job = job_with_retries(0, 3);
        match manager.decide(&job, now) {
            RetryDecision::Reschedule { at } => {
                assert_eq!(at, now + chrono::Duration::minutes(5));
            }
            RetryDecision::Terminal => panic!("first failure must reschedule"),
        }

        let job = job_with_retries(2, 3);
        match manager.decide(&job, now) {
            RetryDecision::Reschedule { at } => {
                assert_eq!(at, now + chrono::Duration::minutes(60));
            }
            RetryDecision::Terminal => panic!("third failure must reschedule"),
        }
    }

    #[test]
    fn terminal_at_the_cap() {
        let manager = RetryManager::default();
        let now = Utc::now();

        let job = job_with_retries(3, 3);
        assert_eq!(manager.decide(&job, now), RetryDecision::Terminal);

        let job = job_with_retries(0, 0);
        assert_eq!(manager.decide(&job, now), RetryDecision::Terminal);
    }
}

//! Rate-limit windows and the per-organization send decision.
//!
//! The decision math is pure: counter lookups and the process-local
//! last-send tracking live in `mailroom-infra`, which feeds snapshots in.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use mailroom_core::OrganizationId;

/// Quota bucket key for an organization.
pub fn organization_rate_limit_key(organization_id: OrganizationId) -> String {
    format!("org:{organization_id}")
}

/// Fixed time bucket used to cap an organization's send volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Hour,
    Day,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    /// Start of the bucket containing `at`.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let truncated = match self {
            Self::Hour => date.and_hms_opt(at.hour(), 0, 0),
            Self::Day => date.and_hms_opt(0, 0, 0),
        };
        // Truncation of a valid timestamp is always representable.
        truncated.map(|n| n.and_utc()).unwrap_or(at)
    }

    pub fn length(&self) -> chrono::Duration {
        match self {
            Self::Hour => chrono::Duration::hours(1),
            Self::Day => chrono::Duration::days(1),
        }
    }
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn default_hourly_limit() -> u32 {
    100
}

const fn default_daily_limit() -> u32 {
    1000
}

const fn default_min_send_interval() -> Duration {
    Duration::from_secs(2)
}

/// Per-organization throughput limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sends allowed per trailing hour.
    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: u32,

    /// Sends allowed per trailing day.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,

    /// Minimum spacing between two sends for the same organization,
    /// enforced even with quota remaining.
    #[serde(default = "default_min_send_interval")]
    pub min_send_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_limit: default_hourly_limit(),
            daily_limit: default_daily_limit(),
            min_send_interval: default_min_send_interval(),
        }
    }
}

/// Counter usage observed for an organization at decision time.
///
/// Both successful and failed attempts count toward usage; rate-limit
/// deferrals do not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub hourly_used: u64,
    pub daily_used: u64,
}

/// Why a send was deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferralReason {
    HourlyQuotaExhausted { used: u64, limit: u32 },
    DailyQuotaExhausted { used: u64, limit: u32 },
    MinIntervalNotElapsed { wait: Duration },
}

impl std::fmt::Display for DeferralReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HourlyQuotaExhausted { used, limit } => {
                write!(f, "hourly quota exhausted ({used}/{limit})")
            }
            Self::DailyQuotaExhausted { used, limit } => {
                write!(f, "daily quota exhausted ({used}/{limit})")
            }
            Self::MinIntervalNotElapsed { wait } => {
                write!(f, "minimum send interval not elapsed (wait {wait:?})")
            }
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub can_send: bool,
    pub reason: Option<DeferralReason>,
}

impl RateLimitDecision {
    pub fn allowed() -> Self {
        Self {
            can_send: true,
            reason: None,
        }
    }

    pub fn deferred(reason: DeferralReason) -> Self {
        Self {
            can_send: false,
            reason: Some(reason),
        }
    }
}

/// Evaluate whether `requested` further sends fit the organization's limits.
///
/// The hourly and daily checks are independent; either can block. The
/// minimum-interval check applies even with quota remaining, to smooth
/// bursts.
pub fn evaluate(
    config: &RateLimitConfig,
    usage: UsageSnapshot,
    since_last_send: Option<Duration>,
    requested: u64,
) -> RateLimitDecision {
    if usage.hourly_used + requested > u64::from(config.hourly_limit) {
        return RateLimitDecision::deferred(DeferralReason::HourlyQuotaExhausted {
            used: usage.hourly_used,
            limit: config.hourly_limit,
        });
    }

    if usage.daily_used + requested > u64::from(config.daily_limit) {
        return RateLimitDecision::deferred(DeferralReason::DailyQuotaExhausted {
            used: usage.daily_used,
            limit: config.daily_limit,
        });
    }

    if let Some(elapsed) = since_last_send {
        if elapsed < config.min_send_interval {
            return RateLimitDecision::deferred(DeferralReason::MinIntervalNotElapsed {
                wait: config.min_send_interval - elapsed,
            });
        }
    }

    RateLimitDecision::allowed()
}

//! Schedule computation for immediate and multi-day campaigns.
//!
//! Everything here is pure and deterministic given identical inputs (same
//! recipient order, rate, window), which is what makes the factory's output
//! reproducible in tests.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use mailroom_core::{CampaignId, DomainError, DomainResult};

/// How a campaign's jobs were scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Staggered from creation time (or burst for mass email).
    Immediate,
    /// Distributed over calendar days inside a business-hours window.
    Scheduled,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(Self::Immediate),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }
}

/// Per-campaign schedule configuration, one row per campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSchedule {
    pub campaign_id: CampaignId,
    pub kind: ScheduleKind,
    pub window_start: Option<NaiveTime>,
    pub window_end: Option<NaiveTime>,
    /// UTC offset of the sending window, `±HH:MM`.
    pub timezone: String,
    pub daily_limit: Option<u32>,
    pub hourly_limit: u32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl CampaignSchedule {
    pub fn immediate(campaign_id: CampaignId, hourly_limit: u32) -> Self {
        Self {
            campaign_id,
            kind: ScheduleKind::Immediate,
            window_start: None,
            window_end: None,
            timezone: "+00:00".to_string(),
            daily_limit: None,
            hourly_limit,
            start_date: None,
            end_date: None,
        }
    }

    pub fn scheduled(
        campaign_id: CampaignId,
        spec: &DailyPlanSpec,
        timezone: impl Into<String>,
        hourly_limit: u32,
    ) -> Self {
        Self {
            campaign_id,
            kind: ScheduleKind::Scheduled,
            window_start: Some(spec.window_start),
            window_end: Some(spec.window_end),
            timezone: timezone.into(),
            daily_limit: Some(spec.daily_limit),
            hourly_limit,
            start_date: Some(spec.start_date),
            end_date: spec.end_date,
        }
    }
}

/// Parse a `±HH:MM` UTC offset (also accepts `Z` and `UTC`).
pub fn parse_utc_offset(s: &str) -> DomainResult<FixedOffset> {
    let bad = || DomainError::validation(format!("invalid UTC offset: {s:?} (expected ±HH:MM)"));

    if s == "Z" || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(bad);
    }

    let (sign, rest) = match s.split_at_checked(1) {
        Some(("+", rest)) => (1i32, rest),
        Some(("-", rest)) => (-1i32, rest),
        _ => return Err(bad()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(bad)?;
    let hours: i32 = hours.parse().map_err(|_| bad())?;
    let minutes: i32 = minutes.parse().map_err(|_| bad())?;
    if hours > 23 || minutes > 59 {
        return Err(bad());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

/// Evenly staggered slots: one send every `3_600_000 / hourly_rate` ms.
pub fn stagger(
    now: DateTime<Utc>,
    count: usize,
    hourly_rate: u32,
) -> DomainResult<Vec<DateTime<Utc>>> {
    if hourly_rate == 0 {
        return Err(DomainError::validation("hourly rate must be positive"));
    }
    let interval_ms = 3_600_000 / i64::from(hourly_rate);
    Ok((0..count)
        .map(|i| now + chrono::Duration::milliseconds(interval_ms * i as i64))
        .collect())
}

/// Burst slots: everything due immediately (mass-email mode).
pub fn burst(now: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
    vec![now; count]
}

/// Inputs for a multi-day plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyPlanSpec {
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    /// UTC offset the window times are expressed in.
    pub offset: FixedOffset,
    pub daily_limit: u32,
}

/// A computed multi-day plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyPlan {
    /// One UTC slot per scheduled recipient, in recipient order.
    pub slots: Vec<DateTime<Utc>>,
    /// Recipients that did not fit before `end_date` passed.
    pub skipped: usize,
}

impl DailyPlan {
    pub fn is_complete(&self) -> bool {
        self.skipped == 0
    }
}

/// Distribute `recipients` sends across calendar days.
///
/// Each day takes up to `min(daily_limit, recipients)` sends spaced
/// `window / emails_per_day` apart inside the window, walking forward one
/// day at a time from `start_date` until recipients are exhausted or
/// `end_date` is passed. Leftover recipients are reported, not scheduled.
pub fn daily_plan(spec: &DailyPlanSpec, recipients: usize) -> DomainResult<DailyPlan> {
    if spec.window_end <= spec.window_start {
        return Err(DomainError::validation(
            "window end must be after window start",
        ));
    }
    if spec.daily_limit == 0 {
        return Err(DomainError::validation("daily limit must be positive"));
    }
    if recipients == 0 {
        return Ok(DailyPlan {
            slots: Vec::new(),
            skipped: 0,
        });
    }

    let window_secs = (spec.window_end - spec.window_start).num_seconds();
    let emails_per_day = (spec.daily_limit as usize).min(recipients);
    let interval_secs = window_secs / emails_per_day as i64;

    let mut slots = Vec::with_capacity(recipients);
    let mut day = spec.start_date;
    while slots.len() < recipients {
        if let Some(end) = spec.end_date {
            if day > end {
                break;
            }
        }

        let remaining = recipients - slots.len();
        for i in 0..emails_per_day.min(remaining) {
            let local = day.and_time(spec.window_start)
                + chrono::Duration::seconds(interval_secs * i as i64);
            let slot = spec
                .offset
                .from_local_datetime(&local)
                .single()
                .ok_or_else(|| DomainError::validation("unrepresentable local time"))?;
            slots.push(slot.with_timezone(&Utc));
        }

        day = day
            .succ_opt()
            .ok_or_else(|| DomainError::validation("calendar overflow"))?;
    }

    let skipped = recipients - slots.len();
    Ok(DailyPlan { slots, skipped })
}

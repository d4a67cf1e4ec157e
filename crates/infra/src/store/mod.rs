//! Job and rate-limit persistence abstractions.
//!
//! The store is the single coordination point between worker nodes: the
//! claim operation is atomic, and every status transition is conditional on
//! the current status so that a repeated update cannot apply twice.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mailroom_core::{CampaignId, OrganizationId};
use mailroom_delivery::{CampaignSchedule, Job, JobId, UsageSnapshot};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-campaign job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CampaignJobStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl CampaignJobStats {
    /// Share of jobs in a terminal state, in percent.
    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let terminal = self.sent + self.failed + self.cancelled;
        terminal as f64 / self.total as f64 * 100.0
    }
}

/// Filter for listing terminally failed jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailedJobsQuery {
    pub campaign_id: Option<CampaignId>,
    pub organization_id: Option<OrganizationId>,
    pub limit: Option<usize>,
}

impl FailedJobsQuery {
    pub fn for_campaign(campaign_id: CampaignId) -> Self {
        Self {
            campaign_id: Some(campaign_id),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// What happened to a job, for the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    Claimed,
    Released,
    Sent,
    RetryScheduled,
    Failed,
    Cancelled,
    Requeued,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Claimed => "claimed",
            Self::Released => "released",
            Self::Sent => "sent",
            Self::RetryScheduled => "retry_scheduled",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Requeued => "requeued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "claimed" => Some(Self::Claimed),
            "released" => Some(Self::Released),
            "sent" => Some(Self::Sent),
            "retry_scheduled" => Some(Self::RetryScheduled),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "requeued" => Some(Self::Requeued),
            _ => None,
        }
    }
}

/// One row of the append-only job audit log.
///
/// Written by the store implementations inside the same transaction as the
/// transition it records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub job_id: JobId,
    pub campaign_id: CampaignId,
    pub kind: JobEventKind,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn record(
        job_id: JobId,
        campaign_id: CampaignId,
        kind: JobEventKind,
        detail: Option<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            campaign_id,
            kind,
            detail,
            recorded_at,
        }
    }
}

/// A status update routed through the conditional transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Sent,
    Retry { at: DateTime<Utc>, error: String },
    Failed { error: String },
    Cancelled,
    Released,
}

/// Persistence for jobs, per-campaign schedule config, and the audit log.
///
/// Transition methods return whether the transition **applied**: `false`
/// means the job was not in the required source status (already resolved,
/// raced by another caller, or past its retry cap). Callers must only act on
/// applied transitions; this is what makes outcome handling idempotent.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a batch of new jobs in one transaction (all-or-nothing for
    /// the batch). Callers bound transaction size by chunking.
    async fn insert_jobs(&self, jobs: &[Job]) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim up to `limit` due pending jobs for `node`.
    ///
    /// Selects rows with `status = pending` and `scheduled_for <= now`,
    /// ordered by `priority DESC, scheduled_for ASC`, marks them
    /// `processing` with `processing_node = node`, and returns them in claim
    /// order. Two concurrent callers never receive the same job.
    async fn claim_due(
        &self,
        limit: usize,
        node: &str,
        organization_id: Option<OrganizationId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Return claimed jobs to `pending` without retry penalty (rate-limit
    /// deferral). Returns how many were released.
    async fn release(&self, job_ids: &[JobId], now: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// `processing -> sent`. Returns whether the transition applied.
    async fn mark_sent(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// `processing -> pending` with `retry_count + 1`, due at `at`.
    /// Applies only while `retry_count < max_retries`.
    async fn schedule_retry(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// `processing -> failed` (terminal). Returns whether it applied.
    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// `pending -> cancelled`. A job already claimed cannot be cancelled.
    /// Returns whether it applied.
    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    /// Cancel all still-pending jobs of a campaign. Jobs already claimed or
    /// resolved are untouched. Returns how many were cancelled.
    async fn cancel_pending(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    /// Crash recovery: return `processing` jobs untouched since
    /// `stuck_since` to `pending` (their node died). No retry penalty.
    async fn requeue_stale(
        &self,
        stuck_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    /// Administrative: move a terminally failed job back to `pending` with
    /// its retry budget reset. Never happens automatically.
    async fn retry_failed_job(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Per-status job counts for a campaign.
    async fn campaign_stats(
        &self,
        campaign_id: CampaignId,
    ) -> Result<CampaignJobStats, JobStoreError>;

    /// List terminally failed jobs, most recently failed first.
    async fn failed_jobs(&self, query: FailedJobsQuery) -> Result<Vec<Job>, JobStoreError>;

    /// Create or replace the schedule row for a campaign.
    async fn upsert_schedule(&self, schedule: &CampaignSchedule) -> Result<(), JobStoreError>;

    /// Get the schedule row for a campaign.
    async fn get_schedule(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSchedule>, JobStoreError>;

    /// Audit log for a job, oldest first.
    async fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, JobStoreError>;

    /// Apply an externally requested status update through the conditional
    /// transitions. Returns whether it applied; repeating the same update
    /// is a no-op.
    async fn update_status(
        &self,
        job_id: JobId,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        match update {
            StatusUpdate::Sent => self.mark_sent(job_id, now).await,
            StatusUpdate::Retry { at, error } => {
                self.schedule_retry(job_id, at, &error, now).await
            }
            StatusUpdate::Failed { error } => self.mark_failed(job_id, &error, now).await,
            StatusUpdate::Cancelled => self.cancel_job(job_id, now).await,
            StatusUpdate::Released => Ok(self.release(&[job_id], now).await? > 0),
        }
    }
}

/// Persistence for per-organization send counters.
///
/// Counters are bucketed by `(organization, window start, window kind)` and
/// updated only once a send attempt's outcome is known; deferrals never
/// count.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Record one attempt outcome in the hour and day buckets covering `at`.
    async fn record_outcome(
        &self,
        organization_id: OrganizationId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Attempts (sent + failed) counted in the buckets overlapping the
    /// trailing hour and day. Bucket granularity quantizes the window.
    async fn usage(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, JobStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_percentage_counts_terminal_states() {
        let stats = CampaignJobStats {
            total: 10,
            pending: 3,
            processing: 2,
            sent: 4,
            failed: 1,
            cancelled: 0,
        };
        assert!((stats.completion_percentage() - 50.0).abs() < f64::EPSILON);

        let empty = CampaignJobStats::default();
        assert!(empty.completion_percentage().abs() < f64::EPSILON);
    }

    #[test]
    fn event_kind_round_trips() {
        for kind in [
            JobEventKind::Created,
            JobEventKind::Claimed,
            JobEventKind::Released,
            JobEventKind::Sent,
            JobEventKind::RetryScheduled,
            JobEventKind::Failed,
            JobEventKind::Cancelled,
            JobEventKind::Requeued,
        ] {
            assert_eq!(JobEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobEventKind::parse("nope"), None);
    }
}

//! The job model: one scheduled send attempt to one recipient.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mailroom_core::{CampaignId, Entity, OrganizationId, RecipientId};

use crate::rate_limit::organization_rate_limit_key;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job execution status.
///
/// Transitions are monotonic: once a job reaches a terminal status it never
/// re-enters `Pending`. The retry path goes through `Processing` back to
/// `Pending` with `retry_count` incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to become due and be claimed.
    Pending,
    /// Claimed by a worker node.
    Processing,
    /// Delivered to the mail transport.
    Sent,
    /// Exhausted retries (terminal).
    Failed,
    /// Cancelled before being claimed (terminal).
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recipient of a campaign email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub email: String,
    pub name: Option<String>,
}

impl Recipient {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: RecipientId::new(),
            email: email.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Already-personalized email content.
///
/// Personalization of subject/body happens upstream; the map is carried for
/// audit only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailContent {
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    /// Resolved personalization variables, kept for audit.
    #[serde(default)]
    pub personalization: serde_json::Value,
}

impl EmailContent {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body_html: None,
            body_text: None,
            personalization: serde_json::Value::Null,
        }
    }

    pub fn with_html(mut self, body: impl Into<String>) -> Self {
        self.body_html = Some(body.into());
        self
    }

    pub fn with_text(mut self, body: impl Into<String>) -> Self {
        self.body_text = Some(body.into());
        self
    }

    pub fn with_personalization(mut self, data: serde_json::Value) -> Self {
        self.personalization = data;
        self
    }
}

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Priority assigned to staggered (non-burst) jobs.
pub const PRIORITY_DEFAULT: i32 = 0;

/// Priority assigned to mass-email (burst) jobs; claimed ahead of backlogs.
pub const PRIORITY_BURST: i32 = 10;

/// Inputs for creating one job; scheduling and identity are assigned by the
/// factory.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub campaign_id: CampaignId,
    pub organization_id: OrganizationId,
    pub recipient: Recipient,
    pub content: EmailContent,
    pub scheduled_for: DateTime<Utc>,
    pub priority: i32,
    pub max_retries: u32,
}

/// One scheduled send attempt to one recipient for one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub campaign_id: CampaignId,
    pub organization_id: OrganizationId,
    pub recipient_id: RecipientId,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub subject: String,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    /// Resolved personalization variables, audit only.
    pub personalization: serde_json::Value,
    /// When this attempt becomes due.
    pub scheduled_for: DateTime<Utc>,
    /// Higher is claimed sooner.
    pub priority: i32,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Claim owner; set while `Processing`.
    pub processing_node: Option<String>,
    /// Quota bucket key, derived from the organization.
    pub rate_limit_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Materialize a job from factory inputs.
    ///
    /// `scheduled_for` earlier than `now` is clamped to `now` so that
    /// `scheduled_for >= created_at` holds at creation time.
    pub fn create(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            campaign_id: new.campaign_id,
            organization_id: new.organization_id,
            recipient_id: new.recipient.id,
            recipient_email: new.recipient.email,
            recipient_name: new.recipient.name,
            subject: new.content.subject,
            body_html: new.content.body_html,
            body_text: new.content.body_text,
            personalization: new.content.personalization,
            scheduled_for: new.scheduled_for.max(now),
            priority: new.priority,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            last_error: None,
            processing_node: None,
            rate_limit_key: organization_rate_limit_key(new.organization_id),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this attempt is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }

    /// Whether the job can still be retried after a failure.
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Claim the job for a worker node. Applies only from `Pending`.
    pub fn mark_processing(&mut self, node: &str, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Processing;
        self.processing_node = Some(node.to_string());
        self.updated_at = now;
        true
    }

    /// Record successful delivery. Applies only from `Processing`.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Sent;
        self.processing_node = None;
        self.updated_at = now;
        true
    }

    /// Return the job to `Pending` for a later retry, with the failure
    /// recorded. Applies only from `Processing` while retries remain.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>, error: &str, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing || !self.retries_remaining() {
            return false;
        }
        self.status = JobStatus::Pending;
        self.scheduled_for = at;
        self.retry_count += 1;
        self.last_error = Some(error.to_string());
        self.processing_node = None;
        self.updated_at = now;
        true
    }

    /// Record terminal failure. Applies only from `Processing`.
    pub fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Failed;
        self.last_error = Some(error.to_string());
        self.processing_node = None;
        self.updated_at = now;
        true
    }

    /// Cancel the job. Applies only before it is claimed.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.processing_node = None;
        self.updated_at = now;
        true
    }

    /// Give a claimed job back without penalty (rate-limit deferral or
    /// stale-claim requeue). Applies only from `Processing`.
    pub fn release(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Pending;
        self.processing_node = None;
        self.updated_at = now;
        true
    }
}

impl Entity for Job {
    type Id = JobId;

    fn id(&self) -> &JobId {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job(now: DateTime<Utc>) -> Job {
        Job::create(
            NewJob {
                campaign_id: CampaignId::new(),
                organization_id: OrganizationId::new(),
                recipient: Recipient::new("lead@example.com").with_name("Lead"),
                content: EmailContent::new("Hello").with_text("hi"),
                scheduled_for: now,
                priority: PRIORITY_DEFAULT,
                max_retries: DEFAULT_MAX_RETRIES,
            },
            now,
        )
    }

    #[test]
    fn creation_clamps_scheduled_for() {
        let now = Utc::now();
        let mut new = NewJob {
            campaign_id: CampaignId::new(),
            organization_id: OrganizationId::new(),
            recipient: Recipient::new("lead@example.com"),
            content: EmailContent::new("Hello"),
            scheduled_for: now - chrono::Duration::minutes(5),
            priority: PRIORITY_DEFAULT,
            max_retries: DEFAULT_MAX_RETRIES,
        };
        let job = Job::create(new.clone(), now);
        assert_eq!(job.scheduled_for, now);
        assert_eq!(job.created_at, now);

        new.scheduled_for = now + chrono::Duration::minutes(5);
        let job = Job::create(new, now);
        assert_eq!(job.scheduled_for, now + chrono::Duration::minutes(5));
    }

    #[test]
    fn lifecycle_sent() {
        let now = Utc::now();
        let mut job = test_job(now);

        assert!(job.is_due(now));
        assert!(job.mark_processing("node-a", now));
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.processing_node.as_deref(), Some("node-a"));

        assert!(job.mark_sent(now));
        assert_eq!(job.status, JobStatus::Sent);
        assert!(job.processing_node.is_none());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn transitions_are_conditional() {
        let now = Utc::now();
        let mut job = test_job(now);

        // Not claimable twice.
        assert!(job.mark_processing("node-a", now));
        assert!(!job.mark_processing("node-b", now));

        // Sent applies exactly once.
        assert!(job.mark_sent(now));
        assert!(!job.mark_sent(now));

        // Terminal jobs never go back to pending.
        assert!(!job.release(now));
        assert!(!job.schedule_retry(now, "boom", now));
        assert!(!job.mark_cancelled(now));
    }

    #[test]
    fn retry_increments_until_cap() {
        let now = Utc::now();
        let mut job = test_job(now);
        let retry_at = now + chrono::Duration::minutes(5);

        for expected in 1..=job.max_retries {
            assert!(job.mark_processing("node-a", now));
            assert!(job.schedule_retry(retry_at, "timeout", now));
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.retry_count, expected);
            assert_eq!(job.scheduled_for, retry_at);
        }

        // Cap reached: retry no longer applies, terminal failure does.
        assert!(job.mark_processing("node-a", now));
        assert!(!job.schedule_retry(retry_at, "timeout", now));
        assert!(job.mark_failed("timeout", now));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
        assert_eq!(job.retry_count, job.max_retries);
    }

    #[test]
    fn cancel_applies_pre_claim_only() {
        let now = Utc::now();
        let mut job = test_job(now);
        assert!(job.mark_cancelled(now));
        assert_eq!(job.status, JobStatus::Cancelled);

        let mut job = test_job(now);
        assert!(job.mark_processing("node-a", now));
        assert!(!job.mark_cancelled(now));
    }

    #[test]
    fn release_returns_job_without_penalty() {
        let now = Utc::now();
        let mut job = test_job(now);
        assert!(job.mark_processing("node-a", now));
        assert!(job.release(now));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.processing_node.is_none());
    }

    #[test]
    fn status_round_trips_as_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Sent,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("unknown"), None);
    }
}

//! Bulk job creation: validation, schedule computation, chunked inserts.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use thiserror::Error;
use tracing::info;

use mailroom_core::{CampaignId, DomainError, DomainResult, OrganizationId};
use mailroom_delivery::job::{DEFAULT_MAX_RETRIES, PRIORITY_BURST, PRIORITY_DEFAULT};
use mailroom_delivery::schedule::{self, DailyPlanSpec};
use mailroom_delivery::{CampaignSchedule, EmailContent, Job, JobId, NewJob, Recipient};

use crate::store::{JobStore, JobStoreError};

/// Rows inserted per transaction; bounds transaction size on large lists.
const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Job creation error.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// Rejected before anything was persisted.
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// The store failed; the current chunk's transaction rolled back.
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// One recipient plus their already-personalized content.
#[derive(Debug, Clone)]
pub struct CampaignMessage {
    pub recipient: Recipient,
    pub content: EmailContent,
}

impl CampaignMessage {
    pub fn new(recipient: Recipient, content: EmailContent) -> Self {
        Self { recipient, content }
    }
}

/// Request for an immediate (staggered or burst) launch.
#[derive(Debug, Clone)]
pub struct ImmediateJobsRequest {
    pub campaign_id: CampaignId,
    pub organization_id: OrganizationId,
    pub messages: Vec<CampaignMessage>,
    /// Sends per hour when staggering.
    pub rate_limit: u32,
    /// Burst mode: everything due now at elevated priority.
    pub mass_email: bool,
    pub max_retries: u32,
}

impl ImmediateJobsRequest {
    pub fn new(
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        messages: Vec<CampaignMessage>,
        rate_limit: u32,
    ) -> Self {
        Self {
            campaign_id,
            organization_id,
            messages,
            rate_limit,
            mass_email: false,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn mass_email(mut self) -> Self {
        self.mass_email = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Result of an immediate launch.
#[derive(Debug, Clone)]
pub struct CreatedJobs {
    pub jobs_created: usize,
    pub job_ids: Vec<JobId>,
    pub estimated_completion: DateTime<Utc>,
}

/// Request for a multi-day scheduled launch.
#[derive(Debug, Clone)]
pub struct ScheduledJobsRequest {
    pub campaign_id: CampaignId,
    pub organization_id: OrganizationId,
    pub messages: Vec<CampaignMessage>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    /// UTC offset of the window, `±HH:MM`.
    pub timezone: String,
    pub daily_limit: u32,
    /// Persisted for dispatch-time quota enforcement.
    pub hourly_rate: u32,
    pub max_retries: u32,
}

/// Result of a scheduled launch.
#[derive(Debug, Clone)]
pub struct ScheduledJobs {
    pub jobs_created: usize,
    pub job_ids: Vec<JobId>,
    pub schedule: CampaignSchedule,
    /// Recipients that did not fit before `end_date`; not scheduled.
    pub recipients_skipped: usize,
}

/// Creates delivery jobs in bulk.
pub struct JobFactory {
    store: Arc<dyn JobStore>,
    chunk_size: usize,
}

impl JobFactory {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Create jobs that start sending right away.
    ///
    /// Staggered mode spaces sends `3_600_000 / rate_limit` ms apart at
    /// default priority; mass-email mode schedules everything at `now` with
    /// elevated priority (the organization is expected to carry a matching
    /// concurrency allowance).
    pub async fn create_immediate_jobs(
        &self,
        request: ImmediateJobsRequest,
    ) -> Result<CreatedJobs, FactoryError> {
        validate_messages(&request.messages)?;
        if !request.mass_email && request.rate_limit == 0 {
            return Err(DomainError::validation("rate limit must be positive").into());
        }

        let now = Utc::now();
        let count = request.messages.len();
        let (slots, priority) = if request.mass_email {
            (schedule::burst(now, count), PRIORITY_BURST)
        } else {
            (
                schedule::stagger(now, count, request.rate_limit)?,
                PRIORITY_DEFAULT,
            )
        };

        let jobs = build_jobs(&request.messages, &slots, &request, priority, now);
        let job_ids = self.insert_chunked(&jobs).await?;

        self.store
            .upsert_schedule(&CampaignSchedule::immediate(
                request.campaign_id,
                request.rate_limit,
            ))
            .await?;

        let estimated_completion = if request.mass_email {
            now
        } else {
            now + chrono::Duration::milliseconds(
                count as i64 * 3_600_000 / i64::from(request.rate_limit),
            )
        };

        info!(
            campaign_id = %request.campaign_id,
            organization_id = %request.organization_id,
            jobs_created = count,
            mass_email = request.mass_email,
            "created immediate delivery jobs"
        );

        Ok(CreatedJobs {
            jobs_created: count,
            job_ids,
            estimated_completion,
        })
    }

    /// Create jobs distributed over calendar days inside a sending window.
    ///
    /// Recipients that do not fit before `end_date` are reported in
    /// `recipients_skipped` and never persisted.
    pub async fn create_scheduled_jobs(
        &self,
        request: ScheduledJobsRequest,
    ) -> Result<ScheduledJobs, FactoryError> {
        validate_messages(&request.messages)?;

        let offset = schedule::parse_utc_offset(&request.timezone)?;
        let spec = DailyPlanSpec {
            start_date: request.start_date,
            end_date: request.end_date,
            window_start: request.window_start,
            window_end: request.window_end,
            offset,
            daily_limit: request.daily_limit,
        };
        let plan = schedule::daily_plan(&spec, request.messages.len())?;

        let now = Utc::now();
        let scheduled = &request.messages[..plan.slots.len()];
        let jobs = build_scheduled_jobs(scheduled, &plan.slots, &request, now);
        let job_ids = self.insert_chunked(&jobs).await?;

        let campaign_schedule = CampaignSchedule::scheduled(
            request.campaign_id,
            &spec,
            request.timezone.clone(),
            request.hourly_rate,
        );
        self.store.upsert_schedule(&campaign_schedule).await?;

        info!(
            campaign_id = %request.campaign_id,
            organization_id = %request.organization_id,
            jobs_created = jobs.len(),
            recipients_skipped = plan.skipped,
            "created scheduled delivery jobs"
        );

        Ok(ScheduledJobs {
            jobs_created: jobs.len(),
            job_ids,
            schedule: campaign_schedule,
            recipients_skipped: plan.skipped,
        })
    }

    async fn insert_chunked(&self, jobs: &[Job]) -> Result<Vec<JobId>, JobStoreError> {
        for chunk in jobs.chunks(self.chunk_size) {
            self.store.insert_jobs(chunk).await?;
        }
        Ok(jobs.iter().map(|j| j.id).collect())
    }
}

fn validate_messages(messages: &[CampaignMessage]) -> DomainResult<()> {
    if messages.is_empty() {
        return Err(DomainError::validation("recipient list is empty"));
    }
    for (index, message) in messages.iter().enumerate() {
        let email = message.recipient.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(DomainError::validation(format!(
                "recipient {index} has no valid email address"
            )));
        }
        if message.content.subject.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "recipient {index} has an empty subject"
            )));
        }
    }
    Ok(())
}

fn build_jobs(
    messages: &[CampaignMessage],
    slots: &[DateTime<Utc>],
    request: &ImmediateJobsRequest,
    priority: i32,
    now: DateTime<Utc>,
) -> Vec<Job> {
    messages
        .iter()
        .zip(slots)
        .map(|(message, slot)| {
            Job::create(
                NewJob {
                    campaign_id: request.campaign_id,
                    organization_id: request.organization_id,
                    recipient: message.recipient.clone(),
                    content: message.content.clone(),
                    scheduled_for: *slot,
                    priority,
                    max_retries: request.max_retries,
                },
                now,
            )
        })
        .collect()
}

fn build_scheduled_jobs(
    messages: &[CampaignMessage],
    slots: &[DateTime<Utc>],
    request: &ScheduledJobsRequest,
    now: DateTime<Utc>,
) -> Vec<Job> {
    messages
        .iter()
        .zip(slots)
        .map(|(message, slot)| {
            Job::create(
                NewJob {
                    campaign_id: request.campaign_id,
                    organization_id: request.organization_id,
                    recipient: message.recipient.clone(),
                    content: message.content.clone(),
                    scheduled_for: *slot,
                    priority: PRIORITY_DEFAULT,
                    max_retries: request.max_retries,
                },
                now,
            )
        })
        .collect()
}

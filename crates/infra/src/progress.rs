//! Propagates job outcomes onto campaign and recipient aggregates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use mailroom_delivery::Job;

use crate::repository::{
    CampaignRepository, RecipientOutcome, RecipientRepository, RepositoryError,
};

/// Applies per-job outcomes to the campaign counters and the recipient's
/// delivery record.
///
/// Callers must invoke this only for transitions the store reported as
/// applied; that attribution by (campaign, job) is what keeps a repeated
/// outcome event from double-counting.
#[derive(Clone)]
pub struct ProgressTracker {
    campaigns: Arc<dyn CampaignRepository>,
    recipients: Arc<dyn RecipientRepository>,
}

impl ProgressTracker {
    pub fn new(
        campaigns: Arc<dyn CampaignRepository>,
        recipients: Arc<dyn RecipientRepository>,
    ) -> Self {
        Self {
            campaigns,
            recipients,
        }
    }

    /// Record a delivered job: campaign sent counter + recipient record.
    pub async fn job_sent(&self, job: &Job, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        self.campaigns.record_sent(job.campaign_id).await?;
        self.recipients
            .record_delivery(
                job.campaign_id,
                job.recipient_id,
                RecipientOutcome::Sent { at },
            )
            .await
    }

    /// Record a terminally failed job: campaign failed counter + recipient
    /// record with the final error.
    pub async fn job_failed(&self, job: &Job, error: &str) -> Result<(), RepositoryError> {
        self.campaigns.record_failed(job.campaign_id).await?;
        self.recipients
            .record_delivery(
                job.campaign_id,
                job.recipient_id,
                RecipientOutcome::Failed {
                    error: error.to_string(),
                },
            )
            .await
    }

    /// Best-effort variant used inside the dispatch loop: progress updates
    /// must not fail the tick, so errors are logged and swallowed.
    pub async fn job_sent_logged(&self, job: &Job, at: DateTime<Utc>) {
        if let Err(e) = self.job_sent(job, at).await {
            warn!(job_id = %job.id, campaign_id = %job.campaign_id, error = %e,
                "failed to record sent progress");
        }
    }

    /// See [`Self::job_sent_logged`].
    pub async fn job_failed_logged(&self, job: &Job, error: &str) {
        if let Err(e) = self.job_failed(job, error).await {
            warn!(job_id = %job.id, campaign_id = %job.campaign_id, error = %e,
                "failed to record failed progress");
        }
    }
}

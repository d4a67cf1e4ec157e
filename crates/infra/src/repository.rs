//! Campaign and recipient repositories.
//!
//! These belong to the surrounding application; the pipeline only writes
//! aggregate counters and per-recipient delivery status through them. The
//! in-memory implementations double as test fixtures.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use mailroom_core::{CampaignId, RecipientId};

/// Repository-layer error.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Campaign sending configuration read by callers before job creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignSendConfig {
    pub from_email: String,
    pub active: bool,
}

/// Aggregate campaign counters and send config.
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn sending_config(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSendConfig>, RepositoryError>;

    /// Increment the campaign's sent counter by one.
    async fn record_sent(&self, campaign_id: CampaignId) -> Result<(), RepositoryError>;

    /// Increment the campaign's failed counter by one.
    async fn record_failed(&self, campaign_id: CampaignId) -> Result<(), RepositoryError>;
}

/// Per-recipient delivery outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientOutcome {
    Sent { at: DateTime<Utc> },
    Failed { error: String },
}

/// Per-recipient delivery status, keyed by (campaign, recipient).
#[async_trait]
pub trait RecipientRepository: Send + Sync {
    async fn record_delivery(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        outcome: RecipientOutcome,
    ) -> Result<(), RepositoryError>;
}

/// In-memory campaign repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCampaignRepository {
    configs: RwLock<HashMap<CampaignId, CampaignSendConfig>>,
    counters: RwLock<HashMap<CampaignId, (u64, u64)>>,
}

impl InMemoryCampaignRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_config(&self, campaign_id: CampaignId, config: CampaignSendConfig) {
        self.configs.write().unwrap().insert(campaign_id, config);
    }

    /// `(sent, failed)` counters for a campaign.
    pub fn counters(&self, campaign_id: CampaignId) -> (u64, u64) {
        self.counters
            .read()
            .unwrap()
            .get(&campaign_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CampaignRepository for InMemoryCampaignRepository {
    async fn sending_config(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSendConfig>, RepositoryError> {
        Ok(self.configs.read().unwrap().get(&campaign_id).cloned())
    }

    async fn record_sent(&self, campaign_id: CampaignId) -> Result<(), RepositoryError> {
        self.counters
            .write()
            .unwrap()
            .entry(campaign_id)
            .or_default()
            .0 += 1;
        Ok(())
    }

    async fn record_failed(&self, campaign_id: CampaignId) -> Result<(), RepositoryError> {
        self.counters
            .write()
            .unwrap()
            .entry(campaign_id)
            .or_default()
            .1 += 1;
        Ok(())
    }
}

/// In-memory recipient repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecipientRepository {
    statuses: RwLock<HashMap<(CampaignId, RecipientId), RecipientOutcome>>,
}

impl InMemoryRecipientRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
    ) -> Option<RecipientOutcome> {
        self.statuses
            .read()
            .unwrap()
            .get(&(campaign_id, recipient_id))
            .cloned()
    }
}

#[async_trait]
impl RecipientRepository for InMemoryRecipientRepository {
    async fn record_delivery(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        outcome: RecipientOutcome,
    ) -> Result<(), RepositoryError> {
        self.statuses
            .write()
            .unwrap()
            .insert((campaign_id, recipient_id), outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn campaign_counters_accumulate() {
        let repo = InMemoryCampaignRepository::new();
        let campaign = CampaignId::new();

        repo.record_sent(campaign).await.unwrap();
        repo.record_sent(campaign).await.unwrap();
        repo.record_failed(campaign).await.unwrap();

        assert_eq!(repo.counters(campaign), (2, 1));
        assert_eq!(repo.counters(CampaignId::new()), (0, 0));
    }

    #[tokio::test]
    async fn recipient_status_is_keyed_by_campaign_and_recipient() {
        let repo = InMemoryRecipientRepository::new();
        let campaign = CampaignId::new();
        let recipient = RecipientId::new();
        let at = Utc::now();

        repo.record_delivery(campaign, recipient, RecipientOutcome::Sent { at })
            .await
            .unwrap();

        assert_eq!(
            repo.status(campaign, recipient),
            Some(RecipientOutcome::Sent { at })
        );
        assert_eq!(repo.status(CampaignId::new(), recipient), None);
    }
}

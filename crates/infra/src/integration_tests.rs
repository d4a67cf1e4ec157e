//! Integration tests for the full delivery pipeline.
//!
//! Tests: JobFactory → JobStore → Dispatcher → RateLimiter → MailSender →
//! ProgressTracker, against the in-memory store and transport.
//!
//! Verifies:
//! - Created jobs flow through claim, send, and progress propagation
//! - Deferral and retry outcomes leave consistent store state
//! - Outcome handling is idempotent (no double-counted aggregates)
//! - Two dispatcher nodes never process the same job

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use mailroom_core::{CampaignId, OrganizationId};
    use mailroom_delivery::job::{EmailContent, Recipient};
    use mailroom_delivery::rate_limit::RateLimitConfig;
    use mailroom_delivery::{BackoffPolicy, RetryManager};

    use crate::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::factory::{CampaignMessage, ImmediateJobsRequest, JobFactory};
    use crate::mail::{InMemoryMailSender, TransportError};
    use crate::progress::ProgressTracker;
    use crate::rate_limiter::RateLimiter;
    use crate::repository::{
        InMemoryCampaignRepository, InMemoryRecipientRepository, RecipientOutcome,
    };
    use crate::store::in_memory::InMemoryStore;
    use crate::store::{JobEventKind, JobStore, StatusUpdate};

    struct Pipeline {
        store: Arc<InMemoryStore>,
        sender: Arc<InMemoryMailSender>,
        campaigns: Arc<InMemoryCampaignRepository>,
        recipients: Arc<InMemoryRecipientRepository>,
        factory: JobFactory,
    }

    impl Pipeline {
        fn new() -> Self {
            let store = InMemoryStore::arc();
            Self {
                factory: JobFactory::new(store.clone()),
                sender: Arc::new(InMemoryMailSender::new()),
                campaigns: Arc::new(InMemoryCampaignRepository::new()),
                recipients: Arc::new(InMemoryRecipientRepository::new()),
                store,
            }
        }

        fn dispatcher(&self, node: &str, limits: RateLimitConfig) -> Dispatcher {
            Dispatcher::new(
                self.store.clone(),
                Arc::new(RateLimiter::new(self.store.clone(), limits)),
                self.sender.clone(),
                ProgressTracker::new(self.campaigns.clone(), self.recipients.clone()),
                RetryManager::new(BackoffPolicy::fixed(Duration::ZERO)),
                DispatcherConfig::default()
                    .with_node_id(node)
                    .with_inter_send_delay(Duration::ZERO),
            )
        }

        async fn seed_mass(&self, campaign: CampaignId, org: OrganizationId, count: usize) {
            let messages = (0..count)
                .map(|i| {
                    CampaignMessage::new(
                        Recipient::new(format!("lead{i}@example.com")).with_name("Lead"),
                        EmailContent::new("Quarterly update").with_html("<p>hi</p>"),
                    )
                })
                .collect();
            self.factory
                .create_immediate_jobs(
                    ImmediateJobsRequest::new(campaign, org, messages, 100).mass_email(),
                )
                .await
                .unwrap();
        }
    }

    fn open_limits() -> RateLimitConfig {
        RateLimitConfig {
            hourly_limit: 10_000,
            daily_limit: 100_000,
            min_send_interval: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn mass_campaign_flows_end_to_end() {
        let pipeline = Pipeline::new();
        let campaign = CampaignId::new();
        let org = OrganizationId::new();
        pipeline.seed_mass(campaign, org, 5).await;

        let dispatcher = pipeline.dispatcher("node-1", open_limits());
        dispatcher.run_once().await;

        // Transport saw every recipient once.
        assert_eq!(pipeline.sender.sent_count(), 5);

        // Store state is terminal and consistent with campaign aggregates.
        let stats = pipeline.store.campaign_stats(campaign).await.unwrap();
        assert_eq!(stats.sent, 5);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 0);
        assert!((stats.completion_percentage() - 100.0).abs() < f64::EPSILON);
        assert_eq!(pipeline.campaigns.counters(campaign), (5, 0));

        // Audit log recorded the whole lifecycle for each job.
        let failed = pipeline
            .store
            .failed_jobs(crate::store::FailedJobsQuery::for_campaign(campaign))
            .await
            .unwrap();
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn audit_log_records_the_lifecycle() {
        let pipeline = Pipeline::new();
        let campaign = CampaignId::new();
        let org = OrganizationId::new();

        let created = pipeline
            .factory
            .create_immediate_jobs(
                ImmediateJobsRequest::new(
                    campaign,
                    org,
                    vec![CampaignMessage::new(
                        Recipient::new("lead@example.com"),
                        EmailContent::new("Quarterly update").with_text("hi"),
                    )],
                    100,
                )
                .mass_email(),
            )
            .await
            .unwrap();
        let job_id = created.job_ids[0];

        let dispatcher = pipeline.dispatcher("node-1", open_limits());
        dispatcher.run_once().await;

        let kinds: Vec<JobEventKind> = pipeline
            .store
            .job_events(job_id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                JobEventKind::Created,
                JobEventKind::Claimed,
                JobEventKind::Sent
            ]
        );
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let pipeline = Pipeline::new();
        let campaign = CampaignId::new();
        let org = OrganizationId::new();
        pipeline.seed_mass(campaign, org, 1).await;

        pipeline
            .sender
            .fail_times(1, TransportError::Network("connection reset".to_string()));

        let dispatcher = pipeline.dispatcher("node-1", open_limits());
        // First tick fails the send and schedules a zero-delay retry.
        dispatcher.run_once().await;
        assert_eq!(pipeline.sender.sent_count(), 0);
        let stats = pipeline.store.campaign_stats(campaign).await.unwrap();
        assert_eq!(stats.pending, 1);

        // Second tick delivers.
        dispatcher.run_once().await;
        assert_eq!(pipeline.sender.sent_count(), 1);
        let stats = pipeline.store.campaign_stats(campaign).await.unwrap();
        assert_eq!(stats.sent, 1);

        // One sent, zero failed; the transient failure left no terminal mark.
        assert_eq!(pipeline.campaigns.counters(campaign), (1, 0));
    }

    #[tokio::test]
    async fn repeated_outcome_updates_apply_once() {
        let pipeline = Pipeline::new();
        let campaign = CampaignId::new();
        let org = OrganizationId::new();
        pipeline.seed_mass(campaign, org, 1).await;

        let now = Utc::now();
        let claimed = pipeline.store.claim_due(1, "node-1", None, now).await.unwrap();
        let job = &claimed[0];

        let tracker = ProgressTracker::new(pipeline.campaigns.clone(), pipeline.recipients.clone());

        // First sent update applies and is propagated.
        let applied = pipeline
            .store
            .update_status(job.id, StatusUpdate::Sent, now)
            .await
            .unwrap();
        assert!(applied);
        tracker.job_sent(job, now).await.unwrap();

        // A duplicate delivery of the same outcome must not apply, so the
        // caller never propagates it again.
        let applied = pipeline
            .store
            .update_status(job.id, StatusUpdate::Sent, now)
            .await
            .unwrap();
        assert!(!applied);

        assert_eq!(pipeline.campaigns.counters(campaign), (1, 0));
        let events = pipeline.store.job_events(job.id).await.unwrap();
        let sent_events = events.iter().filter(|e| e.kind == JobEventKind::Sent).count();
        assert_eq!(sent_events, 1);
    }

    #[tokio::test]
    async fn cancellation_applies_before_claim_only() {
        let pipeline = Pipeline::new();
        let campaign = CampaignId::new();
        let org = OrganizationId::new();
        pipeline.seed_mass(campaign, org, 3).await;

        let cancelled = pipeline
            .store
            .cancel_pending(campaign, Utc::now())
            .await
            .unwrap();
        assert_eq!(cancelled, 3);

        let dispatcher = pipeline.dispatcher("node-1", open_limits());
        dispatcher.run_once().await;

        assert_eq!(pipeline.sender.sent_count(), 0);
        let stats = pipeline.store.campaign_stats(campaign).await.unwrap();
        assert_eq!(stats.cancelled, 3);
        assert!((stats.completion_percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn two_nodes_never_process_the_same_job() {
        let pipeline = Pipeline::new();
        let campaign = CampaignId::new();
        let org = OrganizationId::new();
        pipeline.seed_mass(campaign, org, 40).await;

        let node_a = pipeline.dispatcher("node-a", open_limits());
        let node_b = pipeline.dispatcher("node-b", open_limits());

        tokio::join!(node_a.run_once(), node_b.run_once());

        // Every job delivered exactly once across both nodes.
        let sent = pipeline.sender.sent();
        assert_eq!(sent.len(), 40);
        let unique: std::collections::HashSet<&str> =
            sent.iter().map(|(_, email)| email.to.as_str()).collect();
        assert_eq!(unique.len(), 40);

        let stats = pipeline.store.campaign_stats(campaign).await.unwrap();
        assert_eq!(stats.sent, 40);
        assert_eq!(pipeline.campaigns.counters(campaign), (40, 0));

        let split_a = node_a.stats().jobs_sent;
        let split_b = node_b.stats().jobs_sent;
        assert_eq!(split_a + split_b, 40);
    }

    #[tokio::test]
    async fn recipient_records_follow_terminal_outcomes() {
        let pipeline = Pipeline::new();
        let campaign = CampaignId::new();
        let org = OrganizationId::new();
        pipeline.seed_mass(campaign, org, 2).await;

        // Exhaust both jobs' retry budgets (initial attempt + 3 retries each).
        pipeline.sender.fail_times(
            8,
            TransportError::Rejected("blocked by policy".to_string()),
        );

        let dispatcher = pipeline.dispatcher("node-1", open_limits());
        for _ in 0..5 {
            dispatcher.run_once().await;
        }

        let stats = pipeline.store.campaign_stats(campaign).await.unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.sent, 0);
        // Failed counter moved once per job, not once per attempt.
        assert_eq!(pipeline.campaigns.counters(campaign), (0, 2));

        let failed = pipeline
            .store
            .failed_jobs(crate::store::FailedJobsQuery::for_campaign(campaign))
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
        for job in &failed {
            assert_eq!(job.retry_count, job.max_retries);
            assert_eq!(
                pipeline.recipients.status(campaign, job.recipient_id),
                Some(RecipientOutcome::Failed {
                    error: "provider rejected message: blocked by policy".to_string()
                })
            );
        }
    }
}

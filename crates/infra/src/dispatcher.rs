//! The polling dispatch loop.
//!
//! Each worker node runs one dispatcher. A tick claims due jobs for this
//! node, groups them by organization, and drives them through
//! send/retry/terminal transitions. Organizations are processed
//! concurrently; jobs within one organization sequentially, in claim order,
//! with a pause between sends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use mailroom_core::OrganizationId;
use mailroom_delivery::{DeferralReason, Job, JobId, RetryDecision, RetryManager};

use crate::mail::{MailSender, OutgoingEmail};
use crate::progress::ProgressTracker;
use crate::rate_limiter::RateLimiter;
use crate::store::JobStore;

const fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_max_concurrent_jobs() -> usize {
    50
}

const fn default_inter_send_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_stale_claim_cutoff() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Claim-ownership identity of this worker process.
    pub node_id: String,
    /// How often to poll for due jobs.
    pub poll_interval: Duration,
    /// Maximum jobs claimed per tick.
    pub max_concurrent_jobs: usize,
    /// Pause between two sends within one organization, independent of the
    /// hourly rate math, to avoid bursty provider throttling.
    pub inter_send_delay: Duration,
    /// `processing` claims untouched for longer than this are considered
    /// orphaned by a dead node and requeued.
    pub stale_claim_cutoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            node_id: format!("worker-{}", uuid::Uuid::now_v7().simple()),
            poll_interval: default_poll_interval(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            inter_send_delay: default_inter_send_delay(),
            stale_claim_cutoff: default_stale_claim_cutoff(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_inter_send_delay(mut self, delay: Duration) -> Self {
        self.inter_send_delay = delay;
        self
    }

    pub fn with_stale_claim_cutoff(mut self, cutoff: Duration) -> Self {
        self.stale_claim_cutoff = cutoff;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub ticks: u64,
    pub jobs_claimed: u64,
    pub jobs_sent: u64,
    pub jobs_deferred: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub uptime_secs: u64,
}

struct Inner {
    store: Arc<dyn JobStore>,
    rate_limiter: Arc<RateLimiter>,
    sender: Arc<dyn MailSender>,
    tracker: ProgressTracker,
    retry: RetryManager,
    config: DispatcherConfig,
    stats: Mutex<DispatcherStats>,
    started_at: Instant,
}

/// Polling dispatcher for one worker node.
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Handle to a running dispatcher.
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
    inner: Arc<Inner>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the loop to finish its tick.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn stats(&self) -> DispatcherStats {
        self.inner.snapshot_stats()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        rate_limiter: Arc<RateLimiter>,
        sender: Arc<dyn MailSender>,
        tracker: ProgressTracker,
        retry: RetryManager,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                rate_limiter,
                sender,
                tracker,
                retry,
                config,
                stats: Mutex::new(DispatcherStats::default()),
                started_at: Instant::now(),
            }),
        }
    }

    /// Run the polling loop until shutdown.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(run_loop(inner, shutdown_rx));
        DispatcherHandle {
            shutdown: shutdown_tx,
            join,
            inner: self.inner,
        }
    }

    /// Run a single tick. Exposed for tests and synchronous drains.
    pub async fn run_once(&self) {
        Arc::clone(&self.inner).tick().await;
    }

    pub fn stats(&self) -> DispatcherStats {
        self.inner.snapshot_stats()
    }
}

async fn run_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    info!(node = %inner.config.node_id, "dispatcher started");

    let mut timer = tokio::time::interval(inner.config.poll_interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                Arc::clone(&inner).tick().await;
            }
            _ = shutdown.changed() => {
                info!(node = %inner.config.node_id, "dispatcher received shutdown signal");
                break;
            }
        }
    }

    info!(node = %inner.config.node_id, "dispatcher stopped");
}

impl Inner {
    fn snapshot_stats(&self) -> DispatcherStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.uptime_secs = self.started_at.elapsed().as_secs();
        stats
    }

    async fn tick(self: Arc<Self>) {
        let now = Utc::now();

        // Recover claims orphaned by dead nodes before taking new work.
        let cutoff = now
            - chrono::Duration::from_std(self.config.stale_claim_cutoff)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        match self.store.requeue_stale(cutoff, now).await {
            Ok(0) => {}
            Ok(count) => warn!(count, "requeued stale claims from dead nodes"),
            Err(e) => error!(error = %e, "failed to requeue stale claims"),
        }

        let claimed = match self
            .store
            .claim_due(
                self.config.max_concurrent_jobs,
                &self.config.node_id,
                None,
                now,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                // This tick is lost; the next one retries naturally.
                error!(error = %e, "failed to claim due jobs");
                return;
            }
        };

        {
            let mut stats = self.stats.lock().unwrap();
            stats.ticks += 1;
            stats.jobs_claimed += claimed.len() as u64;
        }

        if claimed.is_empty() {
            debug!(node = %self.config.node_id, "no due jobs");
            return;
        }
        debug!(node = %self.config.node_id, count = claimed.len(), "claimed due jobs");

        // Group by organization, preserving claim order within each group.
        let mut order: Vec<OrganizationId> = Vec::new();
        let mut groups: HashMap<OrganizationId, Vec<Job>> = HashMap::new();
        for job in claimed {
            let batch = groups.entry(job.organization_id).or_default();
            if batch.is_empty() {
                order.push(job.organization_id);
            }
            batch.push(job);
        }

        // Organizations run concurrently; each batch sequentially.
        let mut tasks: JoinSet<()> = JoinSet::new();
        for organization_id in order {
            if let Some(batch) = groups.remove(&organization_id) {
                let inner = Arc::clone(&self);
                tasks.spawn(async move {
                    inner.process_organization(organization_id, batch).await;
                });
            }
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn process_organization(&self, organization_id: OrganizationId, batch: Vec<Job>) {
        let total = batch.len();
        for (index, job) in batch.iter().enumerate() {
            // Re-check before every send: limits may have been consumed
            // since the batch was claimed, including by other nodes. The
            // minimum interval is spacing, not quota: wait it out in place
            // instead of deferring the batch.
            let decision = loop {
                match self.rate_limiter.check(organization_id, Utc::now()).await {
                    Ok(decision) => {
                        if let Some(DeferralReason::MinIntervalNotElapsed { wait }) =
                            decision.reason
                        {
                            tokio::time::sleep(wait).await;
                            continue;
                        }
                        break Ok(decision);
                    }
                    Err(e) => break Err(e),
                }
            };

            let now = Utc::now();
            let decision = match decision {
                Ok(decision) => decision,
                Err(e) => {
                    error!(organization_id = %organization_id, error = %e,
                        "rate limit check failed, deferring batch");
                    self.defer_remainder(&batch[index..], now).await;
                    return;
                }
            };

            if !decision.can_send {
                let reason = decision.reason.map(|r| r.to_string()).unwrap_or_default();
                debug!(
                    organization_id = %organization_id,
                    reason = %reason,
                    remaining = total - index,
                    "rate limited, deferring remainder of batch"
                );
                self.defer_remainder(&batch[index..], now).await;
                return;
            }

            self.attempt_send(job, now).await;

            if index + 1 < total {
                tokio::time::sleep(self.config.inter_send_delay).await;
            }
        }
    }

    /// Release still-claimed jobs back to pending. Deferral, not failure:
    /// no retry penalty.
    async fn defer_remainder(&self, remainder: &[Job], now: DateTime<Utc>) {
        let ids: Vec<JobId> = remainder.iter().map(|j| j.id).collect();
        match self.store.release(&ids, now).await {
            Ok(released) => {
                self.stats.lock().unwrap().jobs_deferred += released;
            }
            Err(e) => error!(count = ids.len(), error = %e, "failed to release deferred jobs"),
        }
    }

    async fn attempt_send(&self, job: &Job, now: DateTime<Utc>) {
        let email = OutgoingEmail::from_job(job);

        match self.sender.send(job.organization_id, &email).await {
            Ok(receipt) => {
                if let Err(e) = self
                    .rate_limiter
                    .record_outcome(job.organization_id, true, now)
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "failed to record send in rate counters");
                }

                match self.store.mark_sent(job.id, now).await {
                    Ok(true) => {
                        debug!(job_id = %job.id, message_id = %receipt.message_id, "job sent");
                        self.tracker.job_sent_logged(job, now).await;
                        self.stats.lock().unwrap().jobs_sent += 1;
                    }
                    Ok(false) => {
                        // Already resolved elsewhere; counters must not move.
                        warn!(job_id = %job.id, "sent transition did not apply");
                    }
                    Err(e) => error!(job_id = %job.id, error = %e, "failed to persist sent status"),
                }
            }
            Err(transport_error) => {
                if let Err(e) = self
                    .rate_limiter
                    .record_outcome(job.organization_id, false, now)
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "failed to record failure in rate counters");
                }
                self.handle_failure(job, &transport_error.to_string(), now)
                    .await;
            }
        }
    }

    async fn handle_failure(&self, job: &Job, error_text: &str, now: DateTime<Utc>) {
        match self.retry.decide(job, now) {
            RetryDecision::Reschedule { at } => {
                match self.store.schedule_retry(job.id, at, error_text, now).await {
                    Ok(true) => {
                        debug!(job_id = %job.id, retry_at = %at, error = error_text,
                            "send failed, retry scheduled");
                        self.stats.lock().unwrap().jobs_retried += 1;
                    }
                    Ok(false) => {
                        // Retry budget raced out underneath us; go terminal.
                        self.mark_terminal_failure(job, error_text, now).await;
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "failed to schedule retry");
                    }
                }
            }
            RetryDecision::Terminal => {
                self.mark_terminal_failure(job, error_text, now).await;
            }
        }
    }

    async fn mark_terminal_failure(&self, job: &Job, error_text: &str, now: DateTime<Utc>) {
        match self.store.mark_failed(job.id, error_text, now).await {
            Ok(true) => {
                warn!(job_id = %job.id, campaign_id = %job.campaign_id, error = error_text,
                    "job failed terminally");
                self.tracker.job_failed_logged(job, error_text).await;
                self.stats.lock().unwrap().jobs_failed += 1;
            }
            Ok(false) => {
                warn!(job_id = %job.id, "failed transition did not apply");
            }
            Err(e) => error!(job_id = %job.id, error = %e, "failed to persist terminal failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{CampaignMessage, ImmediateJobsRequest, JobFactory};
    use crate::mail::{InMemoryMailSender, TransportError};
    use crate::repository::{InMemoryCampaignRepository, InMemoryRecipientRepository};
    use crate::store::in_memory::InMemoryStore;
    use mailroom_core::CampaignId;
    use mailroom_delivery::job::{EmailContent, Recipient};
    use mailroom_delivery::rate_limit::RateLimitConfig;
    use mailroom_delivery::{BackoffPolicy, JobStatus};

    struct Fixture {
        store: Arc<InMemoryStore>,
        sender: Arc<InMemoryMailSender>,
        campaigns: Arc<InMemoryCampaignRepository>,
        dispatcher: Dispatcher,
    }

    fn fixture(limits: RateLimitConfig) -> Fixture {
        let store = InMemoryStore::arc();
        let sender = Arc::new(InMemoryMailSender::new());
        let campaigns = Arc::new(InMemoryCampaignRepository::new());
        let recipients = Arc::new(InMemoryRecipientRepository::new());

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(RateLimiter::new(store.clone(), limits)),
            sender.clone(),
            ProgressTracker::new(campaigns.clone(), recipients),
            RetryManager::default(),
            DispatcherConfig::default()
                .with_node_id("node-test")
                .with_inter_send_delay(Duration::ZERO),
        );

        Fixture {
            store,
            sender,
            campaigns,
            dispatcher,
        }
    }

    fn open_limits() -> RateLimitConfig {
        RateLimitConfig {
            hourly_limit: 10_000,
            daily_limit: 100_000,
            min_send_interval: Duration::ZERO,
        }
    }

    async fn seed_jobs(
        store: &Arc<InMemoryStore>,
        campaign: CampaignId,
        org: mailroom_core::OrganizationId,
        count: usize,
    ) -> Vec<JobId> {
        let factory = JobFactory::new(store.clone());
        let messages = (0..count)
            .map(|i| {
                CampaignMessage::new(
                    Recipient::new(format!("lead{i}@example.com")),
                    EmailContent::new("Hello").with_text("hi"),
                )
            })
            .collect();
        factory
            .create_immediate_jobs(
                ImmediateJobsRequest::new(campaign, org, messages, 1).mass_email(),
            )
            .await
            .unwrap()
            .job_ids
    }

    #[tokio::test]
    async fn sends_due_jobs_and_tracks_progress() {
        let fx = fixture(open_limits());
        let campaign = CampaignId::new();
        let org = mailroom_core::OrganizationId::new();
        let ids = seed_jobs(&fx.store, campaign, org, 3).await;

        fx.dispatcher.run_once().await;

        assert_eq!(fx.sender.sent_count(), 3);
        for id in ids {
            let job = fx.store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Sent);
        }
        assert_eq!(fx.campaigns.counters(campaign), (3, 0));

        let stats = fx.dispatcher.stats();
        assert_eq!(stats.jobs_claimed, 3);
        assert_eq!(stats.jobs_sent, 3);
        assert_eq!(stats.jobs_deferred, 0);
    }

    #[tokio::test]
    async fn hourly_quota_defers_the_remainder() {
        // Organization allows 5/hour, 8 jobs are due.
        let fx = fixture(RateLimitConfig {
            hourly_limit: 5,
            daily_limit: 100_000,
            min_send_interval: Duration::ZERO,
        });
        let campaign = CampaignId::new();
        let org = mailroom_core::OrganizationId::new();
        seed_jobs(&fx.store, campaign, org, 8).await;

        fx.dispatcher.run_once().await;

        // Exactly 5 attempted, 3 back to pending with the claim cleared.
        assert_eq!(fx.sender.sent_count(), 5);
        let stats = fx.store.campaign_stats(campaign).await.unwrap();
        assert_eq!(stats.sent, 5);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 0);

        let pending = fx.store.claim_due(10, "probe", None, Utc::now()).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|j| j.retry_count == 0));

        let stats = fx.dispatcher.stats();
        assert_eq!(stats.jobs_deferred, 3);
    }

    #[tokio::test]
    async fn min_interval_is_waited_out_within_a_batch() {
        let fx = fixture(RateLimitConfig {
            hourly_limit: 10_000,
            daily_limit: 100_000,
            min_send_interval: Duration::from_millis(30),
        });
        let campaign = CampaignId::new();
        let org = mailroom_core::OrganizationId::new();
        seed_jobs(&fx.store, campaign, org, 3).await;

        let started = std::time::Instant::now();
        fx.dispatcher.run_once().await;

        // Spacing is enforced by waiting, not by deferring to the next tick.
        assert_eq!(fx.sender.sent_count(), 3);
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(fx.dispatcher.stats().jobs_deferred, 0);
    }

    #[tokio::test]
    async fn transport_failure_schedules_backoff_retry() {
        let fx = fixture(open_limits());
        let campaign = CampaignId::new();
        let org = mailroom_core::OrganizationId::new();
        let ids = seed_jobs(&fx.store, campaign, org, 1).await;

        fx.sender.fail_times(1, TransportError::Timeout);
        let before = Utc::now();
        fx.dispatcher.run_once().await;

        let job = fx.store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("transport timeout"));
        // Default backoff table: first retry after 5 minutes.
        assert!(job.scheduled_for >= before + chrono::Duration::minutes(5));

        // Not yet due: a second tick attempts nothing.
        fx.dispatcher.run_once().await;
        assert_eq!(fx.sender.sent_count(), 0);
        assert_eq!(fx.campaigns.counters(campaign), (0, 0));
    }

    #[tokio::test]
    async fn retries_exhaust_into_terminal_failure() {
        let store = InMemoryStore::arc();
        let sender = Arc::new(InMemoryMailSender::new());
        let campaigns = Arc::new(InMemoryCampaignRepository::new());
        let recipients = Arc::new(InMemoryRecipientRepository::new());

        // Immediate (zero-delay) retries so one test drives the whole ladder.
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(RateLimiter::new(store.clone(), open_limits())),
            sender.clone(),
            ProgressTracker::new(campaigns.clone(), recipients.clone()),
            RetryManager::new(BackoffPolicy::fixed(Duration::ZERO)),
            DispatcherConfig::default()
                .with_node_id("node-test")
                .with_inter_send_delay(Duration::ZERO),
        );

        let campaign = CampaignId::new();
        let org = mailroom_core::OrganizationId::new();
        let ids = seed_jobs(&store, campaign, org, 1).await;

        sender.fail_times(10, TransportError::Rejected("mailbox full".to_string()));

        // retry_count walks 0 -> 1 -> 2 -> 3; the 4th failure is terminal.
        for expected_retry in 1..=3u32 {
            dispatcher.run_once().await;
            let job = store.get(ids[0]).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.retry_count, expected_retry);
        }
        dispatcher.run_once().await;

        let job = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.last_error.as_deref(),
            Some("provider rejected message: mailbox full")
        );

        // Failed counter incremented once, not once per attempt.
        assert_eq!(campaigns.counters(campaign), (0, 1));

        // Terminal: further ticks never reschedule it.
        dispatcher.run_once().await;
        let job = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(dispatcher.stats().jobs_failed, 1);
    }

    #[tokio::test]
    async fn organizations_are_isolated_within_a_tick() {
        let fx = fixture(RateLimitConfig {
            hourly_limit: 2,
            daily_limit: 100_000,
            min_send_interval: Duration::ZERO,
        });
        let org_a = mailroom_core::OrganizationId::new();
        let org_b = mailroom_core::OrganizationId::new();
        let campaign_a = CampaignId::new();
        let campaign_b = CampaignId::new();
        seed_jobs(&fx.store, campaign_a, org_a, 4).await;
        seed_jobs(&fx.store, campaign_b, org_b, 2).await;

        fx.dispatcher.run_once().await;

        // Each organization consumed its own quota.
        let stats_a = fx.store.campaign_stats(campaign_a).await.unwrap();
        let stats_b = fx.store.campaign_stats(campaign_b).await.unwrap();
        assert_eq!(stats_a.sent, 2);
        assert_eq!(stats_a.pending, 2);
        assert_eq!(stats_b.sent, 2);
        assert_eq!(stats_b.pending, 0);
    }

    #[tokio::test]
    async fn spawned_loop_drains_and_shuts_down() {
        let store = InMemoryStore::arc();
        let sender = Arc::new(InMemoryMailSender::new());
        let campaigns = Arc::new(InMemoryCampaignRepository::new());
        let recipients = Arc::new(InMemoryRecipientRepository::new());

        let campaign = CampaignId::new();
        let org = mailroom_core::OrganizationId::new();
        seed_jobs(&store, campaign, org, 3).await;

        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(RateLimiter::new(store.clone(), open_limits())),
            sender.clone(),
            ProgressTracker::new(campaigns, recipients),
            RetryManager::default(),
            DispatcherConfig::default()
                .with_node_id("node-test")
                .with_poll_interval(Duration::from_millis(20))
                .with_inter_send_delay(Duration::ZERO),
        );

        let handle = dispatcher.spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(sender.sent_count(), 3);
        assert!(stats.ticks >= 1);
        assert_eq!(stats.jobs_sent, 3);
    }
}

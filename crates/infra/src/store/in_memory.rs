//! In-memory store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailroom_core::{CampaignId, OrganizationId};
use mailroom_delivery::{
    CampaignSchedule, Job, JobId, JobStatus, UsageSnapshot, WindowKind,
};

use super::{
    CampaignJobStats, FailedJobsQuery, JobEvent, JobEventKind, JobStore, JobStoreError,
    RateLimitStore,
};

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    sent: u64,
    failed: u64,
}

type CounterKey = (OrganizationId, DateTime<Utc>, WindowKind);

/// In-memory job + counter store.
///
/// Intended for tests/dev. Claims are serialized through a single lock,
/// which is what makes them atomic here; not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    schedules: RwLock<HashMap<CampaignId, CampaignSchedule>>,
    counters: RwLock<HashMap<CounterKey, Counter>>,
    events: RwLock<Vec<JobEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn push_event(
        &self,
        job: &Job,
        kind: JobEventKind,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.events.write().unwrap().push(JobEvent::record(
            job.id,
            job.campaign_id,
            kind,
            detail,
            at,
        ));
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_jobs(&self, jobs: &[Job]) -> Result<(), JobStoreError> {
        let mut map = self.jobs.write().unwrap();
        for job in jobs {
            if map.contains_key(&job.id) {
                return Err(JobStoreError::Storage(format!(
                    "job already exists: {}",
                    job.id
                )));
            }
        }
        for job in jobs {
            map.insert(job.id, job.clone());
            self.push_event(job, JobEventKind::Created, None, job.created_at);
        }
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn claim_due(
        &self,
        limit: usize,
        node: &str,
        organization_id: Option<OrganizationId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut map = self.jobs.write().unwrap();

        let mut due: Vec<JobId> = map
            .values()
            .filter(|j| {
                j.is_due(now) && organization_id.is_none_or(|org| j.organization_id == org)
            })
            .map(|j| j.id)
            .collect();
        due.sort_by(|a, b| {
            let ja = &map[a];
            let jb = &map[b];
            jb.priority
                .cmp(&ja.priority)
                .then(ja.scheduled_for.cmp(&jb.scheduled_for))
                .then(ja.id.0.cmp(&jb.id.0))
        });
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(job) = map.get_mut(&id) {
                if job.mark_processing(node, now) {
                    claimed.push(job.clone());
                }
            }
        }
        drop(map);

        for job in &claimed {
            self.push_event(job, JobEventKind::Claimed, Some(node.to_string()), now);
        }
        Ok(claimed)
    }

    async fn release(&self, job_ids: &[JobId], now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut released = Vec::new();
        {
            let mut map = self.jobs.write().unwrap();
            for id in job_ids {
                if let Some(job) = map.get_mut(id) {
                    if job.release(now) {
                        released.push(job.clone());
                    }
                }
            }
        }
        for job in &released {
            self.push_event(job, JobEventKind::Released, None, now);
        }
        Ok(released.len() as u64)
    }

    async fn mark_sent(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let applied = {
            let mut map = self.jobs.write().unwrap();
            let job = map
                .get_mut(&job_id)
                .ok_or(JobStoreError::NotFound(job_id))?;
            job.mark_sent(now).then(|| job.clone())
        };
        if let Some(job) = applied {
            self.push_event(&job, JobEventKind::Sent, None, now);
            return Ok(true);
        }
        Ok(false)
    }

    async fn schedule_retry(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let applied = {
            let mut map = self.jobs.write().unwrap();
            let job = map
                .get_mut(&job_id)
                .ok_or(JobStoreError::NotFound(job_id))?;
            job.schedule_retry(at, error, now).then(|| job.clone())
        };
        if let Some(job) = applied {
            self.push_event(
                &job,
                JobEventKind::RetryScheduled,
                Some(error.to_string()),
                now,
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let applied = {
            let mut map = self.jobs.write().unwrap();
            let job = map
                .get_mut(&job_id)
                .ok_or(JobStoreError::NotFound(job_id))?;
            job.mark_failed(error, now).then(|| job.clone())
        };
        if let Some(job) = applied {
            self.push_event(&job, JobEventKind::Failed, Some(error.to_string()), now);
            return Ok(true);
        }
        Ok(false)
    }

    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let applied = {
            let mut map = self.jobs.write().unwrap();
            let job = map
                .get_mut(&job_id)
                .ok_or(JobStoreError::NotFound(job_id))?;
            job.mark_cancelled(now).then(|| job.clone())
        };
        if let Some(job) = applied {
            self.push_event(&job, JobEventKind::Cancelled, None, now);
            return Ok(true);
        }
        Ok(false)
    }

    async fn cancel_pending(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut cancelled = Vec::new();
        {
            let mut map = self.jobs.write().unwrap();
            for job in map.values_mut() {
                if job.campaign_id == campaign_id && job.mark_cancelled(now) {
                    cancelled.push(job.clone());
                }
            }
        }
        for job in &cancelled {
            self.push_event(job, JobEventKind::Cancelled, None, now);
        }
        Ok(cancelled.len() as u64)
    }

    async fn requeue_stale(
        &self,
        stuck_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut requeued = Vec::new();
        {
            let mut map = self.jobs.write().unwrap();
            for job in map.values_mut() {
                if job.status == JobStatus::Processing
                    && job.updated_at < stuck_since
                    && job.release(now)
                {
                    requeued.push(job.clone());
                }
            }
        }
        for job in &requeued {
            self.push_event(job, JobEventKind::Requeued, None, now);
        }
        Ok(requeued.len() as u64)
    }

    async fn retry_failed_job(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let job = {
            let mut map = self.jobs.write().unwrap();
            let job = map
                .get_mut(&job_id)
                .ok_or(JobStoreError::NotFound(job_id))?;
            if job.status != JobStatus::Failed {
                return Err(JobStoreError::InvalidTransition(format!(
                    "job {job_id} is {}, not failed",
                    job.status
                )));
            }
            job.status = JobStatus::Pending;
            job.retry_count = 0;
            job.scheduled_for = now;
            job.updated_at = now;
            job.clone()
        };
        self.push_event(&job, JobEventKind::Requeued, Some("manual retry".into()), now);
        Ok(job)
    }

    async fn campaign_stats(
        &self,
        campaign_id: CampaignId,
    ) -> Result<CampaignJobStats, JobStoreError> {
        let map = self.jobs.read().unwrap();
        let mut stats = CampaignJobStats::default();
        for job in map.values().filter(|j| j.campaign_id == campaign_id) {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Sent => stats.sent += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn failed_jobs(&self, query: FailedJobsQuery) -> Result<Vec<Job>, JobStoreError> {
        let map = self.jobs.read().unwrap();
        let mut result: Vec<Job> = map
            .values()
            .filter(|j| {
                j.status == JobStatus::Failed
                    && query.campaign_id.is_none_or(|c| j.campaign_id == c)
                    && query
                        .organization_id
                        .is_none_or(|o| j.organization_id == o)
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn upsert_schedule(&self, schedule: &CampaignSchedule) -> Result<(), JobStoreError> {
        self.schedules
            .write()
            .unwrap()
            .insert(schedule.campaign_id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSchedule>, JobStoreError> {
        Ok(self.schedules.read().unwrap().get(&campaign_id).cloned())
    }

    async fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, JobStoreError> {
        Ok(self
            .events
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn record_outcome(
        &self,
        organization_id: OrganizationId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut counters = self.counters.write().unwrap();
        for kind in [WindowKind::Hour, WindowKind::Day] {
            let entry = counters
                .entry((organization_id, kind.bucket_start(at), kind))
                .or_default();
            if success {
                entry.sent += 1;
            } else {
                entry.failed += 1;
            }
        }
        Ok(())
    }

    async fn usage(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, JobStoreError> {
        let counters = self.counters.read().unwrap();
        let mut usage = UsageSnapshot::default();
        for ((org, window_start, kind), counter) in counters.iter() {
            if *org != organization_id {
                continue;
            }
            if *window_start <= now - kind.length() {
                continue;
            }
            match kind {
                WindowKind::Hour => usage.hourly_used += counter.sent + counter.failed,
                WindowKind::Day => usage.daily_used += counter.sent + counter.failed,
            }
        }
        Ok(usage)
    }
}

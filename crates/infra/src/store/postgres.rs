//! Postgres-backed job and rate-limit store.
//!
//! The claim query is the one operation that matters most: it must hand each
//! due job to exactly one worker even with many nodes polling concurrently.
//! It is a single `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP
//! LOCKED) RETURNING *`, so rows locked by another in-flight claim are
//! skipped instead of blocking, and the status flip plus ownership stamp are
//! atomic with the selection.
//!
//! Every status transition is a conditional `UPDATE` keyed on the current
//! status; the affected-row count tells the caller whether the transition
//! applied. Audit-log rows are written in the same transaction as the
//! transition they record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use mailroom_core::{CampaignId, OrganizationId, RecipientId};
use mailroom_delivery::{
    CampaignSchedule, Job, JobId, JobStatus, ScheduleKind, UsageSnapshot, WindowKind,
};

use super::{
    CampaignJobStats, FailedJobsQuery, JobEvent, JobEventKind, JobStore, JobStoreError,
    RateLimitStore,
};

/// Idempotent DDL applied by `ensure_schema` at worker startup.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS delivery_jobs (
        id              UUID PRIMARY KEY,
        campaign_id     UUID NOT NULL,
        organization_id UUID NOT NULL,
        recipient_id    UUID NOT NULL,
        recipient_email TEXT NOT NULL,
        recipient_name  TEXT,
        subject         TEXT NOT NULL,
        body_html       TEXT,
        body_text       TEXT,
        personalization JSONB NOT NULL DEFAULT 'null'::jsonb,
        scheduled_for   TIMESTAMPTZ NOT NULL,
        priority        INT NOT NULL DEFAULT 0,
        status          TEXT NOT NULL DEFAULT 'pending',
        retry_count     INT NOT NULL DEFAULT 0,
        max_retries     INT NOT NULL DEFAULT 3,
        last_error      TEXT,
        processing_node TEXT,
        rate_limit_key  TEXT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        CONSTRAINT delivery_jobs_status_check
            CHECK (status IN ('pending', 'processing', 'sent', 'failed', 'cancelled')),
        CONSTRAINT delivery_jobs_retry_check CHECK (retry_count <= max_retries)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_delivery_jobs_due
        ON delivery_jobs (status, scheduled_for, priority DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_delivery_jobs_campaign
        ON delivery_jobs (campaign_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_delivery_jobs_organization
        ON delivery_jobs (organization_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS campaign_schedules (
        campaign_id   UUID PRIMARY KEY,
        schedule_type TEXT NOT NULL,
        window_start  TIME,
        window_end    TIME,
        timezone      TEXT NOT NULL,
        daily_limit   INT,
        hourly_limit  INT NOT NULL,
        start_date    DATE,
        end_date      DATE,
        CONSTRAINT campaign_schedules_type_check
            CHECK (schedule_type IN ('immediate', 'scheduled'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rate_limit_counters (
        organization_id UUID NOT NULL,
        window_start    TIMESTAMPTZ NOT NULL,
        window_type     TEXT NOT NULL,
        sent_count      BIGINT NOT NULL DEFAULT 0,
        failed_count    BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (organization_id, window_start, window_type),
        CONSTRAINT rate_limit_counters_type_check
            CHECK (window_type IN ('hour', 'day'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_events (
        id          UUID PRIMARY KEY,
        job_id      UUID NOT NULL,
        campaign_id UUID NOT NULL,
        event_type  TEXT NOT NULL,
        detail      TEXT,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_events_job
        ON job_events (job_id, recorded_at)
    "#,
];

const JOB_COLUMNS: &str = "id, campaign_id, organization_id, recipient_id, recipient_email, \
     recipient_name, subject, body_html, body_text, personalization, scheduled_for, priority, \
     status, retry_count, max_retries, last_error, processing_node, rate_limit_key, created_at, \
     updated_at";

/// Postgres-backed store.
///
/// `Send + Sync`; all operations go through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the schema. Safe to call on every startup.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", &e))?;
        }
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, error: &sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("{operation}: {error}"))
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let field = |e: sqlx::Error| JobStoreError::Storage(format!("job row: {e}"));

    let status_raw: String = row.try_get("status").map_err(field)?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| JobStoreError::Storage(format!("unknown job status: {status_raw}")))?;

    let retry_count: i32 = row.try_get("retry_count").map_err(field)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(field)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(field)?),
        campaign_id: CampaignId::from_uuid(row.try_get("campaign_id").map_err(field)?),
        organization_id: OrganizationId::from_uuid(
            row.try_get("organization_id").map_err(field)?,
        ),
        recipient_id: RecipientId::from_uuid(row.try_get("recipient_id").map_err(field)?),
        recipient_email: row.try_get("recipient_email").map_err(field)?,
        recipient_name: row.try_get("recipient_name").map_err(field)?,
        subject: row.try_get("subject").map_err(field)?,
        body_html: row.try_get("body_html").map_err(field)?,
        body_text: row.try_get("body_text").map_err(field)?,
        personalization: row.try_get("personalization").map_err(field)?,
        scheduled_for: row.try_get("scheduled_for").map_err(field)?,
        priority: row.try_get("priority").map_err(field)?,
        status,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        last_error: row.try_get("last_error").map_err(field)?,
        processing_node: row.try_get("processing_node").map_err(field)?,
        rate_limit_key: row.try_get("rate_limit_key").map_err(field)?,
        created_at: row.try_get("created_at").map_err(field)?,
        updated_at: row.try_get("updated_at").map_err(field)?,
    })
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    campaign_id: Uuid,
    kind: JobEventKind,
    detail: Option<&str>,
    recorded_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO job_events (id, job_id, campaign_id, event_type, detail, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(job_id)
    .bind(campaign_id)
    .bind(kind.as_str())
    .bind(detail)
    .bind(recorded_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Finish a conditional transition: append the audit row and commit.
///
/// The caller's `UPDATE` must filter on the source status and return
/// `campaign_id`; no returned row means the transition did not apply and
/// the transaction is dropped.
async fn finish_transition(
    mut tx: Transaction<'_, Postgres>,
    operation: &str,
    row: Option<PgRow>,
    job_id: JobId,
    kind: JobEventKind,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, JobStoreError> {
    let Some(row) = row else {
        return Ok(false);
    };
    let campaign_id: Uuid = row
        .try_get("campaign_id")
        .map_err(|e| map_sqlx_error(operation, &e))?;

    insert_event(&mut tx, job_id.0, campaign_id, kind, detail, now)
        .await
        .map_err(|e| map_sqlx_error(operation, &e))?;
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error(operation, &e))?;
    Ok(true)
}

#[async_trait]
impl JobStore for PostgresStore {
    #[instrument(skip(self, jobs), fields(count = jobs.len()), err)]
    async fn insert_jobs(&self, jobs: &[Job]) -> Result<(), JobStoreError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert_jobs", &e))?;

        for job in jobs {
            sqlx::query(
                r#"
                INSERT INTO delivery_jobs (
                    id, campaign_id, organization_id, recipient_id, recipient_email,
                    recipient_name, subject, body_html, body_text, personalization,
                    scheduled_for, priority, status, retry_count, max_retries,
                    last_error, processing_node, rate_limit_key, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                        $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
                "#,
            )
            .bind(job.id.0)
            .bind(job.campaign_id.as_uuid())
            .bind(job.organization_id.as_uuid())
            .bind(job.recipient_id.as_uuid())
            .bind(&job.recipient_email)
            .bind(&job.recipient_name)
            .bind(&job.subject)
            .bind(&job.body_html)
            .bind(&job.body_text)
            .bind(&job.personalization)
            .bind(job.scheduled_for)
            .bind(job.priority)
            .bind(job.status.as_str())
            .bind(job.retry_count as i32)
            .bind(job.max_retries as i32)
            .bind(&job.last_error)
            .bind(&job.processing_node)
            .bind(&job.rate_limit_key)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_jobs", &e))?;

            insert_event(
                &mut tx,
                job.id.0,
                *job.campaign_id.as_uuid(),
                JobEventKind::Created,
                None,
                job.created_at,
            )
            .await
            .map_err(|e| map_sqlx_error("insert_jobs", &e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_jobs", &e))
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM delivery_jobs WHERE id = $1"
        ))
        .bind(job_id.0)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", &e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(node = %node), err)]
    async fn claim_due(
        &self,
        limit: usize,
        node: &str,
        organization_id: Option<OrganizationId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_due", &e))?;

        let rows = sqlx::query(&format!(
            r#"
            UPDATE delivery_jobs
            SET status = 'processing', processing_node = $1, updated_at = $2
            WHERE id IN (
                SELECT id FROM delivery_jobs
                WHERE status = 'pending'
                  AND scheduled_for <= $2
                  AND ($3::uuid IS NULL OR organization_id = $3)
                ORDER BY priority DESC, scheduled_for ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(node)
        .bind(now)
        .bind(organization_id.map(|o| *o.as_uuid()))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_due", &e))?;

        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // UPDATE ... RETURNING does not preserve the subquery order.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_for.cmp(&b.scheduled_for))
        });

        for job in &jobs {
            insert_event(
                &mut tx,
                job.id.0,
                *job.campaign_id.as_uuid(),
                JobEventKind::Claimed,
                Some(node),
                now,
            )
            .await
            .map_err(|e| map_sqlx_error("claim_due", &e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_due", &e))?;
        Ok(jobs)
    }

    async fn release(&self, job_ids: &[JobId], now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = job_ids.iter().map(|id| id.0).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("release", &e))?;

        let rows = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'pending', processing_node = NULL, updated_at = $2
            WHERE id = ANY($1) AND status = 'processing'
            RETURNING id, campaign_id
            "#,
        )
        .bind(&ids)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("release", &e))?;

        for row in &rows {
            let job_id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("release", &e))?;
            let campaign_id: Uuid = row
                .try_get("campaign_id")
                .map_err(|e| map_sqlx_error("release", &e))?;
            insert_event(&mut tx, job_id, campaign_id, JobEventKind::Released, None, now)
                .await
                .map_err(|e| map_sqlx_error("release", &e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("release", &e))?;
        Ok(rows.len() as u64)
    }

    async fn mark_sent(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("mark_sent", &e))?;
        let row = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'sent', processing_node = NULL, updated_at = $2
            WHERE id = $1 AND status = 'processing'
            RETURNING campaign_id
            "#,
        )
        .bind(job_id.0)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_sent", &e))?;

        finish_transition(tx, "mark_sent", row, job_id, JobEventKind::Sent, None, now).await
    }

    async fn schedule_retry(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("schedule_retry", &e))?;
        let row = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'pending', scheduled_for = $2, retry_count = retry_count + 1,
                last_error = $3, processing_node = NULL, updated_at = $4
            WHERE id = $1 AND status = 'processing' AND retry_count < max_retries
            RETURNING campaign_id
            "#,
        )
        .bind(job_id.0)
        .bind(at)
        .bind(error)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("schedule_retry", &e))?;

        finish_transition(
            tx,
            "schedule_retry",
            row,
            job_id,
            JobEventKind::RetryScheduled,
            Some(error),
            now,
        )
        .await
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("mark_failed", &e))?;
        let row = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'failed', last_error = $2, processing_node = NULL, updated_at = $3
            WHERE id = $1 AND status = 'processing'
            RETURNING campaign_id
            "#,
        )
        .bind(job_id.0)
        .bind(error)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", &e))?;

        finish_transition(
            tx,
            "mark_failed",
            row,
            job_id,
            JobEventKind::Failed,
            Some(error),
            now,
        )
        .await
    }

    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("cancel_job", &e))?;
        let row = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'cancelled', updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING campaign_id
            "#,
        )
        .bind(job_id.0)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_job", &e))?;

        finish_transition(
            tx,
            "cancel_job",
            row,
            job_id,
            JobEventKind::Cancelled,
            None,
            now,
        )
        .await
    }

    async fn cancel_pending(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("cancel_pending", &e))?;

        let rows = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'cancelled', updated_at = $2
            WHERE campaign_id = $1 AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(campaign_id.as_uuid())
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("cancel_pending", &e))?;

        for row in &rows {
            let job_id: Uuid = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("cancel_pending", &e))?;
            insert_event(
                &mut tx,
                job_id,
                *campaign_id.as_uuid(),
                JobEventKind::Cancelled,
                None,
                now,
            )
            .await
            .map_err(|e| map_sqlx_error("cancel_pending", &e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("cancel_pending", &e))?;
        Ok(rows.len() as u64)
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(
        &self,
        stuck_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("requeue_stale", &e))?;

        let rows = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'pending', processing_node = NULL, updated_at = $2
            WHERE status = 'processing' AND updated_at < $1
            RETURNING id, campaign_id
            "#,
        )
        .bind(stuck_since)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", &e))?;

        for row in &rows {
            let job_id: Uuid = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("requeue_stale", &e))?;
            let campaign_id: Uuid = row
                .try_get("campaign_id")
                .map_err(|e| map_sqlx_error("requeue_stale", &e))?;
            insert_event(&mut tx, job_id, campaign_id, JobEventKind::Requeued, None, now)
                .await
                .map_err(|e| map_sqlx_error("requeue_stale", &e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("requeue_stale", &e))?;
        Ok(rows.len() as u64)
    }

    async fn retry_failed_job(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("retry_failed_job", &e))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE delivery_jobs
            SET status = 'pending', retry_count = 0, scheduled_for = $2,
                last_error = NULL, updated_at = $2
            WHERE id = $1 AND status = 'failed'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("retry_failed_job", &e))?;

        let Some(row) = row else {
            // Distinguish a missing job from one in the wrong status.
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM delivery_jobs WHERE id = $1")
                    .bind(job_id.0)
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("retry_failed_job", &e))?;
            return match status {
                Some(status) => Err(JobStoreError::InvalidTransition(format!(
                    "job {job_id} is {status}, not failed"
                ))),
                None => Err(JobStoreError::NotFound(job_id)),
            };
        };

        let job = job_from_row(&row)?;
        insert_event(
            &mut tx,
            job.id.0,
            *job.campaign_id.as_uuid(),
            JobEventKind::Requeued,
            Some("manual retry"),
            now,
        )
        .await
        .map_err(|e| map_sqlx_error("retry_failed_job", &e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("retry_failed_job", &e))?;
        Ok(job)
    }

    async fn campaign_stats(
        &self,
        campaign_id: CampaignId,
    ) -> Result<CampaignJobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM delivery_jobs
            WHERE campaign_id = $1
            GROUP BY status
            "#,
        )
        .bind(campaign_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("campaign_stats", &e))?;

        let mut stats = CampaignJobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("campaign_stats", &e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("campaign_stats", &e))?;
            let count = count.max(0) as u64;
            stats.total += count;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending += count,
                Some(JobStatus::Processing) => stats.processing += count,
                Some(JobStatus::Sent) => stats.sent += count,
                Some(JobStatus::Failed) => stats.failed += count,
                Some(JobStatus::Cancelled) => stats.cancelled += count,
                None => {
                    return Err(JobStoreError::Storage(format!(
                        "unknown job status: {status}"
                    )));
                }
            }
        }
        Ok(stats)
    }

    async fn failed_jobs(&self, query: FailedJobsQuery) -> Result<Vec<Job>, JobStoreError> {
        let limit = query.limit.unwrap_or(100) as i64;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM delivery_jobs
            WHERE status = 'failed'
              AND ($1::uuid IS NULL OR campaign_id = $1)
              AND ($2::uuid IS NULL OR organization_id = $2)
            ORDER BY updated_at DESC
            LIMIT $3
            "#
        ))
        .bind(query.campaign_id.map(|c| *c.as_uuid()))
        .bind(query.organization_id.map(|o| *o.as_uuid()))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("failed_jobs", &e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn upsert_schedule(&self, schedule: &CampaignSchedule) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO campaign_schedules (
                campaign_id, schedule_type, window_start, window_end, timezone,
                daily_limit, hourly_limit, start_date, end_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (campaign_id) DO UPDATE SET
                schedule_type = EXCLUDED.schedule_type,
                window_start = EXCLUDED.window_start,
                window_end = EXCLUDED.window_end,
                timezone = EXCLUDED.timezone,
                daily_limit = EXCLUDED.daily_limit,
                hourly_limit = EXCLUDED.hourly_limit,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date
            "#,
        )
        .bind(schedule.campaign_id.as_uuid())
        .bind(schedule.kind.as_str())
        .bind(schedule.window_start)
        .bind(schedule.window_end)
        .bind(&schedule.timezone)
        .bind(schedule.daily_limit.map(|l| l as i32))
        .bind(schedule.hourly_limit as i32)
        .bind(schedule.start_date)
        .bind(schedule.end_date)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_schedule", &e))?;
        Ok(())
    }

    async fn get_schedule(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<CampaignSchedule>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT campaign_id, schedule_type, window_start, window_end, timezone,
                   daily_limit, hourly_limit, start_date, end_date
            FROM campaign_schedules
            WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_schedule", &e))?;

        let Some(row) = row else { return Ok(None) };
        let field = |e: sqlx::Error| JobStoreError::Storage(format!("schedule row: {e}"));

        let kind_raw: String = row.try_get("schedule_type").map_err(field)?;
        let kind = ScheduleKind::parse(&kind_raw).ok_or_else(|| {
            JobStoreError::Storage(format!("unknown schedule type: {kind_raw}"))
        })?;
        let daily_limit: Option<i32> = row.try_get("daily_limit").map_err(field)?;
        let hourly_limit: i32 = row.try_get("hourly_limit").map_err(field)?;

        Ok(Some(CampaignSchedule {
            campaign_id: CampaignId::from_uuid(row.try_get("campaign_id").map_err(field)?),
            kind,
            window_start: row.try_get("window_start").map_err(field)?,
            window_end: row.try_get("window_end").map_err(field)?,
            timezone: row.try_get("timezone").map_err(field)?,
            daily_limit: daily_limit.map(|l| l.max(0) as u32),
            hourly_limit: hourly_limit.max(0) as u32,
            start_date: row.try_get("start_date").map_err(field)?,
            end_date: row.try_get("end_date").map_err(field)?,
        }))
    }

    async fn job_events(&self, job_id: JobId) -> Result<Vec<JobEvent>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, campaign_id, event_type, detail, recorded_at
            FROM job_events
            WHERE job_id = $1
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_events", &e))?;

        let field = |e: sqlx::Error| JobStoreError::Storage(format!("event row: {e}"));
        rows.into_iter()
            .map(|row| {
                let kind_raw: String = row.try_get("event_type").map_err(field)?;
                let kind = JobEventKind::parse(&kind_raw).ok_or_else(|| {
                    JobStoreError::Storage(format!("unknown event type: {kind_raw}"))
                })?;
                Ok(JobEvent {
                    id: row.try_get("id").map_err(field)?,
                    job_id: JobId::from_uuid(row.try_get("job_id").map_err(field)?),
                    campaign_id: CampaignId::from_uuid(
                        row.try_get("campaign_id").map_err(field)?,
                    ),
                    kind,
                    detail: row.try_get("detail").map_err(field)?,
                    recorded_at: row.try_get("recorded_at").map_err(field)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RateLimitStore for PostgresStore {
    async fn record_outcome(
        &self,
        organization_id: OrganizationId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let sent_inc: i64 = if success { 1 } else { 0 };
        let failed_inc: i64 = 1 - sent_inc;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("record_outcome", &e))?;

        for kind in [WindowKind::Hour, WindowKind::Day] {
            sqlx::query(
                r#"
                INSERT INTO rate_limit_counters
                    (organization_id, window_start, window_type, sent_count, failed_count)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (organization_id, window_start, window_type) DO UPDATE SET
                    sent_count = rate_limit_counters.sent_count + EXCLUDED.sent_count,
                    failed_count = rate_limit_counters.failed_count + EXCLUDED.failed_count
                "#,
            )
            .bind(organization_id.as_uuid())
            .bind(kind.bucket_start(at))
            .bind(kind.as_str())
            .bind(sent_inc)
            .bind(failed_inc)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_outcome", &e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("record_outcome", &e))
    }

    async fn usage(
        &self,
        organization_id: OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT window_type, COALESCE(SUM(sent_count + failed_count), 0)::bigint AS used
            FROM rate_limit_counters
            WHERE organization_id = $1
              AND ((window_type = 'hour' AND window_start > $2)
                OR (window_type = 'day' AND window_start > $3))
            GROUP BY window_type
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(now - WindowKind::Hour.length())
        .bind(now - WindowKind::Day.length())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("usage", &e))?;

        let mut usage = UsageSnapshot::default();
        for row in rows {
            let kind: String = row
                .try_get("window_type")
                .map_err(|e| map_sqlx_error("usage", &e))?;
            let used: i64 = row
                .try_get("used")
                .map_err(|e| map_sqlx_error("usage", &e))?;
            match WindowKind::parse(&kind) {
                Some(WindowKind::Hour) => usage.hourly_used = used.max(0) as u64,
                Some(WindowKind::Day) => usage.daily_used = used.max(0) as u64,
                None => {
                    return Err(JobStoreError::Storage(format!(
                        "unknown window type: {kind}"
                    )));
                }
            }
        }
        Ok(usage)
    }
}

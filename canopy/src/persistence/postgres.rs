use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::alerts::{Alert, AlertId, AlertStore};
use crate::error::{AlertError, TransitionError};
use crate::job::{AnalysisJob, FieldId, JobHandle, JobId, JobResult, JobStatus, OrganizationId};
use crate::lease::{ClaimRequest, JobLease, LeaseId};
use crate::observation::{Observation, ObservationId, ObservationStore};
use crate::orchestrator::reason;
use crate::queue::{JobCompletion, JobQueue, QueueName, QueueSnapshot};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS canopy_analysis_jobs (
        id UUID PRIMARY KEY,
        field_id UUID NOT NULL,
        organization_id UUID NOT NULL,
        queue TEXT NOT NULL,
        status TEXT NOT NULL,
        request JSONB NOT NULL,
        context JSONB NOT NULL,
        result JSONB,
        error_message TEXT,
        cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
        lease_id UUID,
        lease_owner TEXT,
        claimed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS canopy_analysis_jobs_one_running_per_field
        ON canopy_analysis_jobs (field_id)
        WHERE status = 'RUNNING'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS canopy_analysis_jobs_claimable
        ON canopy_analysis_jobs (queue, created_at)
        WHERE status = 'QUEUED'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS canopy_observations (
        id UUID PRIMARY KEY,
        field_id UUID NOT NULL,
        job_id UUID NOT NULL UNIQUE,
        scene_id TEXT NOT NULL,
        observed_on DATE NOT NULL,
        status TEXT NOT NULL,
        cloud_cover DOUBLE PRECISION NOT NULL,
        valid_pixel_ratio DOUBLE PRECISION NOT NULL,
        indices_native JSONB NOT NULL,
        indices_sr JSONB NOT NULL,
        sr_model JSONB,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS canopy_observations_timeline
        ON canopy_observations (field_id, observed_on DESC, created_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS canopy_alerts (
        id UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        field_id UUID,
        severity TEXT NOT NULL,
        category TEXT NOT NULL,
        message TEXT NOT NULL,
        metadata JSONB NOT NULL,
        acknowledged_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

const JOB_COLUMNS: &str = "id, queue, status, request, context, result, error_message, \
                           cancel_requested, created_at, updated_at";

/// PostgreSQL-backed job queue, observation timeline and alert store.
///
/// Claims lock the oldest eligible row with `FOR UPDATE SKIP LOCKED`; a
/// partial unique index keeps at most one RUNNING job per field even when
/// two workers race on different queues.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the tables and indexes when missing.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_job(&self, job_id: JobId) -> anyhow::Result<Option<AnalysisJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM canopy_analysis_jobs WHERE id = $1"
        ))
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

fn text_of<T: Serialize>(value: &T) -> anyhow::Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Err(anyhow::anyhow!("expected a string encoding, got {other}")),
    }
}

fn from_text<T: DeserializeOwned>(text: String) -> anyhow::Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(text))?)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}

fn job_from_row(row: &PgRow) -> anyhow::Result<AnalysisJob> {
    let status: String = row.try_get("status")?;
    let queue: String = row.try_get("queue")?;
    let result: Option<serde_json::Value> = row.try_get("result")?;
    Ok(AnalysisJob {
        id: JobId(row.try_get("id")?),
        request: serde_json::from_value(row.try_get("request")?)?,
        context: serde_json::from_value(row.try_get("context")?)?,
        queue: QueueName::parse(&queue)
            .ok_or_else(|| anyhow::anyhow!("invalid queue value: {queue}"))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("invalid status value: {status}"))?,
        result: result.map(serde_json::from_value).transpose()?,
        error_message: row.try_get("error_message")?,
        cancel_requested: row.try_get("cancel_requested")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn observation_from_row(row: &PgRow) -> anyhow::Result<Observation> {
    let sr_model: Option<serde_json::Value> = row.try_get("sr_model")?;
    let observed_on: NaiveDate = row.try_get("observed_on")?;
    Ok(Observation {
        id: ObservationId(row.try_get("id")?),
        field_id: FieldId(row.try_get("field_id")?),
        job_id: JobId(row.try_get("job_id")?),
        scene_id: row.try_get("scene_id")?,
        observed_on,
        status: from_text(row.try_get("status")?)?,
        cloud_cover: row.try_get("cloud_cover")?,
        valid_pixel_ratio: row.try_get("valid_pixel_ratio")?,
        indices_native: serde_json::from_value(row.try_get("indices_native")?)?,
        indices_sr: serde_json::from_value(row.try_get("indices_sr")?)?,
        sr_model: sr_model.map(serde_json::from_value).transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

fn alert_from_row(row: &PgRow) -> anyhow::Result<Alert> {
    let field_id: Option<Uuid> = row.try_get("field_id")?;
    Ok(Alert {
        id: AlertId(row.try_get("id")?),
        organization_id: OrganizationId(row.try_get("organization_id")?),
        field_id: field_id.map(FieldId),
        severity: from_text(row.try_get("severity")?)?,
        category: from_text(row.try_get("category")?)?,
        message: row.try_get("message")?,
        metadata: row.try_get("metadata")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl JobQueue for PostgresStore {
    async fn enqueue(&self, job: AnalysisJob) -> anyhow::Result<JobHandle> {
        if job.status != JobStatus::Queued {
            anyhow::bail!("job {} enqueued with status {}", job.id, job.status);
        }
        sqlx::query(
            r#"
            INSERT INTO canopy_analysis_jobs (
                id, field_id, organization_id, queue, status, request, context,
                result, error_message, cancel_requested, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'QUEUED', $5, $6, NULL, NULL, FALSE, $7, $8)
            "#,
        )
        .bind(job.id.0)
        .bind(job.field_id().0)
        .bind(job.organization_id().0)
        .bind(job.queue.as_str())
        .bind(serde_json::to_value(&job.request)?)
        .bind(serde_json::to_value(job.context)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(JobHandle {
            id: job.id,
            queue: job.queue,
        })
    }

    async fn claim(
        &self,
        request: ClaimRequest,
    ) -> anyhow::Result<Option<JobLease>> {
        let lease_id = LeaseId::new();
        let claimed = sqlx::query(&format!(
            r#"
            UPDATE canopy_analysis_jobs
            SET status = 'RUNNING',
                lease_id = $1,
                lease_owner = $2,
                claimed_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT candidate.id
                FROM canopy_analysis_jobs candidate
                WHERE candidate.queue = $3
                  AND candidate.status = 'QUEUED'
                  AND NOT candidate.cancel_requested
                  AND NOT EXISTS (
                      SELECT 1 FROM canopy_analysis_jobs running
                      WHERE running.field_id = candidate.field_id
                        AND running.status = 'RUNNING'
                  )
                ORDER BY candidate.created_at ASC, candidate.id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
              AND status = 'QUEUED'
            RETURNING {JOB_COLUMNS}, claimed_at
            "#
        ))
        .bind(lease_id.0)
        .bind(&request.worker_id)
        .bind(request.queue.as_str())
        .fetch_optional(&self.pool)
        .await;

        let row = match claimed {
            Ok(row) => row,
            Err(err) if is_unique_violation(&err) => {
                debug!(
                    queue = request.queue.as_str(),
                    "claim lost a same-field race; retrying on next poll"
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let Some(row) = row else {
            return Ok(None);
        };

        let job = job_from_row(&row)?;
        let claimed_at: DateTime<Utc> = row.try_get("claimed_at")?;
        Ok(Some(JobLease {
            job_id: job.id,
            lease_id,
            job,
            worker_id: request.worker_id,
            claimed_at,
        }))
    }

    async fn complete(
        &self,
        lease: &JobLease,
        completion: JobCompletion,
    ) -> anyhow::Result<AnalysisJob> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT status, lease_id
            FROM canopy_analysis_jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(lease.job_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(TransitionError::UnknownJob(lease.job_id))?;

        let status: String = row.try_get("status")?;
        let current = JobStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("invalid status value: {status}"))?;
        let holder: Option<Uuid> = row.try_get("lease_id")?;

        if holder != Some(lease.lease_id.0) {
            drop(tx);
            if current.is_terminal() {
                return Err(TransitionError::Illegal {
                    job_id: lease.job_id,
                    from: current,
                    to: completion.status,
                }
                .into());
            }
            return Err(TransitionError::NotLeaseOwner {
                job_id: lease.job_id,
                worker_id: lease.worker_id.clone(),
            }
            .into());
        }
        if !completion.status.is_terminal()
            || !current.can_transition_to(completion.status)
        {
            drop(tx);
            return Err(TransitionError::Illegal {
                job_id: lease.job_id,
                from: current,
                to: completion.status,
            }
            .into());
        }

        let result = completion
            .result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE canopy_analysis_jobs
            SET status = $2,
                result = $3,
                error_message = $4,
                lease_id = NULL,
                lease_owner = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(lease.job_id.0)
        .bind(completion.status.as_str())
        .bind(result)
        .bind(&completion.error_message)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(job_id = %lease.job_id, status = completion.status.as_str(), "job completed");
        job_from_row(&row)
    }

    async fn cancel(&self, job_id: JobId) -> anyhow::Result<bool> {
        let cancelled = sqlx::query(
            r#"
            UPDATE canopy_analysis_jobs
            SET status = 'FAILED',
                cancel_requested = TRUE,
                error_message = $2,
                result = $3,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'QUEUED'
            "#,
        )
        .bind(job_id.0)
        .bind(reason::CANCELLED)
        .bind(serde_json::to_value(JobResult::with_reason(reason::CANCELLED))?)
        .execute(&self.pool)
        .await?;
        if cancelled.rows_affected() > 0 {
            return Ok(true);
        }

        let flagged = sqlx::query(
            r#"
            UPDATE canopy_analysis_jobs
            SET cancel_requested = TRUE,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'RUNNING'
            "#,
        )
        .bind(job_id.0)
        .execute(&self.pool)
        .await?;
        Ok(flagged.rows_affected() > 0)
    }

    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<AnalysisJob>> {
        self.fetch_job(job_id).await
    }

    async fn jobs_for_field(
        &self,
        field_id: FieldId,
    ) -> anyhow::Result<Vec<AnalysisJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM canopy_analysis_jobs
            WHERE field_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(field_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn queue_depth(&self, queue: QueueName) -> anyhow::Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint
            FROM canopy_analysis_jobs
            WHERE queue = $1
              AND status = 'QUEUED'
            "#,
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT queue, status, COUNT(*)::bigint AS count
            FROM canopy_analysis_jobs
            GROUP BY queue, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = QueueSnapshot::new(Utc::now());
        for queue in QueueName::ALL {
            snapshot.entry_mut(queue);
        }
        for row in rows {
            let queue: String = row.try_get("queue")?;
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let (Some(queue), Some(status)) =
                (QueueName::parse(&queue), JobStatus::parse(&status))
            else {
                warn!(%queue, %status, "skipping unknown queue/status in snapshot");
                continue;
            };
            let entry = snapshot.entry_mut(queue);
            for _ in 0..count.max(0) {
                entry.record(status);
            }
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl ObservationStore for PostgresStore {
    async fn insert(&self, observation: &Observation) -> anyhow::Result<()> {
        let sr_model = observation
            .sr_model
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let res = sqlx::query(
            r#"
            INSERT INTO canopy_observations (
                id, field_id, job_id, scene_id, observed_on, status, cloud_cover,
                valid_pixel_ratio, indices_native, indices_sr, sr_model, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(observation.id.0)
        .bind(observation.field_id.0)
        .bind(observation.job_id.0)
        .bind(&observation.scene_id)
        .bind(observation.observed_on)
        .bind(text_of(&observation.status)?)
        .bind(observation.cloud_cover)
        .bind(observation.valid_pixel_ratio)
        .bind(serde_json::to_value(&observation.indices_native)?)
        .bind(serde_json::to_value(&observation.indices_sr)?)
        .bind(sr_model)
        .bind(observation.created_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(anyhow::anyhow!(
                "job {} already has an observation",
                observation.job_id
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn recent_for_field(
        &self,
        field_id: FieldId,
        limit: usize,
    ) -> anyhow::Result<Vec<Observation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, field_id, job_id, scene_id, observed_on, status, cloud_cover,
                   valid_pixel_ratio, indices_native, indices_sr, sr_model, created_at
            FROM canopy_observations
            WHERE field_id = $1
            ORDER BY observed_on DESC, created_at DESC
            LIMIT $2
            "#,
        )
        .bind(field_id.0)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    async fn clear_field(&self, field_id: FieldId) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM canopy_observations WHERE field_id = $1")
            .bind(field_id.0)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl AlertStore for PostgresStore {
    async fn insert(&self, alert: &Alert) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO canopy_alerts (
                id, organization_id, field_id, severity, category, message,
                metadata, acknowledged_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(alert.id.0)
        .bind(alert.organization_id.0)
        .bind(alert.field_id.map(|id| id.0))
        .bind(text_of(&alert.severity)?)
        .bind(alert.category.as_str())
        .bind(&alert.message)
        .bind(&alert.metadata)
        .bind(alert.acknowledged_at)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn acknowledge(
        &self,
        alert_id: AlertId,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Alert> {
        let row = sqlx::query(
            r#"
            UPDATE canopy_alerts
            SET acknowledged_at = $2
            WHERE id = $1
              AND acknowledged_at IS NULL
            RETURNING id, organization_id, field_id, severity, category, message,
                      metadata, acknowledged_at, created_at
            "#,
        )
        .bind(alert_id.0)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return alert_from_row(&row);
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM canopy_alerts WHERE id = $1)",
        )
        .bind(alert_id.0)
        .fetch_one(&self.pool)
        .await?;
        if exists {
            Err(AlertError::AlreadyAcknowledged(alert_id.to_string()).into())
        } else {
            Err(AlertError::NotFound(alert_id.to_string()).into())
        }
    }

    async fn list(
        &self,
        organization_id: OrganizationId,
        unacknowledged_only: bool,
    ) -> anyhow::Result<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT id, organization_id, field_id, severity, category, message,
                   metadata, acknowledged_at, created_at
            FROM canopy_alerts
            WHERE organization_id = $1
              AND ($2 = FALSE OR acknowledged_at IS NULL)
            ORDER BY created_at DESC
            "#,
        )
        .bind(organization_id.0)
        .bind(unacknowledged_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alert_from_row).collect()
    }
}

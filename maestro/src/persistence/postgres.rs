use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::{JobId, JobRecord, JobStatus, WorkType};
use crate::store::{JobMutation, JobStore};

/// PostgreSQL-backed job store.
///
/// `compare_and_transition` is one conditional `UPDATE ... WHERE id =
/// $1 AND status = ANY($expected)` — the database's row-level
/// atomicity is the CAS guarantee. The one-active-job-per-key
/// invariant is enforced by a partial unique index over the active
/// statuses, so even two orchestrator instances that both miss the
/// pre-insert lookup cannot create two active jobs.
#[derive(Debug)]
pub struct PostgresJobStore<W: WorkType> {
    pool: PgPool,
    _phantom: std::marker::PhantomData<W>,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS maestro_jobs (
        id UUID PRIMARY KEY,
        work_type TEXT NOT NULL,
        target_entity_id UUID NOT NULL,
        idempotency_key TEXT NOT NULL,
        status TEXT NOT NULL,
        current_step TEXT,
        checkpoint_data JSONB NOT NULL DEFAULT '{}'::jsonb,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        worker_instance_id TEXT,
        retry_count SMALLINT NOT NULL DEFAULT 0,
        max_retries SMALLINT NOT NULL DEFAULT 3,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        last_heartbeat TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        error_message TEXT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS maestro_jobs_active_key
    ON maestro_jobs (idempotency_key)
    WHERE status IN ('pending','running','retrying','suspended')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS maestro_jobs_entity
    ON maestro_jobs (target_entity_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS maestro_jobs_heartbeat
    ON maestro_jobs (status, last_heartbeat)
    "#,
];

impl<W: WorkType> PostgresJobStore<W> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the jobs table and its indexes if absent.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| OrchestratorError::Store(e.into()))?;
        }
        Ok(())
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord<W>> {
        let work_type_str: String = row
            .try_get("work_type")
            .map_err(|e| OrchestratorError::Store(e.into()))?;
        let work_type = W::parse(&work_type_str).ok_or_else(|| {
            OrchestratorError::Store(anyhow::anyhow!(
                "unknown work_type in store: {work_type_str}"
            ))
        })?;

        let status_str: String = row
            .try_get("status")
            .map_err(|e| OrchestratorError::Store(e.into()))?;
        let status = JobStatus::parse(&status_str).ok_or_else(|| {
            OrchestratorError::Store(anyhow::anyhow!(
                "unknown status in store: {status_str}"
            ))
        })?;

        let get = |e: sqlx::Error| OrchestratorError::Store(e.into());

        let checkpoint: Value =
            row.try_get("checkpoint_data").map_err(get)?;
        let metadata: Value = row.try_get("metadata").map_err(get)?;
        let retry_count: i16 = row.try_get("retry_count").map_err(get)?;
        let max_retries: i16 = row.try_get("max_retries").map_err(get)?;

        Ok(JobRecord {
            id: JobId(row.try_get::<Uuid, _>("id").map_err(get)?),
            work_type,
            target_entity_id: row
                .try_get("target_entity_id")
                .map_err(get)?,
            idempotency_key: row
                .try_get("idempotency_key")
                .map_err(get)?,
            status,
            current_step: row.try_get("current_step").map_err(get)?,
            checkpoint_data: checkpoint
                .as_object()
                .cloned()
                .unwrap_or_default(),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            worker_instance_id: row
                .try_get("worker_instance_id")
                .map_err(get)?,
            retry_count: retry_count.max(0) as u16,
            max_retries: max_retries.max(0) as u16,
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .map_err(get)?,
            started_at: row.try_get("started_at").map_err(get)?,
            last_heartbeat: row.try_get("last_heartbeat").map_err(get)?,
            completed_at: row.try_get("completed_at").map_err(get)?,
            error_message: row.try_get("error_message").map_err(get)?,
        })
    }

    fn statuses_to_strings(statuses: &[JobStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.as_str().to_string()).collect()
    }
}

#[async_trait]
impl<W: WorkType> JobStore<W> for PostgresJobStore<W> {
    async fn insert(&self, job: JobRecord<W>) -> Result<JobRecord<W>> {
        let result = sqlx::query(
            r#"
            INSERT INTO maestro_jobs (
                id, work_type, target_entity_id, idempotency_key, status,
                current_step, checkpoint_data, metadata, worker_instance_id,
                retry_count, max_retries, created_at, started_at,
                last_heartbeat, completed_at, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.0)
        .bind(job.work_type.as_str())
        .bind(job.target_entity_id)
        .bind(&job.idempotency_key)
        .bind(job.status.as_str())
        .bind(&job.current_step)
        .bind(Value::Object(job.checkpoint_data.clone()))
        .bind(Value::Object(job.metadata.clone()))
        .bind(&job.worker_instance_id)
        .bind(job.retry_count as i16)
        .bind(job.max_retries as i16)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.last_heartbeat)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(job_id = %job.id, key = %job.idempotency_key, "job inserted");
                Ok(job)
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some("23505") =>
            {
                Err(OrchestratorError::DuplicateKey(job.idempotency_key))
            }
            Err(e) => Err(OrchestratorError::Store(e.into())),
        }
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord<W>>> {
        let row = sqlx::query("SELECT * FROM maestro_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Store(e.into()))?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn find_active_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<JobRecord<W>>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM maestro_jobs
            WHERE idempotency_key = $1
              AND status IN ('pending','running','retrying','suspended')
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Store(e.into()))?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn compare_and_transition(
        &self,
        id: JobId,
        expected: &[JobStatus],
        mutation: JobMutation,
    ) -> Result<bool> {
        let expected_strs = Self::statuses_to_strings(expected);

        let result = sqlx::query(
            r#"
            UPDATE maestro_jobs
            SET status = $2,
                current_step = COALESCE($3::text, current_step),
                checkpoint_data = checkpoint_data || COALESCE($4::jsonb, '{}'::jsonb),
                metadata = metadata || COALESCE($5::jsonb, '{}'::jsonb),
                worker_instance_id = CASE
                    WHEN $6 THEN NULL
                    ELSE COALESCE($7::text, worker_instance_id)
                END,
                started_at = CASE
                    WHEN $8 THEN COALESCE(started_at, NOW())
                    ELSE started_at
                END,
                last_heartbeat = CASE
                    WHEN $9 THEN GREATEST(COALESCE(last_heartbeat, NOW()), NOW())
                    ELSE last_heartbeat
                END,
                completed_at = CASE WHEN $10 THEN NOW() ELSE completed_at END,
                error_message = CASE
                    WHEN $11 THEN NULL
                    ELSE COALESCE($12::text, error_message)
                END
            WHERE id = $1
              AND status = ANY($13)
            "#,
        )
        .bind(id.0)
        .bind(mutation.status.as_str())
        .bind(&mutation.current_step)
        .bind(mutation.checkpoint_merge.clone().map(Value::Object))
        .bind(mutation.metadata_merge.clone().map(Value::Object))
        .bind(mutation.clear_worker)
        .bind(&mutation.worker_instance_id)
        .bind(mutation.set_started_at)
        .bind(mutation.touch_heartbeat)
        .bind(mutation.set_completed_at)
        .bind(mutation.clear_error)
        .bind(&mutation.error_message)
        .bind(&expected_strs)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Store(e.into()))?;

        if result.rows_affected() > 0 {
            debug!(job_id = %id, to = %mutation.status, "job transitioned");
            return Ok(true);
        }

        // Distinguish "lost the race" from "no such job".
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM maestro_jobs WHERE id = $1)",
        )
        .bind(id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Store(e.into()))?;

        if exists {
            Ok(false)
        } else {
            Err(OrchestratorError::NotFound(id))
        }
    }

    async fn list_by_entity(
        &self,
        target_entity_id: Uuid,
    ) -> Result<Vec<JobRecord<W>>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM maestro_jobs
            WHERE target_entity_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(target_entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Store(e.into()))?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn list_running_with_stale_heartbeat(
        &self,
        ttl: Duration,
    ) -> Result<Vec<JobRecord<W>>> {
        let ttl_ms = ttl.num_milliseconds();

        let rows = sqlx::query(
            r#"
            SELECT * FROM maestro_jobs
            WHERE status = 'running'
              AND last_heartbeat IS NOT NULL
              AND last_heartbeat < NOW() - ($1::bigint) * INTERVAL '1 millisecond'
            "#,
        )
        .bind(ttl_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::Store(e.into()))?;

        rows.iter().map(Self::record_from_row).collect()
    }
}

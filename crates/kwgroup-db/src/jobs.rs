//! Ingestion job queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kwgroup_core::{
    new_v7, EnqueueJobRequest, Error, IngestionJob, JobProgress, JobRepository, JobStatus,
    JobStatusCounts, Result, SweepOutcome,
};

const JOB_COLUMNS: &str = "id, project_id, csv_upload_id, storage_path, source_filename, \
     idempotency_key, status, attempts, error, created_at, started_at, finished_at";

/// PostgreSQL implementation of [`JobRepository`].
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<IngestionJob> {
        let status: String = row.get("status");
        Ok(IngestionJob {
            id: row.get("id"),
            project_id: row.get("project_id"),
            csv_upload_id: row.get("csv_upload_id"),
            storage_path: row.get("storage_path"),
            source_filename: row.get("source_filename"),
            idempotency_key: row.get("idempotency_key"),
            status: status.parse()?,
            attempts: row.get("attempts"),
            error: row.get("error"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        })
    }

    /// Terminal transition guarded on `running`.
    async fn finish(&self, id: Uuid, status: JobStatus, error: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE csv_processing_jobs
             SET status = $1, error = $2, finished_at = $3
             WHERE id = $4 AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let applied = result.rows_affected() > 0;
        if !applied {
            warn!(
                subsystem = "jobs",
                component = "queue",
                job_id = %id,
                target = status.as_str(),
                "Job was no longer running; transition skipped"
            );
        }
        Ok(applied)
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(&self, req: EnqueueJobRequest) -> Result<(IngestionJob, bool)> {
        // ON CONFLICT DO NOTHING makes duplicate uploads race-free; the loser
        // reads the winner's row.
        let inserted = sqlx::query(&format!(
            "INSERT INTO csv_processing_jobs
                 (id, project_id, csv_upload_id, storage_path, source_filename,
                  idempotency_key, status, attempts, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'queued', 0, $7)
             ON CONFLICT (idempotency_key) DO NOTHING
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(req.project_id)
        .bind(req.csv_upload_id)
        .bind(&req.storage_path)
        .bind(&req.source_filename)
        .bind(&req.idempotency_key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if let Some(row) = inserted {
            let job = Self::parse_job_row(row)?;
            info!(
                subsystem = "jobs",
                component = "queue",
                op = "enqueue",
                job_id = %job.id,
                project_id = %job.project_id,
                filename = %job.source_filename,
                "Ingestion job queued"
            );
            return Ok((job, true));
        }

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM csv_processing_jobs WHERE idempotency_key = $1"
        ))
        .bind(&req.idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| {
            Error::Internal(format!(
                "idempotency key {} conflicted but no job row exists",
                req.idempotency_key
            ))
        })?;

        let job = Self::parse_job_row(row)?;
        debug!(
            subsystem = "jobs",
            component = "queue",
            op = "enqueue",
            job_id = %job.id,
            status = job.status.as_str(),
            "Duplicate upload; returning existing job"
        );
        Ok((job, false))
    }

    async fn get(&self, id: Uuid) -> Result<Option<IngestionJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM csv_processing_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn claim_next(&self, project_id: Uuid) -> Result<Option<IngestionJob>> {
        // SKIP LOCKED keeps two claimers from ever receiving the same row.
        let row = sqlx::query(&format!(
            "UPDATE csv_processing_jobs
             SET status = 'running', started_at = $1, finished_at = NULL, error = NULL
             WHERE id = (
                 SELECT id FROM csv_processing_jobs
                 WHERE project_id = $2 AND status = 'queued'
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn mark_succeeded(&self, id: Uuid) -> Result<bool> {
        self.finish(id, JobStatus::Succeeded, None).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        self.finish(id, JobStatus::Failed, Some(error)).await
    }

    async fn counts_by_status(&self, project_id: Uuid) -> Result<JobStatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM csv_processing_jobs
             WHERE project_id = $1 GROUP BY status",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut counts = JobStatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            counts.add(status.parse()?, row.get("n"));
        }
        Ok(counts)
    }

    async fn list_by_status(
        &self,
        project_id: Uuid,
        status: JobStatus,
    ) -> Result<Vec<IngestionJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM csv_processing_jobs
             WHERE project_id = $1 AND status = $2
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(project_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn recovery_sweep(
        &self,
        project_id: Uuid,
        stale_after: Duration,
        max_attempts: i32,
    ) -> Result<SweepOutcome> {
        // Each interrupted run costs one attempt; past the budget the job
        // fails permanently instead of going back to the queue.
        let rows = sqlx::query(
            "UPDATE csv_processing_jobs
             SET attempts = attempts + 1,
                 status = CASE WHEN attempts + 1 > $3 THEN 'failed' ELSE 'queued' END,
                 error = CASE WHEN attempts + 1 > $3 THEN $4 ELSE error END,
                 finished_at = CASE WHEN attempts + 1 > $3 THEN now() ELSE NULL END,
                 started_at = CASE WHEN attempts + 1 > $3 THEN started_at ELSE NULL END
             WHERE project_id = $1
               AND status = 'running'
               AND (started_at IS NULL OR started_at < now() - make_interval(secs => $2))
             RETURNING id, status",
        )
        .bind(project_id)
        .bind(stale_after.as_secs_f64())
        .bind(max_attempts)
        .bind(kwgroup_core::defaults::JOB_ABANDONED_ERROR)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut outcome = SweepOutcome::default();
        for row in rows {
            let id: Uuid = row.get("id");
            let status: String = row.get("status");
            match status.parse::<JobStatus>()? {
                JobStatus::Failed => outcome.failed.push(id),
                _ => outcome.requeued.push(id),
            }
        }

        if !outcome.is_empty() {
            warn!(
                subsystem = "jobs",
                component = "queue",
                op = "recovery_sweep",
                project_id = %project_id,
                requeued = outcome.requeued.len(),
                failed = outcome.failed.len(),
                "Recovered abandoned ingestion jobs"
            );
        }
        Ok(outcome)
    }

    async fn fail_pending(&self, project_id: Uuid, error: &str) -> Result<i64> {
        let result = sqlx::query(
            "UPDATE csv_processing_jobs
             SET status = 'failed', error = $2, finished_at = $3
             WHERE project_id = $1 AND status IN ('queued', 'running')",
        )
        .bind(project_id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() as i64)
    }

    async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<()> {
        sqlx::query(
            "INSERT INTO csv_processing_progress
                 (job_id, total_rows, processed_rows, skipped_rows, duplicate_rows,
                  blocked_rows, inserted_rows, percent, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (job_id) DO UPDATE SET
                 total_rows = EXCLUDED.total_rows,
                 processed_rows = EXCLUDED.processed_rows,
                 skipped_rows = EXCLUDED.skipped_rows,
                 duplicate_rows = EXCLUDED.duplicate_rows,
                 blocked_rows = EXCLUDED.blocked_rows,
                 inserted_rows = EXCLUDED.inserted_rows,
                 percent = EXCLUDED.percent,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(job_id)
        .bind(progress.total_rows)
        .bind(progress.processed_rows)
        .bind(progress.skipped_rows)
        .bind(progress.duplicate_rows)
        .bind(progress.blocked_rows)
        .bind(progress.inserted_rows)
        .bind(progress.percent())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_progress(&self, job_id: Uuid) -> Result<Option<JobProgress>> {
        let row = sqlx::query(
            "SELECT total_rows, processed_rows, skipped_rows, duplicate_rows,
                    blocked_rows, inserted_rows
             FROM csv_processing_progress WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| JobProgress {
            total_rows: row.get("total_rows"),
            processed_rows: row.get("processed_rows"),
            skipped_rows: row.get("skipped_rows"),
            duplicate_rows: row.get("duplicate_rows"),
            blocked_rows: row.get("blocked_rows"),
            inserted_rows: row.get("inserted_rows"),
        }))
    }
}

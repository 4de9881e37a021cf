//! Repository traits used by the orchestrator and ingestion worker.
//!
//! PostgreSQL implementations live in `kwgroup-db`; in-memory doubles live in
//! `kwgroup-jobs` behind the `mock` feature.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::grouping::RestructureStats;
use crate::models::*;

// =============================================================================
// JOB STORE
// =============================================================================

/// Persisted queue of ingestion jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a job, or return the existing one for the same idempotency key.
    ///
    /// The flag is true when a new row was created.
    async fn enqueue(&self, req: EnqueueJobRequest) -> Result<(IngestionJob, bool)>;

    /// Fetch a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<IngestionJob>>;

    /// Atomically claim the oldest queued job of a project.
    async fn claim_next(&self, project_id: Uuid) -> Result<Option<IngestionJob>>;

    /// `running -> succeeded`. Returns false if the job was no longer running.
    async fn mark_succeeded(&self, id: Uuid) -> Result<bool>;

    /// `running -> failed`. Returns false if the job was no longer running.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool>;

    /// Job counts per status for a project.
    async fn counts_by_status(&self, project_id: Uuid) -> Result<JobStatusCounts>;

    /// Jobs of a project in one status, oldest first.
    async fn list_by_status(&self, project_id: Uuid, status: JobStatus)
        -> Result<Vec<IngestionJob>>;

    /// Requeue or permanently fail jobs stuck `running` longer than `stale_after`.
    async fn recovery_sweep(
        &self,
        project_id: Uuid,
        stale_after: Duration,
        max_attempts: i32,
    ) -> Result<SweepOutcome>;

    /// Fail every queued or running job of a project. Returns the count.
    async fn fail_pending(&self, project_id: Uuid, error: &str) -> Result<i64>;

    /// Persist incremental progress for a running job.
    async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<()>;

    /// Last persisted progress of a job.
    async fn get_progress(&self, job_id: Uuid) -> Result<Option<JobProgress>>;
}

// =============================================================================
// LEASES
// =============================================================================

/// Per-project advisory lease.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Take the lease if no row exists or the current one has expired.
    async fn try_acquire(&self, project_id: Uuid, owner: &str, ttl: Duration) -> Result<bool>;

    /// Extend the lease if `owner` still holds it. False if ownership was lost.
    async fn renew(&self, project_id: Uuid, owner: &str, ttl: Duration) -> Result<bool>;

    /// Delete the lease if `owner` still holds it.
    async fn release(&self, project_id: Uuid, owner: &str) -> Result<bool>;

    /// True while an unexpired lease exists.
    async fn is_locked(&self, project_id: Uuid) -> Result<bool>;

    /// Current lease row, expired or not.
    async fn get(&self, project_id: Uuid) -> Result<Option<ProjectLease>>;

    /// Delete the lease regardless of owner.
    async fn clear(&self, project_id: Uuid) -> Result<bool>;
}

// =============================================================================
// KEYWORDS
// =============================================================================

/// Keyword storage as seen by the ingestion pipeline.
#[async_trait]
pub trait KeywordRepository: Send + Sync {
    /// Lowercase texts of every keyword already stored for the project.
    async fn existing_texts(&self, project_id: Uuid) -> Result<HashSet<String>>;

    /// Merge operations of the project, applied to new keywords' tokens.
    async fn merge_operations(&self, project_id: Uuid) -> Result<Vec<MergeOperation>>;

    /// Insert a batch and group it, in one transaction.
    ///
    /// Rows are bucketed by token signature and joined with existing keywords
    /// of the same signature, so the result does not depend on batch
    /// boundaries.
    async fn insert_and_group(
        &self,
        project_id: Uuid,
        rows: Vec<NewKeyword>,
    ) -> Result<GroupingSummary>;

    /// Catch-all pass over leftover ungrouped keywords.
    async fn group_remaining(&self, project_id: Uuid) -> Result<RestructureStats>;

    /// Visible keyword counts per status.
    async fn counts(&self, project_id: Uuid) -> Result<KeywordCounts>;
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Audit trail. Fire-and-forget: failures are logged, never returned.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn log(
        &self,
        project_id: Uuid,
        action: &str,
        details: serde_json::Value,
        user: Option<&str>,
    );
}

/// Project existence gate.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn exists(&self, project_id: Uuid) -> Result<bool>;
}

//! Per-project processing leases.
//!
//! Acquisition is one conditional upsert: a row is taken over only when its
//! `lease_expires_at` has passed. Renewal and release are guarded on the
//! owner string, so a worker that lost its lease can never extend or drop
//! someone else's.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use kwgroup_core::{Error, LeaseRepository, ProjectLease, Result};

/// PostgreSQL implementation of [`LeaseRepository`].
pub struct PgLeaseRepository {
    pool: Pool<Postgres>,
}

impl PgLeaseRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

/// Lease ttl in seconds, bound into `make_interval` so expiry is computed
/// on the database clock.
fn ttl_secs(ttl: Duration) -> Result<f64> {
    if ttl.as_secs() > i32::MAX as u64 {
        return Err(Error::Config(format!(
            "lease ttl out of range: {}s",
            ttl.as_secs()
        )));
    }
    Ok(ttl.as_secs_f64())
}

#[async_trait]
impl LeaseRepository for PgLeaseRepository {
    async fn try_acquire(&self, project_id: Uuid, owner: &str, ttl: Duration) -> Result<bool> {
        let acquired = sqlx::query(
            "INSERT INTO project_processing_leases
                 (project_id, lease_owner, lease_expires_at, updated_at)
             VALUES ($1, $2, now() + make_interval(secs => $3), now())
             ON CONFLICT (project_id) DO UPDATE SET
                 lease_owner = EXCLUDED.lease_owner,
                 lease_expires_at = EXCLUDED.lease_expires_at,
                 updated_at = now()
             WHERE project_processing_leases.lease_expires_at < now()
             RETURNING project_id",
        )
        .bind(project_id)
        .bind(owner)
        .bind(ttl_secs(ttl)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .is_some();

        if acquired {
            info!(
                subsystem = "leases",
                project_id = %project_id,
                owner,
                ttl_secs = ttl.as_secs(),
                "Processing lease acquired"
            );
        } else {
            debug!(subsystem = "leases", project_id = %project_id, owner, "Lease held elsewhere");
        }
        Ok(acquired)
    }

    async fn renew(&self, project_id: Uuid, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE project_processing_leases
             SET lease_expires_at = now() + make_interval(secs => $3), updated_at = now()
             WHERE project_id = $1 AND lease_owner = $2",
        )
        .bind(project_id)
        .bind(owner)
        .bind(ttl_secs(ttl)?)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, project_id: Uuid, owner: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM project_processing_leases WHERE project_id = $1 AND lease_owner = $2",
        )
        .bind(project_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let released = result.rows_affected() > 0;
        if released {
            info!(subsystem = "leases", project_id = %project_id, owner, "Processing lease released");
        }
        Ok(released)
    }

    async fn is_locked(&self, project_id: Uuid) -> Result<bool> {
        let locked: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM project_processing_leases
                 WHERE project_id = $1 AND lease_expires_at > now()
             )",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(locked)
    }

    async fn get(&self, project_id: Uuid) -> Result<Option<ProjectLease>> {
        let row = sqlx::query(
            "SELECT project_id, lease_owner, lease_expires_at, updated_at
             FROM project_processing_leases WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| ProjectLease {
            project_id: row.get("project_id"),
            owner: row.get("lease_owner"),
            expires_at: row.get("lease_expires_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn clear(&self, project_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM project_processing_leases WHERE project_id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }
}

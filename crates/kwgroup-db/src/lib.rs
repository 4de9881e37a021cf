//! # kwgroup-db
//!
//! PostgreSQL layer for kwgroup.
//!
//! This crate provides:
//! - Connection pool management
//! - The ingestion job queue and per-project leases
//! - Keyword storage with signature grouping
//! - User grouping operations (regroup, ungroup, block, confirm)
//! - Token merges with an undo journal
//! - The re-tokenizing backfill
//! - A filesystem blob store for uploaded CSV files
//!
//! ## Example
//!
//! ```rust,ignore
//! use kwgroup_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/kwgroup").await?;
//!     let outcome = db.merges.merge(project_id, "footwear", &["shoe".into()], None).await?;
//!     println!("rewrote {} keywords", outcome.rewritten);
//!     Ok(())
//! }
//! ```
pub mod backfill;
pub mod blob_store;
pub mod grouping;
pub mod jobs;
pub mod keywords;
pub mod leases;
pub mod merges;
pub mod pool;
pub mod projects;
pub mod test_fixtures;

use std::sync::Arc;

pub use backfill::PgBackfill;
pub use blob_store::{upload_path, BlobStore, FilesystemBlobStore};
pub use grouping::{PgGroupingEngine, RegroupOutcome};
pub use jobs::PgJobRepository;
pub use keywords::PgKeywordRepository;
pub use leases::PgLeaseRepository;
pub use merges::PgMergeEngine;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use projects::{PgProjectDirectory, TracingActivityLog};

// Re-export core types
pub use kwgroup_core::*;

/// Database handle holding every repository over one pool.
pub struct Database {
    pool: sqlx::Pool<sqlx::Postgres>,
    /// Ingestion job queue.
    pub jobs: PgJobRepository,
    /// Per-project processing leases.
    pub leases: PgLeaseRepository,
    /// Keyword storage used by ingestion.
    pub keywords: PgKeywordRepository,
    /// User grouping operations.
    pub grouping: PgGroupingEngine,
    /// Token merges.
    pub merges: PgMergeEngine,
    /// Re-tokenizing maintenance pass.
    pub backfill: PgBackfill,
    pub projects: PgProjectDirectory,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    ///
    /// User operations are recorded through [`TracingActivityLog`]; use
    /// [`Database::with_activity_log`] to plug in another sink.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        let activity: Arc<dyn ActivityLog> = Arc::new(TracingActivityLog);
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            leases: PgLeaseRepository::new(pool.clone()),
            keywords: PgKeywordRepository::new(pool.clone()),
            grouping: PgGroupingEngine::new(pool.clone()).with_activity_log(activity.clone()),
            merges: PgMergeEngine::new(pool.clone()).with_activity_log(activity),
            backfill: PgBackfill::new(pool.clone()),
            projects: PgProjectDirectory::new(pool.clone()),
            pool,
        }
    }

    /// Route grouping and merge audit entries to `activity`.
    pub fn with_activity_log(mut self, activity: Arc<dyn ActivityLog>) -> Self {
        self.grouping = PgGroupingEngine::new(self.pool.clone()).with_activity_log(activity.clone());
        self.merges = PgMergeEngine::new(self.pool.clone()).with_activity_log(activity);
        self
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Connect to test database (for integration tests).
    #[cfg(test)]
    pub async fn connect_test() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| crate::test_fixtures::DEFAULT_TEST_DATABASE_URL.to_string());
        Self::connect(&database_url).await
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires migrated database"]
    async fn test_connect_and_count_empty_project() {
        let db = Database::connect_test().await.unwrap();
        let project = db.projects.create("empty").await.unwrap();
        assert!(db.projects.exists(project).await.unwrap());

        let counts = db.keywords.counts(project).await.unwrap();
        assert_eq!(counts.total(), 0);
        assert_eq!(db.jobs.counts_by_status(project).await.unwrap().total(), 0);
        assert!(!db.leases.is_locked(project).await.unwrap());

        assert!(db.projects.delete(project).await.unwrap());
        assert!(!db.projects.exists(project).await.unwrap());
    }
}

//! Per-project ingestion orchestrator.
//!
//! One worker at a time processes a project's queue, enforced by the
//! project lease. A run sweeps abandoned jobs, then claims and ingests
//! queued files oldest-first until the queue is empty or the lease is lost,
//! groups any leftover keywords, and releases the lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use kwgroup_core::defaults::{
    EVENT_BUS_CAPACITY, INGEST_BATCH_SIZE, JOB_MAX_ATTEMPTS, JOB_RESET_ERROR, LEASE_TTL_SECS,
};
use kwgroup_core::{
    idempotency_key, new_v7, ActivityLog, EnqueueJobRequest, Error, IngestionJob, JobProgress,
    JobRepository, JobStatus, JobStatusCounts, KeywordCounts, KeywordRepository, LeaseRepository,
    ProjectDirectory, ProjectLease, Result,
};
use kwgroup_db::{
    upload_path, BlobStore, PgJobRepository, PgKeywordRepository, PgLeaseRepository,
    PgProjectDirectory,
};

use crate::ingestion::{BatchGate, IngestionWorker};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Lease time-to-live; also the age after which a running job counts as abandoned.
    pub lease_ttl: Duration,
    /// Recovery-sweep requeues before a stuck job fails permanently.
    pub max_attempts: i32,
    /// Rows per ingestion batch.
    pub batch_size: usize,
    /// Whether uploads start background processing.
    pub enabled: bool,
    /// Lease owner id of this process.
    pub owner: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            max_attempts: JOB_MAX_ATTEMPTS,
            batch_size: INGEST_BATCH_SIZE,
            enabled: true,
            owner: format!("kwgroup-{}", new_v7()),
        }
    }
}

impl OrchestratorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `ORCHESTRATOR_ENABLED` | `true` | Start processing when files are uploaded |
    /// | `LEASE_TTL_SECS` | `120` | Project lease time-to-live |
    /// | `JOB_MAX_ATTEMPTS` | `3` | Requeues before an abandoned job fails |
    /// | `INGEST_BATCH_SIZE` | `200` | Rows per ingestion batch |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("ORCHESTRATOR_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let lease_ttl = std::env::var("LEASE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_ttl);

        let max_attempts = std::env::var("JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults.max_attempts)
            .max(0);

        let batch_size = std::env::var("INGEST_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.batch_size)
            .max(1);

        Self {
            lease_ttl,
            max_attempts,
            batch_size,
            enabled,
            ..defaults
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }
}

/// Event emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    LeaseAcquired { project_id: Uuid, owner: String },
    /// The lease was taken or cleared while running; no new jobs are claimed.
    LeaseLost { project_id: Uuid },
    JobsRecovered {
        project_id: Uuid,
        requeued: usize,
        failed: usize,
    },
    JobStarted { project_id: Uuid, job_id: Uuid },
    JobProgress {
        project_id: Uuid,
        job_id: Uuid,
        percent: i32,
        processed_rows: i64,
        total_rows: i64,
    },
    JobSucceeded {
        project_id: Uuid,
        job_id: Uuid,
        inserted: i64,
    },
    JobFailed {
        project_id: Uuid,
        job_id: Uuid,
        error: String,
    },
    /// Infrastructure failure; the job stays running until the recovery sweep.
    JobInterrupted {
        project_id: Uuid,
        job_id: Uuid,
        error: String,
    },
    RunFinished { project_id: Uuid, summary: RunSummary },
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub succeeded: i64,
    pub failed: i64,
    pub interrupted: i64,
    /// Abandoned jobs put back in the queue by the recovery sweep.
    pub requeued: i64,
    /// Abandoned jobs failed by the recovery sweep.
    pub abandoned: i64,
    pub lease_lost: bool,
    /// Whether the catch-all grouping pass ran.
    pub grouped_remaining: bool,
}

/// A running job and its last persisted progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningJob {
    pub job: IngestionJob,
    pub progress: Option<JobProgress>,
    pub percent: i32,
}

/// A file that could not be ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub job_id: Uuid,
    pub filename: String,
    pub error: String,
}

/// Processing status of a project, read from persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub project_id: Uuid,
    pub locked: bool,
    pub lease: Option<ProjectLease>,
    pub jobs: JobStatusCounts,
    pub keywords: KeywordCounts,
    pub running: Vec<RunningJob>,
    pub errors: Vec<FileError>,
}

/// Repositories the orchestrator works against.
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub leases: Arc<dyn LeaseRepository>,
    pub keywords: Arc<dyn KeywordRepository>,
    pub projects: Arc<dyn ProjectDirectory>,
}

impl Repositories {
    /// PostgreSQL repositories over one pool.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            jobs: Arc::new(PgJobRepository::new(pool.clone())),
            leases: Arc::new(PgLeaseRepository::new(pool.clone())),
            keywords: Arc::new(PgKeywordRepository::new(pool.clone())),
            projects: Arc::new(PgProjectDirectory::new(pool)),
        }
    }
}

/// Renews the lease before every batch.
///
/// Losing the lease is tolerated for the rest of the current job, unless
/// the job itself is no longer running (a reset), which aborts it.
struct LeaseGate {
    leases: Arc<dyn LeaseRepository>,
    jobs: Arc<dyn JobRepository>,
    project_id: Uuid,
    owner: String,
    ttl: Duration,
    lost: AtomicBool,
}

impl LeaseGate {
    fn lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchGate for LeaseGate {
    async fn before_batch(&self, job: &IngestionJob) -> Result<()> {
        if self.leases.renew(self.project_id, &self.owner, self.ttl).await? {
            return Ok(());
        }
        let still_running = self
            .jobs
            .get(job.id)
            .await?
            .is_some_and(|j| j.status == JobStatus::Running);
        if !still_running {
            warn!(
                subsystem = "orchestrator",
                project_id = %self.project_id,
                job_id = %job.id,
                "Job was reset; stopping before next batch"
            );
            return Err(Error::Job(JOB_RESET_ERROR.to_string()));
        }
        if !self.lost.swap(true, Ordering::SeqCst) {
            warn!(
                subsystem = "orchestrator",
                project_id = %self.project_id,
                job_id = %job.id,
                owner = %self.owner,
                "Lease lost; finishing current job without claiming more"
            );
        }
        Ok(())
    }
}

/// Coordinates ingestion runs for projects.
#[derive(Clone)]
pub struct Orchestrator {
    repos: Repositories,
    blobs: Arc<dyn BlobStore>,
    activity: Option<Arc<dyn ActivityLog>>,
    config: OrchestratorConfig,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(repos: Repositories, blobs: Arc<dyn BlobStore>, config: OrchestratorConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            repos,
            blobs,
            activity: None,
            config,
            event_tx,
        }
    }

    /// Record uploads and resets in an activity log.
    pub fn with_activity_log(mut self, activity: Arc<dyn ActivityLog>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Get a receiver for orchestrator events.
    pub fn events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn log_activity(&self, project_id: Uuid, action: &str, details: serde_json::Value, user: Option<&str>) {
        if let Some(activity) = &self.activity {
            activity.log(project_id, action, details, user).await;
        }
    }

    /// Store an uploaded CSV, queue it, and kick processing.
    ///
    /// Uploading the same bytes to the same project again returns the
    /// existing job with `false`.
    pub async fn submit_upload(
        &self,
        project_id: Uuid,
        filename: &str,
        content: &[u8],
        user: Option<&str>,
    ) -> Result<(IngestionJob, bool)> {
        if !self.repos.projects.exists(project_id).await? {
            return Err(Error::NotFound(format!("project {project_id}")));
        }
        if content.is_empty() {
            return Err(Error::Validation("uploaded file is empty".to_string()));
        }

        let storage_path = upload_path(project_id, content);
        if !self.blobs.exists(&storage_path).await? {
            self.blobs.write(&storage_path, content).await?;
        }
        let (job, created) = self
            .repos
            .jobs
            .enqueue(EnqueueJobRequest {
                project_id,
                csv_upload_id: None,
                storage_path,
                source_filename: filename.to_string(),
                idempotency_key: idempotency_key(project_id, content),
            })
            .await?;

        if created {
            self.log_activity(
                project_id,
                "csv_uploaded",
                json!({ "job_id": job.id, "filename": filename, "bytes": content.len() }),
                user,
            )
            .await;
        }
        self.kick(project_id).await?;
        Ok((job, created))
    }

    /// Start a background run if nobody is processing the project.
    ///
    /// Returns false when processing is disabled or another worker holds
    /// the lease, so repeated kicks are harmless.
    pub async fn kick(&self, project_id: Uuid) -> Result<bool> {
        if !self.config.enabled {
            debug!(subsystem = "orchestrator", project_id = %project_id, "Processing disabled; not kicking");
            return Ok(false);
        }
        if !self.acquire(project_id).await? {
            return Ok(false);
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run(project_id).await {
                error!(
                    subsystem = "orchestrator",
                    project_id = %project_id,
                    error = %e,
                    "Processing run aborted"
                );
            }
        });
        Ok(true)
    }

    /// Run processing in the current task. `None` if the lease is held elsewhere.
    pub async fn process(&self, project_id: Uuid) -> Result<Option<RunSummary>> {
        if !self.acquire(project_id).await? {
            return Ok(None);
        }
        self.run(project_id).await.map(Some)
    }

    async fn acquire(&self, project_id: Uuid) -> Result<bool> {
        let acquired = self
            .repos
            .leases
            .try_acquire(project_id, &self.config.owner, self.config.lease_ttl)
            .await?;
        if acquired {
            info!(
                subsystem = "orchestrator",
                project_id = %project_id,
                owner = %self.config.owner,
                "Lease acquired"
            );
            self.emit(OrchestratorEvent::LeaseAcquired {
                project_id,
                owner: self.config.owner.clone(),
            });
        } else {
            debug!(subsystem = "orchestrator", project_id = %project_id, "Project already being processed");
        }
        Ok(acquired)
    }

    /// Process the project's queue. The caller must hold the lease.
    ///
    /// The lease is released afterwards, whatever the outcome.
    pub async fn run(&self, project_id: Uuid) -> Result<RunSummary> {
        let start = Instant::now();
        let mut summary = RunSummary::default();
        let result = self.run_loop(project_id, &mut summary).await;

        if let Err(e) = self
            .repos
            .leases
            .release(project_id, &self.config.owner)
            .await
        {
            warn!(subsystem = "orchestrator", project_id = %project_id, error = %e, "Failed to release lease");
        }

        info!(
            subsystem = "orchestrator",
            project_id = %project_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            interrupted = summary.interrupted,
            lease_lost = summary.lease_lost,
            duration_ms = start.elapsed().as_millis() as u64,
            "Processing run finished"
        );
        self.emit(OrchestratorEvent::RunFinished {
            project_id,
            summary: summary.clone(),
        });
        result.map(|_| summary)
    }

    async fn run_loop(&self, project_id: Uuid, summary: &mut RunSummary) -> Result<()> {
        let jobs = &self.repos.jobs;

        let sweep = jobs
            .recovery_sweep(project_id, self.config.lease_ttl, self.config.max_attempts)
            .await?;
        summary.requeued = sweep.requeued.len() as i64;
        summary.abandoned = sweep.failed.len() as i64;
        if !sweep.is_empty() {
            self.emit(OrchestratorEvent::JobsRecovered {
                project_id,
                requeued: sweep.requeued.len(),
                failed: sweep.failed.len(),
            });
        }

        let gate = LeaseGate {
            leases: self.repos.leases.clone(),
            jobs: jobs.clone(),
            project_id,
            owner: self.config.owner.clone(),
            ttl: self.config.lease_ttl,
            lost: AtomicBool::new(false),
        };

        loop {
            if gate.lost()
                || !self
                    .repos
                    .leases
                    .renew(project_id, &self.config.owner, self.config.lease_ttl)
                    .await?
            {
                warn!(subsystem = "orchestrator", project_id = %project_id, "Lease lost; stopping");
                summary.lease_lost = true;
                self.emit(OrchestratorEvent::LeaseLost { project_id });
                break;
            }

            let Some(job) = jobs.claim_next(project_id).await? else {
                break;
            };
            info!(
                subsystem = "orchestrator",
                project_id = %project_id,
                job_id = %job.id,
                filename = %job.source_filename,
                attempts = job.attempts,
                "Job started"
            );
            self.emit(OrchestratorEvent::JobStarted {
                project_id,
                job_id: job.id,
            });

            match self.worker(job.id, project_id).process(&job, &gate).await {
                Ok(ingested) => {
                    if jobs.mark_succeeded(job.id).await? {
                        summary.succeeded += 1;
                        self.emit(OrchestratorEvent::JobSucceeded {
                            project_id,
                            job_id: job.id,
                            inserted: ingested.progress.inserted_rows,
                        });
                    }
                }
                Err(e) if e.is_transient() => {
                    error!(
                        subsystem = "orchestrator",
                        project_id = %project_id,
                        job_id = %job.id,
                        error = %e,
                        "Job interrupted; left for the recovery sweep"
                    );
                    summary.interrupted += 1;
                    self.emit(OrchestratorEvent::JobInterrupted {
                        project_id,
                        job_id: job.id,
                        error: e.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        subsystem = "orchestrator",
                        project_id = %project_id,
                        job_id = %job.id,
                        error = %message,
                        "Job failed"
                    );
                    if jobs.mark_failed(job.id, &message).await? {
                        summary.failed += 1;
                    }
                    self.emit(OrchestratorEvent::JobFailed {
                        project_id,
                        job_id: job.id,
                        error: message,
                    });
                }
            }
        }

        if summary.lease_lost || summary.interrupted > 0 {
            return Ok(());
        }
        if jobs.counts_by_status(project_id).await?.pending() == 0 {
            match self.repos.keywords.group_remaining(project_id).await {
                Ok(_) => summary.grouped_remaining = true,
                Err(e) => warn!(
                    subsystem = "orchestrator",
                    project_id = %project_id,
                    error = %e,
                    "Catch-all grouping pass failed"
                ),
            }
        }
        Ok(())
    }

    fn worker(&self, job_id: Uuid, project_id: Uuid) -> IngestionWorker {
        let event_tx = self.event_tx.clone();
        IngestionWorker::new(
            self.repos.jobs.clone(),
            self.repos.keywords.clone(),
            self.blobs.clone(),
        )
        .with_batch_size(self.config.batch_size)
        .with_progress_callback(move |progress| {
            let _ = event_tx.send(OrchestratorEvent::JobProgress {
                project_id,
                job_id,
                percent: progress.percent(),
                processed_rows: progress.processed_rows,
                total_rows: progress.total_rows,
            });
        })
    }

    /// Fail every queued or running job and clear the lease.
    ///
    /// A worker in the middle of a job notices at its next batch and stops.
    pub async fn reset(&self, project_id: Uuid, user: Option<&str>) -> Result<i64> {
        let failed = self
            .repos
            .jobs
            .fail_pending(project_id, JOB_RESET_ERROR)
            .await?;
        let cleared = self.repos.leases.clear(project_id).await?;
        info!(
            subsystem = "orchestrator",
            project_id = %project_id,
            failed,
            cleared,
            "Processing reset"
        );
        self.log_activity(project_id, "processing_reset", json!({ "failed_jobs": failed }), user)
            .await;
        Ok(failed)
    }

    /// Processing status from persisted state.
    pub async fn status(&self, project_id: Uuid) -> Result<ProcessingStatus> {
        let jobs = &self.repos.jobs;
        let mut running = Vec::new();
        for job in jobs.list_by_status(project_id, JobStatus::Running).await? {
            let progress = jobs.get_progress(job.id).await?;
            running.push(RunningJob {
                percent: progress.map_or(0, |p| p.percent()),
                job,
                progress,
            });
        }
        let errors = jobs
            .list_by_status(project_id, JobStatus::Failed)
            .await?
            .into_iter()
            .map(|job| FileError {
                job_id: job.id,
                filename: job.source_filename,
                error: job.error.unwrap_or_default(),
            })
            .collect();

        Ok(ProcessingStatus {
            project_id,
            locked: self.repos.leases.is_locked(project_id).await?,
            lease: self.repos.leases.get(project_id).await?,
            jobs: jobs.counts_by_status(project_id).await?,
            keywords: self.repos.keywords.counts(project_id).await?,
            running,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::mock::{
        MemoryActivityLog, MemoryBlobStore, MemoryJobRepository, MemoryKeywordRepository,
        MemoryLeaseRepository, MemoryProjectDirectory,
    };
    use kwgroup_core::defaults::JOB_ABANDONED_ERROR;

    const OWNER: &str = "test-worker";

    struct Harness {
        orchestrator: Orchestrator,
        jobs: Arc<MemoryJobRepository>,
        leases: Arc<MemoryLeaseRepository>,
        keywords: Arc<MemoryKeywordRepository>,
        activity: Arc<MemoryActivityLog>,
        project_id: Uuid,
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_enabled(false)
            .with_owner(OWNER)
    }

    fn harness_with(config: OrchestratorConfig, leases: Arc<dyn LeaseRepository>) -> Harness {
        let jobs = Arc::new(MemoryJobRepository::new());
        let keywords = Arc::new(MemoryKeywordRepository::new());
        let projects = Arc::new(MemoryProjectDirectory::new());
        let activity = Arc::new(MemoryActivityLog::new());
        let project_id = projects.create();
        let repos = Repositories {
            jobs: jobs.clone(),
            leases,
            keywords: keywords.clone(),
            projects,
        };
        let orchestrator = Orchestrator::new(repos, Arc::new(MemoryBlobStore::new()), config)
            .with_activity_log(activity.clone());
        Harness {
            orchestrator,
            jobs,
            leases: Arc::new(MemoryLeaseRepository::new()),
            keywords,
            activity,
            project_id,
        }
    }

    fn harness(config: OrchestratorConfig) -> Harness {
        let leases = Arc::new(MemoryLeaseRepository::new());
        let mut h = harness_with(config, leases.clone());
        h.leases = leases;
        h
    }

    impl Harness {
        async fn upload(&self, name: &str, content: &str) -> IngestionJob {
            self.orchestrator
                .submit_upload(self.project_id, name, content.as_bytes(), Some("alice"))
                .await
                .unwrap()
                .0
        }

        async fn job(&self, id: Uuid) -> IngestionJob {
            self.jobs.get(id).await.unwrap().unwrap()
        }

        fn keyword(&self, text: &str) -> kwgroup_core::Keyword {
            self.keywords.get_by_text(self.project_id, text).unwrap()
        }

        /// Group partition by member texts, independent of group ids.
        fn shape(&self) -> BTreeSet<(Vec<String>, String, i64)> {
            let rows = self.keywords.keywords(self.project_id);
            let mut groups: BTreeMap<Uuid, Vec<String>> = BTreeMap::new();
            for kw in rows.iter().filter(|kw| kw.group_id.is_some()) {
                groups.entry(kw.group_id.unwrap()).or_default().push(kw.keyword.clone());
            }
            rows.iter()
                .filter(|kw| kw.is_parent)
                .map(|kw| {
                    let mut members = kw
                        .group_id
                        .and_then(|g| groups.get(&g).cloned())
                        .unwrap_or_else(|| vec![kw.keyword.clone()]);
                    members.sort();
                    (members, kw.keyword.clone(), kw.volume)
                })
                .collect()
        }
    }

    /// Lease repository that stops renewing after a number of renewals.
    struct ExpiringLeases {
        inner: MemoryLeaseRepository,
        renewals_left: AtomicUsize,
    }

    #[async_trait]
    impl LeaseRepository for ExpiringLeases {
        async fn try_acquire(&self, project_id: Uuid, owner: &str, ttl: Duration) -> Result<bool> {
            self.inner.try_acquire(project_id, owner, ttl).await
        }
        async fn renew(&self, project_id: Uuid, owner: &str, ttl: Duration) -> Result<bool> {
            let allowed = self
                .renewals_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Ok(false);
            }
            self.inner.renew(project_id, owner, ttl).await
        }
        async fn release(&self, project_id: Uuid, owner: &str) -> Result<bool> {
            self.inner.release(project_id, owner).await
        }
        async fn is_locked(&self, project_id: Uuid) -> Result<bool> {
            self.inner.is_locked(project_id).await
        }
        async fn get(&self, project_id: Uuid) -> Result<Option<ProjectLease>> {
            self.inner.get(project_id).await
        }
        async fn clear(&self, project_id: Uuid) -> Result<bool> {
            self.inner.clear(project_id).await
        }
    }

    #[test]
    fn test_config_default_and_builder() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.lease_ttl, Duration::from_secs(120));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.batch_size, 200);
        assert!(config.enabled);
        assert!(config.owner.starts_with("kwgroup-"));

        let config = config
            .with_lease_ttl(Duration::from_secs(5))
            .with_max_attempts(1)
            .with_batch_size(0)
            .with_enabled(false)
            .with_owner("w1");
        assert_eq!(config.lease_ttl, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.batch_size, 1);
        assert!(!config.enabled);
        assert_eq!(config.owner, "w1");
    }

    #[tokio::test]
    async fn test_signature_group_scenario() {
        let h = harness(config());
        let job = h.upload("kw.csv", "keyword,volume\nshoe,100\nshoes,50\nboot,10\n").await;

        let summary = h.orchestrator.process(h.project_id).await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(summary.grouped_remaining);
        assert_eq!(h.job(job.id).await.status, JobStatus::Succeeded);

        let shoe = h.keyword("shoe");
        let shoes = h.keyword("shoes");
        let boot = h.keyword("boot");
        assert!(shoe.is_parent);
        assert_eq!(shoe.volume, 150);
        assert!(!shoes.is_parent);
        assert_eq!(shoes.group_id, shoe.group_id);
        assert!(boot.is_parent);
        assert_eq!(boot.group_id, None);
        assert_eq!(boot.volume, 10);

        assert!(h.leases.get(h.project_id).await.unwrap().is_none());
        let progress = h.jobs.get_progress(job.id).await.unwrap().unwrap();
        assert_eq!(progress.inserted_rows, 3);
        assert_eq!(progress.percent(), 100);
    }

    #[tokio::test]
    async fn test_duplicate_upload_returns_existing_job() {
        let h = harness(config());
        let content = b"keyword\nshoe\n";
        let (first, created) = h
            .orchestrator
            .submit_upload(h.project_id, "a.csv", content, None)
            .await
            .unwrap();
        assert!(created);
        let (second, created) = h
            .orchestrator
            .submit_upload(h.project_id, "copy-of-a.csv", content, None)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(h.jobs.all().len(), 1);
        assert_eq!(h.activity.actions(), vec!["csv_uploaded"]);
    }

    #[tokio::test]
    async fn test_upload_to_unknown_project_is_not_found() {
        let h = harness(config());
        let err = h
            .orchestrator
            .submit_upload(Uuid::new_v4(), "a.csv", b"keyword\nshoe\n", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bad_file_fails_without_blocking_the_queue() {
        let h = harness(config());
        let bad = h.upload("bad.csv", "term,volume\nshoe,10\n").await;
        let good = h.upload("good.csv", "keyword,volume\nboot,10\n").await;

        let summary = h.orchestrator.process(h.project_id).await.unwrap().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);

        let bad = h.job(bad.id).await;
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.attempts, 0);
        assert!(bad.error.unwrap().contains("no keyword column"));
        assert_eq!(h.job(good.id).await.status, JobStatus::Succeeded);

        let status = h.orchestrator.status(h.project_id).await.unwrap();
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].filename, "bad.csv");
        assert_eq!(status.jobs.succeeded, 1);
        assert_eq!(status.keywords.ungrouped, 1);
        assert!(!status.locked);
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_job_for_recovery() {
        let h = harness(config());
        h.keywords.fail_next_inserts(1);
        let job = h.upload("kw.csv", "keyword,volume\nshoe,100\nshoes,50\n").await;

        let summary = h.orchestrator.process(h.project_id).await.unwrap().unwrap();
        assert_eq!(summary.interrupted, 1);
        assert!(!summary.grouped_remaining);
        assert_eq!(h.job(job.id).await.status, JobStatus::Running);
        assert!(h.leases.get(h.project_id).await.unwrap().is_none());

        // Not yet stale: the next run leaves it alone.
        let summary = h.orchestrator.process(h.project_id).await.unwrap().unwrap();
        assert_eq!(summary.requeued, 0);
        assert_eq!(h.job(job.id).await.status, JobStatus::Running);

        h.jobs.backdate(job.id, Duration::from_secs(600), 0);
        let summary = h.orchestrator.process(h.project_id).await.unwrap().unwrap();
        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.succeeded, 1);
        let job = h.job(job.id).await;
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(h.keyword("shoe").volume, 150);
    }

    #[tokio::test]
    async fn test_stuck_job_below_max_attempts_is_requeued() {
        let h = harness(config());
        let job = h.upload("kw.csv", "keyword\nshoe\n").await;
        h.jobs.claim_next(h.project_id).await.unwrap();
        h.jobs.backdate(job.id, Duration::from_secs(600), JOB_MAX_ATTEMPTS - 1);

        let summary = h.orchestrator.process(h.project_id).await.unwrap().unwrap();
        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(h.job(job.id).await.attempts, JOB_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_stuck_job_at_max_attempts_fails_permanently() {
        let h = harness(config());
        let job = h.upload("kw.csv", "keyword\nshoe\n").await;
        h.jobs.claim_next(h.project_id).await.unwrap();
        h.jobs.backdate(job.id, Duration::from_secs(600), JOB_MAX_ATTEMPTS);

        let summary = h.orchestrator.process(h.project_id).await.unwrap().unwrap();
        assert_eq!(summary.abandoned, 1);
        assert_eq!(summary.succeeded, 0);
        let job = h.job(job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(JOB_ABANDONED_ERROR));
        assert!(h.keywords.keywords(h.project_id).is_empty());
    }

    #[tokio::test]
    async fn test_second_worker_does_not_run() {
        let h = harness(config().with_enabled(true));
        h.leases.steal(h.project_id, "other-worker", Duration::from_secs(60));

        assert!(h.orchestrator.process(h.project_id).await.unwrap().is_none());
        assert!(!h.orchestrator.kick(h.project_id).await.unwrap());
        assert_eq!(h.leases.get(h.project_id).await.unwrap().unwrap().owner, "other-worker");
    }

    #[tokio::test]
    async fn test_disabled_orchestrator_does_not_kick() {
        let h = harness(config());
        let job = h.upload("kw.csv", "keyword\nshoe\n").await;
        assert!(!h.orchestrator.kick(h.project_id).await.unwrap());
        assert_eq!(h.job(job.id).await.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_batch_size_does_not_change_groups() {
        let content = "keyword,volume,kd\n\
                       shoe,100,40\nboot,10,\nshoes,50,20\nboots,30,10\n\
                       running shoes,80,55\nshoe running,5,\nrun shoe,70,30\nsandal,1,\n";
        let one = harness(config());
        one.upload("kw.csv", content).await;
        one.orchestrator.process(one.project_id).await.unwrap();

        let many = harness(config().with_batch_size(1));
        many.upload("kw.csv", content).await;
        many.orchestrator.process(many.project_id).await.unwrap();

        assert_eq!(one.shape(), many.shape());
        assert_eq!(one.keyword("shoe").difficulty, Some(30.0));
        assert_eq!(many.keyword("shoe").difficulty, Some(30.0));
    }

    #[tokio::test]
    async fn test_reset_fails_pending_jobs_and_clears_lease() {
        let h = harness(config());
        h.upload("a.csv", "keyword\nshoe\n").await;
        h.upload("b.csv", "keyword\nboot\n").await;
        h.leases.steal(h.project_id, "other-worker", Duration::from_secs(60));

        let failed = h.orchestrator.reset(h.project_id, Some("alice")).await.unwrap();
        assert_eq!(failed, 2);
        assert!(h.leases.get(h.project_id).await.unwrap().is_none());

        let status = h.orchestrator.status(h.project_id).await.unwrap();
        assert_eq!(status.jobs.failed, 2);
        assert!(status.errors.iter().all(|e| e.error == JOB_RESET_ERROR));
        assert!(h.activity.actions().contains(&"processing_reset".to_string()));
    }

    #[tokio::test]
    async fn test_lease_gate_tolerates_lost_lease_but_not_reset() {
        let h = harness(config());
        let job = h.upload("kw.csv", "keyword\nshoe\n").await;
        let job = {
            h.leases.try_acquire(h.project_id, OWNER, Duration::from_secs(60)).await.unwrap();
            h.jobs.claim_next(h.project_id).await.unwrap().unwrap_or(job)
        };
        let gate = LeaseGate {
            leases: h.leases.clone(),
            jobs: h.jobs.clone(),
            project_id: h.project_id,
            owner: OWNER.to_string(),
            ttl: Duration::from_secs(60),
            lost: AtomicBool::new(false),
        };
        gate.before_batch(&job).await.unwrap();
        assert!(!gate.lost());

        h.leases.steal(h.project_id, "other-worker", Duration::from_secs(60));
        gate.before_batch(&job).await.unwrap();
        assert!(gate.lost());

        h.jobs.fail_pending(h.project_id, JOB_RESET_ERROR).await.unwrap();
        assert!(matches!(gate.before_batch(&job).await, Err(Error::Job(_))));
    }

    #[tokio::test]
    async fn test_lost_lease_finishes_job_and_stops_claiming() {
        let leases = Arc::new(ExpiringLeases {
            inner: MemoryLeaseRepository::new(),
            renewals_left: AtomicUsize::new(1),
        });
        let h = harness_with(config(), leases);
        let first = h.upload("a.csv", "keyword\nshoe\n").await;
        let second = h.upload("b.csv", "keyword\nboot\n").await;

        let summary = h.orchestrator.process(h.project_id).await.unwrap().unwrap();
        assert!(summary.lease_lost);
        assert_eq!(summary.succeeded, 1);
        assert!(!summary.grouped_remaining);
        assert_eq!(h.job(first.id).await.status, JobStatus::Succeeded);
        assert_eq!(h.job(second.id).await.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_events_follow_the_run() {
        let h = harness(config());
        let mut rx = h.orchestrator.events();
        let job = h.upload("kw.csv", "keyword\nshoe\nshoes\n").await;
        h.orchestrator.process(h.project_id).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(OrchestratorEvent::LeaseAcquired { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::JobStarted { job_id, .. } if *job_id == job.id)));
        assert!(events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::JobProgress { percent: 100, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::JobSucceeded { inserted: 2, .. })));
        assert!(matches!(
            events.last(),
            Some(OrchestratorEvent::RunFinished { summary, .. }) if summary.succeeded == 1
        ));
    }

    #[tokio::test]
    async fn test_upload_kicks_background_run() {
        let h = harness(config().with_enabled(true));
        let mut rx = h.orchestrator.events();
        let job = h.upload("kw.csv", "keyword,volume\nshoe,100\nshoes,50\n").await;

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(OrchestratorEvent::RunFinished { summary, .. }) = rx.recv().await {
                    return summary;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(finished.succeeded, 1);
        assert_eq!(h.job(job.id).await.status, JobStatus::Succeeded);
        assert_eq!(h.keyword("shoe").volume, 150);
    }
}

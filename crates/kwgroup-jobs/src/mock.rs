//! In-memory repositories for tests.
//!
//! They keep the same contracts as the PostgreSQL implementations and run
//! the same core grouping code, so orchestrator behavior can be tested
//! without a database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use kwgroup_core::defaults::JOB_ABANDONED_ERROR;
use kwgroup_core::grouping::restructure;
use kwgroup_core::{
    new_v7, ActivityLog, AttachMode, EnqueueJobRequest, Error, GroupingSummary, IngestionJob,
    JobProgress, JobRepository, JobStatus, JobStatusCounts, Keyword, KeywordCounts,
    KeywordMergeOperation, KeywordRepository, KeywordStatus, LeaseRepository, MergeOperation,
    NewKeyword, ProjectDirectory, ProjectLease, RestructureStats, Result, SweepOutcome,
};
use kwgroup_db::BlobStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected_failure() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "injected storage failure",
    ))
}

fn expiry(ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::Config(format!("lease ttl out of range: {e}")))?;
    Ok(Utc::now() + ttl)
}

// =============================================================================
// JOBS
// =============================================================================

#[derive(Default)]
struct JobState {
    jobs: Vec<IngestionJob>,
    progress: HashMap<Uuid, JobProgress>,
}

/// In-memory [`JobRepository`].
#[derive(Default)]
pub struct MemoryJobRepository {
    state: Mutex<JobState>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a running job was started `age` ago with `attempts` used.
    pub fn backdate(&self, job_id: Uuid, age: Duration, attempts: i32) {
        let mut state = lock(&self.state);
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) {
            job.started_at = chrono::Duration::from_std(age).ok().map(|age| Utc::now() - age);
            job.attempts = attempts;
        }
    }

    pub fn all(&self) -> Vec<IngestionJob> {
        lock(&self.state).jobs.clone()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn enqueue(&self, req: EnqueueJobRequest) -> Result<(IngestionJob, bool)> {
        let mut state = lock(&self.state);
        if let Some(job) = state
            .jobs
            .iter()
            .find(|j| j.idempotency_key == req.idempotency_key)
        {
            return Ok((job.clone(), false));
        }
        let job = IngestionJob {
            id: new_v7(),
            project_id: req.project_id,
            csv_upload_id: req.csv_upload_id,
            storage_path: req.storage_path,
            source_filename: req.source_filename,
            idempotency_key: req.idempotency_key,
            status: JobStatus::Queued,
            attempts: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        state.jobs.push(job.clone());
        Ok((job, true))
    }

    async fn get(&self, id: Uuid) -> Result<Option<IngestionJob>> {
        Ok(lock(&self.state).jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn claim_next(&self, project_id: Uuid) -> Result<Option<IngestionJob>> {
        let mut state = lock(&self.state);
        // Jobs are stored in creation order.
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.project_id == project_id && j.status == JobStatus::Queued)
        else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.finished_at = None;
        job.error = None;
        Ok(Some(job.clone()))
    }

    async fn mark_succeeded(&self, id: Uuid) -> Result<bool> {
        let mut state = lock(&self.state);
        match state
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == JobStatus::Running)
        {
            Some(job) => {
                job.status = JobStatus::Succeeded;
                job.finished_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        match state
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == JobStatus::Running)
        {
            Some(job) => {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.finished_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn counts_by_status(&self, project_id: Uuid) -> Result<JobStatusCounts> {
        let mut counts = JobStatusCounts::default();
        for job in lock(&self.state).jobs.iter().filter(|j| j.project_id == project_id) {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn list_by_status(
        &self,
        project_id: Uuid,
        status: JobStatus,
    ) -> Result<Vec<IngestionJob>> {
        Ok(lock(&self.state)
            .jobs
            .iter()
            .filter(|j| j.project_id == project_id && j.status == status)
            .cloned()
            .collect())
    }

    async fn recovery_sweep(
        &self,
        project_id: Uuid,
        stale_after: Duration,
        max_attempts: i32,
    ) -> Result<SweepOutcome> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after)
                .map_err(|e| Error::Config(format!("stale window out of range: {e}")))?;
        let mut outcome = SweepOutcome::default();
        let mut state = lock(&self.state);
        for job in state.jobs.iter_mut().filter(|j| {
            j.project_id == project_id
                && j.status == JobStatus::Running
                && j.started_at.map_or(true, |at| at < cutoff)
        }) {
            job.attempts += 1;
            if job.attempts > max_attempts {
                job.status = JobStatus::Failed;
                job.error = Some(JOB_ABANDONED_ERROR.to_string());
                job.finished_at = Some(Utc::now());
                outcome.failed.push(job.id);
            } else {
                job.status = JobStatus::Queued;
                job.started_at = None;
                job.finished_at = None;
                outcome.requeued.push(job.id);
            }
        }
        Ok(outcome)
    }

    async fn fail_pending(&self, project_id: Uuid, error: &str) -> Result<i64> {
        let mut n = 0;
        for job in lock(&self.state).jobs.iter_mut().filter(|j| {
            j.project_id == project_id && !j.status.is_terminal()
        }) {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.finished_at = Some(Utc::now());
            n += 1;
        }
        Ok(n)
    }

    async fn update_progress(&self, job_id: Uuid, progress: &JobProgress) -> Result<()> {
        lock(&self.state).progress.insert(job_id, *progress);
        Ok(())
    }

    async fn get_progress(&self, job_id: Uuid) -> Result<Option<JobProgress>> {
        Ok(lock(&self.state).progress.get(&job_id).copied())
    }
}

// =============================================================================
// LEASES
// =============================================================================

/// In-memory [`LeaseRepository`].
#[derive(Default)]
pub struct MemoryLeaseRepository {
    leases: Mutex<HashMap<Uuid, ProjectLease>>,
}

impl MemoryLeaseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the lease to another owner, as a competing worker would after expiry.
    pub fn steal(&self, project_id: Uuid, owner: &str, ttl: Duration) {
        let now = Utc::now();
        lock(&self.leases).insert(
            project_id,
            ProjectLease {
                project_id,
                owner: owner.to_string(),
                expires_at: expiry(ttl).unwrap_or(now),
                updated_at: now,
            },
        );
    }
}

#[async_trait]
impl LeaseRepository for MemoryLeaseRepository {
    async fn try_acquire(&self, project_id: Uuid, owner: &str, ttl: Duration) -> Result<bool> {
        let expires_at = expiry(ttl)?;
        let now = Utc::now();
        let mut leases = lock(&self.leases);
        if leases
            .get(&project_id)
            .is_some_and(|lease| !lease.is_expired_at(now))
        {
            return Ok(false);
        }
        leases.insert(
            project_id,
            ProjectLease {
                project_id,
                owner: owner.to_string(),
                expires_at,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn renew(&self, project_id: Uuid, owner: &str, ttl: Duration) -> Result<bool> {
        let expires_at = expiry(ttl)?;
        let mut leases = lock(&self.leases);
        match leases.get_mut(&project_id) {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = expires_at;
                lease.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, project_id: Uuid, owner: &str) -> Result<bool> {
        let mut leases = lock(&self.leases);
        if leases.get(&project_id).is_some_and(|l| l.owner == owner) {
            leases.remove(&project_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn is_locked(&self, project_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        Ok(lock(&self.leases)
            .get(&project_id)
            .is_some_and(|lease| !lease.is_expired_at(now)))
    }

    async fn get(&self, project_id: Uuid) -> Result<Option<ProjectLease>> {
        Ok(lock(&self.leases).get(&project_id).cloned())
    }

    async fn clear(&self, project_id: Uuid) -> Result<bool> {
        Ok(lock(&self.leases).remove(&project_id).is_some())
    }
}

// =============================================================================
// KEYWORDS
// =============================================================================

#[derive(Default)]
struct KeywordState {
    keywords: Vec<Keyword>,
    merges: Vec<MergeOperation>,
    journal: Vec<KeywordMergeOperation>,
    next_seq: i64,
}

/// In-memory [`KeywordRepository`] running the core restructuring over
/// every keyword of the project.
#[derive(Default)]
pub struct MemoryKeywordRepository {
    state: Mutex<KeywordState>,
    failures: AtomicUsize,
}

impl MemoryKeywordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch inserts fail with a transient I/O error.
    pub fn fail_next_inserts(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn add_merge_operation(&self, op: MergeOperation) {
        lock(&self.state).merges.push(op);
    }

    /// Every keyword of the project in ingestion order, hidden ones included.
    pub fn keywords(&self, project_id: Uuid) -> Vec<Keyword> {
        let mut rows: Vec<Keyword> = lock(&self.state)
            .keywords
            .iter()
            .filter(|kw| kw.project_id == project_id)
            .cloned()
            .collect();
        rows.sort_by_key(|kw| kw.seq);
        rows
    }

    pub fn get_by_text(&self, project_id: Uuid, text: &str) -> Option<Keyword> {
        lock(&self.state)
            .keywords
            .iter()
            .find(|kw| kw.project_id == project_id && kw.keyword == text)
            .cloned()
    }

    /// Journal entries recorded for a keyword.
    pub fn journal(&self, keyword_id: Uuid) -> Vec<KeywordMergeOperation> {
        lock(&self.state)
            .journal
            .iter()
            .filter(|entry| entry.keyword_id == keyword_id)
            .cloned()
            .collect()
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn regroup_project(state: &mut KeywordState, project_id: Uuid) -> (Vec<Keyword>, RestructureStats) {
        let rows: Vec<Keyword> = state
            .keywords
            .iter()
            .filter(|kw| kw.project_id == project_id)
            .cloned()
            .collect();
        let out = restructure(rows, AttachMode::Attach, &HashSet::new());
        let updated: HashMap<Uuid, &Keyword> = out.changed.iter().map(|kw| (kw.id, kw)).collect();
        for kw in state.keywords.iter_mut() {
            if let Some(new) = updated.get(&kw.id) {
                *kw = (*new).clone();
            }
        }
        (out.rows, out.stats)
    }
}

#[async_trait]
impl KeywordRepository for MemoryKeywordRepository {
    async fn existing_texts(&self, project_id: Uuid) -> Result<HashSet<String>> {
        Ok(lock(&self.state)
            .keywords
            .iter()
            .filter(|kw| kw.project_id == project_id)
            .map(|kw| kw.keyword.clone())
            .collect())
    }

    async fn merge_operations(&self, project_id: Uuid) -> Result<Vec<MergeOperation>> {
        Ok(lock(&self.state)
            .merges
            .iter()
            .filter(|op| op.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_and_group(
        &self,
        project_id: Uuid,
        rows: Vec<NewKeyword>,
    ) -> Result<GroupingSummary> {
        if self.take_failure() {
            return Err(injected_failure());
        }
        let mut summary = GroupingSummary::default();
        let mut state = lock(&self.state);
        let mut inserted = Vec::new();
        for record in rows {
            let taken = state
                .keywords
                .iter()
                .any(|kw| kw.project_id == project_id && kw.keyword == record.keyword);
            if taken {
                summary.conflicts += 1;
                continue;
            }
            let snapshots = record.merge_snapshots.clone();
            let mut kw = record.into_keyword(project_id);
            state.next_seq += 1;
            kw.seq = state.next_seq;
            for (merge_operation_id, tokens) in snapshots {
                state.journal.push(KeywordMergeOperation {
                    keyword_id: kw.id,
                    merge_operation_id,
                    original_tokens_snapshot: tokens,
                    hidden: false,
                });
            }
            if kw.is_groupable() {
                inserted.push(kw.id);
            }
            state.keywords.push(kw);
            summary.inserted += 1;
        }

        let (rows, stats) = Self::regroup_project(&mut state, project_id);
        let grouped: HashSet<Uuid> = rows
            .iter()
            .filter(|kw| kw.group_id.is_some())
            .map(|kw| kw.id)
            .collect();
        summary.standalone = inserted.iter().filter(|id| !grouped.contains(id)).count() as i64;
        summary.groups_created = stats.groups_created;
        summary.groups_extended = stats.groups_extended;
        Ok(summary)
    }

    async fn group_remaining(&self, project_id: Uuid) -> Result<RestructureStats> {
        let mut state = lock(&self.state);
        Ok(Self::regroup_project(&mut state, project_id).1)
    }

    async fn counts(&self, project_id: Uuid) -> Result<KeywordCounts> {
        let state = lock(&self.state);
        let mut counts = KeywordCounts::default();
        let mut groups = HashSet::new();
        for kw in state
            .keywords
            .iter()
            .filter(|kw| kw.project_id == project_id && !kw.is_hidden())
        {
            match kw.status {
                KeywordStatus::Ungrouped => counts.ungrouped += 1,
                KeywordStatus::Grouped => counts.grouped += 1,
                KeywordStatus::Confirmed => counts.confirmed += 1,
                KeywordStatus::Blocked => counts.blocked += 1,
            }
            if let Some(gid) = kw.group_id {
                groups.insert(gid);
            }
        }
        counts.groups = groups.len() as i64;
        Ok(counts)
    }
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// In-memory [`BlobStore`].
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        lock(&self.blobs).insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        lock(&self.blobs)
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {path}")))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        lock(&self.blobs).remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(lock(&self.blobs).contains_key(path))
    }
}

/// Project directory backed by a set of ids.
#[derive(Default)]
pub struct MemoryProjectDirectory {
    projects: Mutex<HashSet<Uuid>>,
}

impl MemoryProjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new project and return its id.
    pub fn create(&self) -> Uuid {
        let id = new_v7();
        lock(&self.projects).insert(id);
        id
    }
}

#[async_trait]
impl ProjectDirectory for MemoryProjectDirectory {
    async fn exists(&self, project_id: Uuid) -> Result<bool> {
        Ok(lock(&self.projects).contains(&project_id))
    }
}

/// Activity log that remembers actions.
#[derive(Default)]
pub struct MemoryActivityLog {
    entries: Mutex<Vec<(Uuid, String, Option<String>)>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<String> {
        lock(&self.entries).iter().map(|(_, action, _)| action.clone()).collect()
    }
}

#[async_trait]
impl ActivityLog for MemoryActivityLog {
    async fn log(
        &self,
        project_id: Uuid,
        action: &str,
        _details: serde_json::Value,
        user: Option<&str>,
    ) {
        lock(&self.entries).push((project_id, action.to_string(), user.map(str::to_string)));
    }
}

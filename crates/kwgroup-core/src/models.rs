//! Domain models for ingestion jobs, leases, keywords and merge operations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// INGESTION JOBS
// =============================================================================

/// Status of a CSV ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Serialization(format!("unknown job status: {other}"))),
        }
    }
}

/// One uploaded CSV file waiting for (or done with) ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub csv_upload_id: Option<Uuid>,
    pub storage_path: String,
    pub source_filename: String,
    pub idempotency_key: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Request for enqueueing an ingestion job.
#[derive(Debug, Clone)]
pub struct EnqueueJobRequest {
    pub project_id: Uuid,
    pub csv_upload_id: Option<Uuid>,
    pub storage_path: String,
    pub source_filename: String,
    pub idempotency_key: String,
}

/// Derive the idempotency key for an upload from its raw bytes.
///
/// Re-uploading the same physical file to the same project yields the same key.
pub fn idempotency_key(project_id: Uuid, content: &[u8]) -> String {
    format!("{}:{}", project_id, blake3::hash(content).to_hex())
}

/// Job counts per status for one project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusCounts {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

impl JobStatusCounts {
    /// Jobs that still need a worker.
    pub fn pending(&self) -> i64 {
        self.queued + self.running
    }

    pub fn total(&self) -> i64 {
        self.queued + self.running + self.succeeded + self.failed
    }

    pub fn add(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Running => self.running += n,
            JobStatus::Succeeded => self.succeeded += n,
            JobStatus::Failed => self.failed += n,
        }
    }
}

/// Incremental progress of a running ingestion job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_rows: i64,
    pub processed_rows: i64,
    pub skipped_rows: i64,
    pub duplicate_rows: i64,
    pub blocked_rows: i64,
    pub inserted_rows: i64,
}

impl JobProgress {
    pub fn new(total_rows: i64) -> Self {
        Self {
            total_rows,
            ..Default::default()
        }
    }

    /// Percent of rows looked at, clamped to 0..=100.
    pub fn percent(&self) -> i32 {
        if self.total_rows <= 0 {
            return 100;
        }
        ((self.processed_rows * 100) / self.total_rows).clamp(0, 100) as i32
    }
}

/// Result of a recovery sweep over abandoned `running` jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub requeued: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

// =============================================================================
// LEASES
// =============================================================================

/// Advisory, time-bounded ownership of a project's ingestion queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectLease {
    pub project_id: Uuid,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectLease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// =============================================================================
// KEYWORDS
// =============================================================================

/// Lifecycle status of a keyword row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordStatus {
    Ungrouped,
    Grouped,
    Confirmed,
    Blocked,
}

impl KeywordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeywordStatus::Ungrouped => "ungrouped",
            KeywordStatus::Grouped => "grouped",
            KeywordStatus::Confirmed => "confirmed",
            KeywordStatus::Blocked => "blocked",
        }
    }
}

impl FromStr for KeywordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ungrouped" => Ok(KeywordStatus::Ungrouped),
            "grouped" => Ok(KeywordStatus::Grouped),
            "confirmed" => Ok(KeywordStatus::Confirmed),
            "blocked" => Ok(KeywordStatus::Blocked),
            other => Err(Error::Serialization(format!(
                "unknown keyword status: {other}"
            ))),
        }
    }
}

/// Why a keyword is blocked (or hidden).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedBy {
    User,
    System,
    MergeHidden,
}

impl BlockedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedBy::User => "user",
            BlockedBy::System => "system",
            BlockedBy::MergeHidden => "merge_hidden",
        }
    }
}

impl FromStr for BlockedBy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(BlockedBy::User),
            "system" => Ok(BlockedBy::System),
            "merge_hidden" => Ok(BlockedBy::MergeHidden),
            other => Err(Error::Serialization(format!("unknown blocked_by: {other}"))),
        }
    }
}

/// A keyword row.
///
/// `volume`/`difficulty` hold the aggregated values while the keyword is a
/// group parent; `original_volume`/`original_difficulty` always hold the
/// values read from the CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Ingestion order. Zero until the row is persisted.
    pub seq: i64,
    pub keyword: String,
    pub tokens: Vec<String>,
    pub volume: i64,
    pub difficulty: Option<f64>,
    pub original_volume: i64,
    pub original_difficulty: Option<f64>,
    pub serp_features: Vec<String>,
    pub is_parent: bool,
    pub group_id: Option<Uuid>,
    pub status: KeywordStatus,
    pub blocked_by: Option<BlockedBy>,
    /// Snapshot taken by a user regroup, consumed by ungroup.
    pub original_state: Option<KeywordSnapshot>,
    /// Visible state before a merge hid the keyword, consumed by unhide.
    pub hidden_state: Option<KeywordSnapshot>,
}

impl Keyword {
    /// Hidden under a parent by a merge; excluded from counts and listings.
    pub fn is_hidden(&self) -> bool {
        self.blocked_by == Some(BlockedBy::MergeHidden)
    }

    /// Eligible for automatic grouping.
    pub fn is_groupable(&self) -> bool {
        !self.is_hidden() && self.status != KeywordStatus::Blocked
    }

    /// Standalone ungrouped parent (not a member of any group).
    pub fn is_standalone(&self) -> bool {
        self.group_id.is_none()
    }

    /// Capture the fields a restore needs.
    pub fn snapshot(&self) -> KeywordSnapshot {
        KeywordSnapshot {
            keyword: self.keyword.clone(),
            tokens: self.tokens.clone(),
            volume: self.volume,
            difficulty: self.difficulty,
            is_parent: self.is_parent,
            group_id: self.group_id,
            status: self.status,
            blocked_by: self.blocked_by,
        }
    }

    /// Record a regroup snapshot unless one is already pending a restore.
    pub fn snapshot_once(&mut self) {
        if self.original_state.is_none() {
            self.original_state = Some(self.snapshot());
        }
    }

    /// Turn into a standalone ungrouped parent with its own CSV values.
    pub fn make_standalone(&mut self) {
        self.is_parent = true;
        self.group_id = None;
        self.status = KeywordStatus::Ungrouped;
        self.blocked_by = None;
        self.volume = self.original_volume;
        self.difficulty = self.original_difficulty;
    }

    /// Fold under the parent of `group_id` as a merge-hidden member.
    ///
    /// The visible state goes to `hidden_state`; a pending regroup snapshot
    /// in `original_state` is left untouched.
    pub fn hide_under(&mut self, group_id: Uuid) {
        self.hidden_state = Some(self.snapshot());
        self.group_id = Some(group_id);
        self.is_parent = false;
        self.status = KeywordStatus::Grouped;
        self.blocked_by = Some(BlockedBy::MergeHidden);
    }

    /// Undo a merge hide.
    ///
    /// Only the grouping fields come back from `hidden_state`; text and
    /// tokens stay as they are now. Without a hide snapshot the keyword
    /// becomes standalone.
    pub fn unhide(&mut self) {
        match self.hidden_state.take() {
            Some(state) => {
                self.is_parent = state.is_parent;
                self.group_id = state.group_id;
                self.status = state.status;
                self.blocked_by = state.blocked_by;
                self.volume = state.volume;
                self.difficulty = state.difficulty;
            }
            None => self.make_standalone(),
        }
    }

    /// How an ungroup should restore this keyword.
    pub fn restore_plan(&self) -> RestorePlan {
        match &self.original_state {
            Some(snapshot) => RestorePlan::Full(snapshot.clone()),
            None => RestorePlan::Fallback,
        }
    }

    /// Apply a restore plan, consuming any stored snapshot.
    pub fn restore(&mut self, plan: RestorePlan) {
        match plan {
            RestorePlan::Full(snapshot) => {
                self.keyword = snapshot.keyword;
                self.tokens = snapshot.tokens;
                self.volume = snapshot.volume;
                self.difficulty = snapshot.difficulty;
                self.is_parent = snapshot.is_parent;
                self.group_id = snapshot.group_id;
                self.status = snapshot.status;
                self.blocked_by = snapshot.blocked_by;
            }
            RestorePlan::Fallback => {
                self.is_parent = true;
                self.group_id = None;
                self.status = KeywordStatus::Ungrouped;
                self.blocked_by = None;
            }
        }
        self.original_state = None;
    }
}

/// Pre-mutation state of a keyword, persisted as `original_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordSnapshot {
    pub keyword: String,
    pub tokens: Vec<String>,
    pub volume: i64,
    pub difficulty: Option<f64>,
    pub is_parent: bool,
    pub group_id: Option<Uuid>,
    pub status: KeywordStatus,
    pub blocked_by: Option<BlockedBy>,
}

/// How to undo a user regroup.
#[derive(Debug, Clone, PartialEq)]
pub enum RestorePlan {
    /// Restore every captured field exactly.
    Full(KeywordSnapshot),
    /// No snapshot: mark standalone ungrouped, keep current numbers.
    Fallback,
}

/// A processed CSV row ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewKeyword {
    pub keyword: String,
    pub tokens: Vec<String>,
    pub volume: i64,
    pub difficulty: Option<f64>,
    pub serp_features: Vec<String>,
    /// Contains non-ASCII letters; inserted as `blocked/system`, never grouped.
    pub blocked: bool,
    /// Merge operations applied to the tokens, with the pre-merge tokens.
    pub merge_snapshots: Vec<(Uuid, Vec<String>)>,
}

impl NewKeyword {
    /// Build the row this record becomes, before any grouping decision.
    pub fn into_keyword(self, project_id: Uuid) -> Keyword {
        let (status, blocked_by) = if self.blocked {
            (KeywordStatus::Blocked, Some(BlockedBy::System))
        } else {
            (KeywordStatus::Ungrouped, None)
        };
        Keyword {
            id: crate::uuid_utils::new_v7(),
            project_id,
            seq: 0,
            keyword: self.keyword,
            tokens: self.tokens,
            volume: self.volume,
            difficulty: self.difficulty,
            original_volume: self.volume,
            original_difficulty: self.difficulty,
            serp_features: self.serp_features,
            is_parent: true,
            group_id: None,
            status,
            blocked_by,
            original_state: None,
            hidden_state: None,
        }
    }
}

/// Normalize keyword text for storage and dedup: trim, collapse whitespace, lowercase.
pub fn normalize_keyword_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Outcome of inserting one batch of keywords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingSummary {
    /// Rows written.
    pub inserted: i64,
    /// Rows dropped by the `(project_id, keyword)` unique constraint.
    pub conflicts: i64,
    /// Groups created in this batch.
    pub groups_created: i64,
    /// Existing groups that received new members.
    pub groups_extended: i64,
    /// Rows left as standalone ungrouped parents.
    pub standalone: i64,
}

impl GroupingSummary {
    pub fn absorb(&mut self, other: GroupingSummary) {
        self.inserted += other.inserted;
        self.conflicts += other.conflicts;
        self.groups_created += other.groups_created;
        self.groups_extended += other.groups_extended;
        self.standalone += other.standalone;
    }
}

/// Visible keyword counts per status (merge-hidden rows excluded).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordCounts {
    pub ungrouped: i64,
    pub grouped: i64,
    pub confirmed: i64,
    pub blocked: i64,
    /// Distinct groups among visible keywords.
    pub groups: i64,
}

impl KeywordCounts {
    pub fn total(&self) -> i64 {
        self.ungrouped + self.grouped + self.confirmed + self.blocked
    }
}

// =============================================================================
// MERGES
// =============================================================================

/// A token-level merge: every child token is rewritten to the parent token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOperation {
    pub id: Uuid,
    pub project_id: Uuid,
    pub parent_token: String,
    pub child_tokens: Vec<String>,
    pub operation_id: Uuid,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Pre-merge tokens of one keyword under one merge operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordMergeOperation {
    pub keyword_id: Uuid,
    pub merge_operation_id: Uuid,
    pub original_tokens_snapshot: Vec<String>,
    /// The operation hid this keyword under a grouped parent.
    pub hidden: bool,
}

/// Result of a merge call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub operation_id: Uuid,
    pub parent_token: String,
    pub child_tokens: Vec<String>,
    /// Parent tokens of operations folded into this one.
    pub absorbed: Vec<String>,
    /// Keywords whose tokens were rewritten by this call.
    pub rewritten: i64,
    /// Keywords hidden under an existing parent.
    pub hidden: i64,
}

/// Result of an unmerge call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmergeOutcome {
    pub operations_removed: i64,
    pub restored: i64,
    pub unhidden: i64,
}

/// Result of a maintenance backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub scanned: i64,
    /// Keywords whose tokens differ after re-tokenizing and re-applying merges.
    pub changed: i64,
    /// Merge snapshots that were (or would be) recorded.
    pub merge_snapshots: i64,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyword(text: &str, volume: i64, difficulty: Option<f64>) -> Keyword {
        NewKeyword {
            keyword: text.to_string(),
            tokens: vec![text.to_string()],
            volume,
            difficulty,
            serp_features: vec![],
            blocked: false,
            merge_snapshots: vec![],
        }
        .into_keyword(Uuid::nil())
    }

    #[test]
    fn test_job_status_round_trip_strings() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("pending".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_idempotency_key_is_content_derived() {
        let project = Uuid::new_v4();
        let a = idempotency_key(project, b"keyword,volume\nshoe,100\n");
        let b = idempotency_key(project, b"keyword,volume\nshoe,100\n");
        let c = idempotency_key(project, b"keyword,volume\nboot,10\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(&project.to_string()));
        assert_ne!(a, idempotency_key(Uuid::new_v4(), b"keyword,volume\nshoe,100\n"));
    }

    #[test]
    fn test_job_progress_percent() {
        let mut progress = JobProgress::new(400);
        assert_eq!(progress.percent(), 0);
        progress.processed_rows = 200;
        assert_eq!(progress.percent(), 50);
        progress.processed_rows = 400;
        assert_eq!(progress.percent(), 100);
        assert_eq!(JobProgress::new(0).percent(), 100);
    }

    #[test]
    fn test_status_counts_pending() {
        let mut counts = JobStatusCounts::default();
        counts.add(JobStatus::Queued, 2);
        counts.add(JobStatus::Running, 1);
        counts.add(JobStatus::Failed, 4);
        assert_eq!(counts.pending(), 3);
        assert_eq!(counts.total(), 7);
    }

    #[test]
    fn test_new_keyword_blocked_by_system() {
        let kw = NewKeyword {
            keyword: "zapatos baratos".into(),
            tokens: vec![],
            volume: 5,
            difficulty: None,
            serp_features: vec![],
            blocked: true,
            merge_snapshots: vec![],
        }
        .into_keyword(Uuid::nil());
        assert_eq!(kw.status, KeywordStatus::Blocked);
        assert_eq!(kw.blocked_by, Some(BlockedBy::System));
        assert!(!kw.is_groupable());
    }

    #[test]
    fn test_snapshot_once_is_not_overwritten() {
        let mut kw = keyword("shoe", 100, Some(10.0));
        kw.snapshot_once();
        kw.volume = 999;
        kw.snapshot_once();
        assert_eq!(kw.original_state.as_ref().unwrap().volume, 100);
    }

    #[test]
    fn test_full_restore_consumes_snapshot() {
        let mut kw = keyword("shoe", 100, Some(10.0));
        kw.snapshot_once();
        kw.keyword = "footwear".into();
        kw.is_parent = false;
        kw.group_id = Some(Uuid::new_v4());
        kw.status = KeywordStatus::Grouped;

        let plan = kw.restore_plan();
        assert!(matches!(plan, RestorePlan::Full(_)));
        kw.restore(plan);

        assert_eq!(kw.keyword, "shoe");
        assert!(kw.is_parent);
        assert_eq!(kw.group_id, None);
        assert_eq!(kw.status, KeywordStatus::Ungrouped);
        assert!(kw.original_state.is_none());
    }

    #[test]
    fn test_hide_keeps_regroup_snapshot() {
        let mut kw = keyword("sneaker", 10, None);
        kw.snapshot_once();
        kw.keyword = "trainers".into();
        let regroup_snapshot = kw.original_state.clone();
        kw.make_standalone();

        let group = Uuid::new_v4();
        kw.hide_under(group);
        assert!(kw.is_hidden());
        assert_eq!(kw.group_id, Some(group));
        assert_eq!(kw.original_state, regroup_snapshot);

        kw.tokens = vec!["sneaker".into()];
        kw.unhide();
        assert!(!kw.is_hidden());
        assert!(kw.is_parent);
        assert_eq!(kw.group_id, None);
        assert_eq!(kw.status, KeywordStatus::Ungrouped);
        assert_eq!(kw.keyword, "trainers");
        assert_eq!(kw.tokens, vec!["sneaker"]);
        assert_eq!(kw.original_state, regroup_snapshot);
        assert!(kw.hidden_state.is_none());
    }

    #[test]
    fn test_unhide_without_snapshot_goes_standalone() {
        let mut kw = keyword("shoe", 100, None);
        kw.group_id = Some(Uuid::new_v4());
        kw.is_parent = false;
        kw.volume = 300;
        kw.blocked_by = Some(BlockedBy::MergeHidden);
        kw.unhide();
        assert!(kw.is_standalone());
        assert_eq!(kw.volume, 100);
        assert_eq!(kw.blocked_by, None);
    }

    #[test]
    fn test_fallback_restore_keeps_numbers() {
        let mut kw = keyword("shoe", 100, Some(10.0));
        kw.is_parent = false;
        kw.group_id = Some(Uuid::new_v4());
        kw.status = KeywordStatus::Grouped;
        kw.volume = 150;

        assert_eq!(kw.restore_plan(), RestorePlan::Fallback);
        kw.restore(RestorePlan::Fallback);
        assert!(kw.is_parent);
        assert_eq!(kw.group_id, None);
        assert_eq!(kw.status, KeywordStatus::Ungrouped);
        assert_eq!(kw.volume, 150);
    }

    #[test]
    fn test_snapshot_serializes_as_json() {
        let kw = keyword("shoe", 100, None);
        let json = serde_json::to_value(kw.snapshot()).unwrap();
        assert_eq!(json["status"], "ungrouped");
        let back: KeywordSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, kw.snapshot());
    }

    #[test]
    fn test_normalize_keyword_text() {
        assert_eq!(normalize_keyword_text("  Running   Shoes "), "running shoes");
        assert_eq!(normalize_keyword_text(""), "");
    }
}

//! Ingestion of one claimed CSV job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kwgroup_core::defaults::INGEST_BATCH_SIZE;
use kwgroup_core::{
    analyze, normalize_keyword_text, GroupingSummary, IngestionJob, JobProgress, JobRepository,
    KeywordRepository, MergeMap, NewKeyword, Result,
};
use kwgroup_db::BlobStore;

use crate::csv_reader::{decode, CsvKeywordRow, KeywordCsvReader};

/// Progress callback type for ingestion.
pub type ProgressCallback = Box<dyn Fn(&JobProgress) + Send + Sync>;

/// Hook run before every batch is written.
///
/// Returning an error aborts the job before the batch touches storage.
#[async_trait]
pub trait BatchGate: Send + Sync {
    async fn before_batch(&self, job: &IngestionJob) -> Result<()>;
}

/// Gate that never refuses. Used when no lease is involved.
pub struct OpenGate;

#[async_trait]
impl BatchGate for OpenGate {
    async fn before_batch(&self, _job: &IngestionJob) -> Result<()> {
        Ok(())
    }
}

/// Outcome of ingesting one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub progress: JobProgress,
    pub grouping: GroupingSummary,
}

/// Reads an uploaded CSV and feeds it to keyword storage in batches.
pub struct IngestionWorker {
    jobs: Arc<dyn JobRepository>,
    keywords: Arc<dyn KeywordRepository>,
    blobs: Arc<dyn BlobStore>,
    batch_size: usize,
    progress_callback: Option<ProgressCallback>,
}

impl IngestionWorker {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        keywords: Arc<dyn KeywordRepository>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            jobs,
            keywords,
            blobs,
            batch_size: INGEST_BATCH_SIZE,
            progress_callback: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the progress callback, called after every batch.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    fn report_progress(&self, progress: &JobProgress) {
        if let Some(ref callback) = self.progress_callback {
            callback(progress);
        }
    }

    /// Ingest one job's file.
    ///
    /// Rows are deduplicated by lowercase text against the project and
    /// against earlier rows of the same file. Existing merges are applied to
    /// the new tokens. Rows are streamed from the parser one batch at a
    /// time; each batch is written in its own transaction and progress is
    /// persisted after it.
    pub async fn process(&self, job: &IngestionJob, gate: &dyn BatchGate) -> Result<IngestionSummary> {
        let start = Instant::now();
        let bytes = self.blobs.read(&job.storage_path).await?;
        let (text, encoding) = decode(&bytes);
        let mut csv = KeywordCsvReader::new(&text)?;

        let existing = self.keywords.existing_texts(job.project_id).await?;
        let merges = MergeMap::new(self.keywords.merge_operations(job.project_id).await?);

        let mut summary = IngestionSummary {
            progress: JobProgress::new(csv.count_records()),
            ..Default::default()
        };
        self.jobs.update_progress(job.id, &summary.progress).await?;

        info!(
            subsystem = "ingestion",
            job_id = %job.id,
            project_id = %job.project_id,
            encoding,
            rows = summary.progress.total_rows,
            "Ingesting CSV"
        );

        let mut seen: HashSet<String> = HashSet::new();
        let mut malformed = 0i64;
        loop {
            let chunk = csv.next_batch(self.batch_size);
            let newly_malformed = csv.malformed_rows() - malformed;
            malformed = csv.malformed_rows();
            summary.progress.skipped_rows += newly_malformed;
            summary.progress.processed_rows += newly_malformed;
            if chunk.is_empty() {
                if newly_malformed > 0 {
                    self.jobs.update_progress(job.id, &summary.progress).await?;
                }
                break;
            }
            gate.before_batch(job).await?;

            let batch = prepare_batch(&chunk, &existing, &mut seen, &merges, &mut summary.progress);
            summary.progress.processed_rows += chunk.len() as i64;

            if !batch.is_empty() {
                let written = self.keywords.insert_and_group(job.project_id, batch).await?;
                summary.progress.inserted_rows += written.inserted;
                summary.progress.duplicate_rows += written.conflicts;
                summary.grouping.absorb(written);
            }

            self.jobs.update_progress(job.id, &summary.progress).await?;
            self.report_progress(&summary.progress);
            debug!(
                subsystem = "ingestion",
                job_id = %job.id,
                processed = summary.progress.processed_rows,
                total = summary.progress.total_rows,
                "Batch flushed"
            );
        }

        info!(
            subsystem = "ingestion",
            job_id = %job.id,
            project_id = %job.project_id,
            inserted = summary.progress.inserted_rows,
            duplicates = summary.progress.duplicate_rows,
            skipped = summary.progress.skipped_rows,
            blocked = summary.progress.blocked_rows,
            groups_created = summary.grouping.groups_created,
            duration_ms = start.elapsed().as_millis() as u64,
            "CSV ingested"
        );
        Ok(summary)
    }
}

/// Turn parsed rows into insertable keywords, counting what gets dropped.
fn prepare_batch(
    chunk: &[CsvKeywordRow],
    existing: &HashSet<String>,
    seen: &mut HashSet<String>,
    merges: &MergeMap,
    progress: &mut JobProgress,
) -> Vec<NewKeyword> {
    let mut batch = Vec::with_capacity(chunk.len());
    for row in chunk {
        let text = normalize_keyword_text(&row.keyword);
        if text.is_empty() {
            progress.skipped_rows += 1;
            continue;
        }
        if existing.contains(&text) || !seen.insert(text.clone()) {
            progress.duplicate_rows += 1;
            continue;
        }

        let analyzed = analyze(&text);
        if analyzed.blocked {
            progress.blocked_rows += 1;
        }
        let applied = merges.apply(&analyzed.tokens);
        batch.push(NewKeyword {
            keyword: text,
            tokens: applied.tokens,
            volume: row.volume,
            difficulty: row.difficulty,
            serp_features: row.serp_features.clone(),
            blocked: analyzed.blocked,
            merge_snapshots: applied.snapshots,
        });
    }
    batch
}

//! # kwgroup-jobs
//!
//! CSV ingestion for kwgroup.
//!
//! This crate provides:
//! - Keyword CSV decoding with encoding and delimiter detection
//! - Batched ingestion of one job into keyword storage
//! - A per-project orchestrator holding a lease while it drains the queue
//! - Progress and lifecycle notifications via broadcast channels
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kwgroup_db::{Database, FilesystemBlobStore};
//! use kwgroup_jobs::{Orchestrator, OrchestratorConfig, Repositories};
//!
//! let db = Database::connect("postgres://...").await?;
//! let orchestrator = Orchestrator::new(
//!     Repositories::postgres(db.pool().clone()),
//!     Arc::new(FilesystemBlobStore::new("/var/lib/kwgroup")),
//!     OrchestratorConfig::from_env(),
//! );
//!
//! let mut events = orchestrator.events();
//! let (job, _) = orchestrator.submit_upload(project_id, "kw.csv", &bytes, None).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! ```

pub mod csv_reader;
pub mod ingestion;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod orchestrator;

// Re-export core types
pub use kwgroup_core::*;

pub use csv_reader::{ColumnMap, CsvKeywordRow, KeywordCsvReader};
pub use ingestion::{BatchGate, IngestionSummary, IngestionWorker, OpenGate, ProgressCallback};
pub use orchestrator::{
    FileError, Orchestrator, OrchestratorConfig, OrchestratorEvent, ProcessingStatus,
    Repositories, RunSummary, RunningJob,
};

//! Centralized default constants for kwgroup.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic numbers.

// =============================================================================
// INGESTION
// =============================================================================

/// Rows per ingestion batch. Each batch is flushed in one transaction.
pub const INGEST_BATCH_SIZE: usize = 200;

/// Bytes of decoded text inspected when sniffing the CSV delimiter.
pub const DELIMITER_SAMPLE_BYTES: usize = 8192;

/// Candidate delimiters, in preference order when counts tie.
pub const DELIMITER_CANDIDATES: [u8; 4] = [b',', b'\t', b';', b'|'];

/// Prefix for uploaded blobs in the blob store.
pub const UPLOAD_PREFIX: &str = "uploads";

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Maximum recovery-sweep requeues before a stuck job is failed permanently.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Error recorded on jobs failed by the recovery sweep.
pub const JOB_ABANDONED_ERROR: &str = "Processing was interrupted too many times";

/// Error recorded on jobs failed by a processing reset.
pub const JOB_RESET_ERROR: &str = "Processing was reset";

/// Orchestrator event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// LEASES
// =============================================================================

/// Project lease time-to-live in seconds. Renewed before every batch.
pub const LEASE_TTL_SECS: u64 = 120;

// =============================================================================
// MAINTENANCE
// =============================================================================

/// Keywords re-tokenized per backfill batch.
pub const BACKFILL_BATCH_SIZE: i64 = 1000;

/// Decimal places kept on aggregated parent difficulty.
pub const DIFFICULTY_DECIMALS: i32 = 2;

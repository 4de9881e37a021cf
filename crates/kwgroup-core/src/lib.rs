//! # kwgroup-core
//!
//! Core types, traits and pure algorithms for keyword ingestion and grouping.
//!
//! This crate performs no I/O. It provides the domain models, the error type,
//! the repository traits implemented by `kwgroup-db`, the keyword tokenizer,
//! and the grouping and merge planning that storage backends run inside their
//! transactions.

pub mod defaults;
pub mod error;
pub mod grouping;
pub mod merge;
pub mod models;
pub mod tokenizer;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use grouping::{AttachMode, RestructureStats, Restructured};
pub use merge::{MergeApplication, MergeGraph, MergeMap, MergePlan};
pub use models::*;
pub use tokenizer::{analyze, tokenize, TokenizedKeyword};
pub use traits::*;
pub use uuid_utils::new_v7;

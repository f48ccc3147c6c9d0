//! assocstore - a file-backed store of weighted associations
//!
//! assocstore keeps directed, weighted edges between integer-keyed entities:
//! - Sparse rows ("association blocks") in a single append-only file
//! - A memory-mapped position index that grows by doubling and compacts
//!   the file on every growth
//! - A write-back working set that batches merges before they hit disk
//! - A boolean query solver (AND / OR / NOT over phrases) with field
//!   filters and top-K limits

pub mod block;
pub mod cache;
pub mod config;
pub mod error;
pub mod lookup;
pub mod merge;
pub mod query;
pub mod storage;
pub mod types;

pub use error::{Error, Result};

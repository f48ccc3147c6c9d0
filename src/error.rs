//! Error types for assocstore

use thiserror::Error;

use crate::types::Key;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The file on disk is not something this store can open.
    #[error("Format error: {0}")]
    Format(String),

    #[error("Key {0} is outside the addressable index range")]
    KeyOutOfRange(Key),

    #[error("Metadata slot {slot} out of range; the codec owns {slots}")]
    MetaSlotOutOfRange { slot: usize, slots: usize },

    #[error("Block key mismatch: expected source {expected}, got {actual}")]
    KeyMismatch { expected: Key, actual: Key },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The query is well formed but cannot be answered as written.
    #[error("Query evaluation failed: {0}")]
    QueryEvaluation(String),

    #[error("Unsupported expression: {0}")]
    Unsupported(String),

    #[error("Store is closed")]
    Closed,

    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Error::QueryEvaluation(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        Error::Lookup(msg.into())
    }
}

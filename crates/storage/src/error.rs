use std::sync::Arc;

use thiserror::Error;

/// Errors raised by the page store. Domain failures are sum-typed so that
/// callers can pattern-match; I/O failures wrap the underlying error and are
/// fatal for the store that raised them.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store is closed, or panicked after an earlier I/O failure.
    #[error("store is closed")]
    Closed,

    /// Checksum mismatch, unexpected opcode, or unparsable metadata.
    #[error("file corrupt: {0}")]
    FileCorrupt(String),

    /// Another process holds the file lock.
    #[error("file is locked: {0}")]
    FileLocked(String),

    /// The file was written by an unsupported format version.
    #[error("unsupported format {format}, supported range is {min}..={max}")]
    UnsupportedFormat { format: u64, min: u64, max: u64 },

    #[error("reading failed at position {position}: {source}")]
    ReadingFailed {
        position: u64,
        source: Arc<std::io::Error>,
    },

    #[error("writing failed at position {position}: {source}")]
    WritingFailed {
        position: u64,
        source: Arc<std::io::Error>,
    },

    /// A page position referenced a chunk that is not in the chunk table.
    #[error("chunk {0} not found")]
    ChunkNotFound(u32),

    /// Invariant violation inside the store itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn file_corrupt(message: impl Into<String>) -> Self {
        StoreError::FileCorrupt(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::Internal(message.into())
    }

    pub fn reading(position: u64, source: std::io::Error) -> Self {
        StoreError::ReadingFailed {
            position,
            source: Arc::new(source),
        }
    }

    pub fn writing(position: u64, source: std::io::Error) -> Self {
        StoreError::WritingFailed {
            position,
            source: Arc::new(source),
        }
    }

    /// I/O failures poison the store; everything else leaves it usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::ReadingFailed { .. } | StoreError::WritingFailed { .. }
        )
    }
}

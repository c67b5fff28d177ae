//! Engine error types
//!
//! Defines all errors surfaced by the storage engine.

use thiserror::Error;

/// Which row-key ceiling a query tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Rows returned from the index, before tag filtering
    ReadRows,
    /// Candidate row keys left after tag filtering
    FilteredRows,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::ReadRows => write!(f, "key rows read"),
            LimitKind::FilteredRows => write!(f, "data point partitions"),
        }
    }
}

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum Error {
    /// Synchronous failure from the backing store (binding, preparation,
    /// exhausted hosts)
    #[error("datastore error: {0}")]
    Datastore(String),

    /// Row-key codec rejected malformed bytes or a field containing a
    /// separator byte
    #[error("malformed row key: {0}")]
    MalformedKey(String),

    /// Timestamp does not fit the 31-bit column offset of its row
    #[error("timestamp {timestamp} out of range for row starting at {row_time}")]
    TimestampOutOfRange { timestamp: i64, row_time: i64 },

    /// A query touched more index rows than allowed
    #[error("exceeded limit: {limit} {kind} for metric {metric} via {index} (read={read_count}, filtered={filtered_count})")]
    MaxRowKeysExceeded {
        kind: LimitKind,
        read_count: usize,
        filtered_count: usize,
        limit: usize,
        metric: String,
        index: String,
    },

    /// The memory monitor tripped the configured ceiling
    #[error("query exceeded memory ceiling: {used} bytes used, limit {limit}")]
    OutOfMemory { used: usize, limit: usize },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

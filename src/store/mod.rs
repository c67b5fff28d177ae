//! Store access layer
//!
//! The engine talks to Cassandra through a narrow trait mirroring the
//! prepared statements it binds; the statement texts and the
//! per-operation consistency policy live here.
//!
//! Inserts have submission semantics: a successful return means the
//! write was handed to the session, not that it is durable. Readers must
//! tolerate the transient windows that creates between data rows and
//! their index entries.

pub mod memory;
#[cfg(feature = "scylla")]
pub mod scylla;

use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::query::Order;

/// String-index scope holding every metric name
pub const METRIC_NAMES_SCOPE: &str = "metric_names";
/// String-index scope holding every tag name
pub const TAG_NAMES_SCOPE: &str = "tag_names";

/// CQL statement texts. Parameters bind in declaration order.
pub mod statements {
    pub const DATA_POINTS_INSERT: &str =
        "INSERT INTO data_points (key, column1, value) VALUES (?, ?, ?) USING TTL ?";
    pub const ROW_TIME_KEY_INDEX_INSERT: &str =
        "INSERT INTO row_time_key_index (key, column1, time_bucket) VALUES (?, ?, ?) USING TTL ?";
    pub const ROW_TIME_KEY_SPLIT_INDEX_INSERT: &str =
        "INSERT INTO row_time_key_split_index (metric_name, tag_name, tag_value, column1, time_bucket) VALUES (?, ?, ?, ?, ?) USING TTL ?";
    pub const STRING_INDEX_INSERT: &str =
        "INSERT INTO string_index (key, column1, value) VALUES (?, ?, 0x00) USING TTL ?";

    pub const STRING_INDEX_QUERY: &str = "SELECT column1 FROM string_index WHERE key = ?";
    pub const ROW_TIME_KEY_INDEX_QUERY: &str =
        "SELECT column1 FROM row_time_key_index WHERE key = ? AND time_bucket = ? LIMIT ?";
    pub const ROW_TIME_KEY_SPLIT_INDEX_QUERY: &str =
        "SELECT column1 FROM row_time_key_split_index WHERE metric_name = ? AND tag_name = ? AND tag_value = ? AND time_bucket = ? LIMIT ?";
    pub const DATA_POINTS_QUERY_ASC: &str =
        "SELECT column1, value FROM data_points WHERE key = ? AND column1 >= ? AND column1 < ? ORDER BY column1 ASC";
    pub const DATA_POINTS_QUERY_DESC: &str =
        "SELECT column1, value FROM data_points WHERE key = ? AND column1 >= ? AND column1 < ? ORDER BY column1 DESC";

    pub const DATA_POINTS_DELETE_ROW: &str = "DELETE FROM data_points WHERE key = ?";
    pub const DATA_POINTS_DELETE_COLUMN: &str =
        "DELETE FROM data_points WHERE key = ? AND column1 = ?";
    pub const ROW_TIME_KEY_INDEX_DELETE: &str =
        "DELETE FROM row_time_key_index WHERE key = ? AND column1 = ?";
}

/// Cassandra consistency level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalOne,
    LocalQuorum,
    EachQuorum,
}

impl FromStr for ConsistencyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "ANY" => ConsistencyLevel::Any,
            "ONE" => ConsistencyLevel::One,
            "TWO" => ConsistencyLevel::Two,
            "THREE" => ConsistencyLevel::Three,
            "QUORUM" => ConsistencyLevel::Quorum,
            "ALL" => ConsistencyLevel::All,
            "LOCAL_ONE" => ConsistencyLevel::LocalOne,
            "LOCAL_QUORUM" => ConsistencyLevel::LocalQuorum,
            "EACH_QUORUM" => ConsistencyLevel::EachQuorum,
            other => {
                return Err(Error::Config(format!(
                    "unknown consistency level {other:?}"
                )))
            }
        })
    }
}

/// Per-operation consistency levels, resolved once at statement
/// preparation; per-invocation overrides are not supported
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyPolicy {
    pub read: ConsistencyLevel,
    pub write_datapoint: ConsistencyLevel,
    pub write_meta: ConsistencyLevel,
}

impl Default for ConsistencyPolicy {
    fn default() -> Self {
        Self {
            read: ConsistencyLevel::One,
            write_datapoint: ConsistencyLevel::One,
            write_meta: ConsistencyLevel::Quorum,
        }
    }
}

/// The prepared-statement surface the engine binds against
///
/// One implementation wraps a live session (`scylla` feature); the
/// in-memory one backs the test suite.
#[async_trait]
pub trait CqlStore: Send + Sync {
    async fn insert_data_point(&self, key: &[u8], column: u32, value: &[u8], ttl: u32)
        -> Result<()>;

    async fn insert_row_key_index(
        &self,
        metric: &[u8],
        row_key: &[u8],
        time_bucket: i64,
        ttl: u32,
    ) -> Result<()>;

    async fn insert_row_key_split_index(
        &self,
        metric: &str,
        tag_name: &str,
        tag_value: &str,
        row_key: &[u8],
        time_bucket: i64,
        ttl: u32,
    ) -> Result<()>;

    async fn insert_string_index(&self, scope: &[u8], value: &str, ttl: u32) -> Result<()>;

    async fn query_string_index(&self, scope: &[u8]) -> Result<Vec<String>>;

    async fn query_row_key_index(
        &self,
        metric: &[u8],
        time_bucket: i64,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>>;

    async fn query_row_key_split_index(
        &self,
        metric: &str,
        tag_name: &str,
        tag_value: &str,
        time_bucket: i64,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>>;

    /// Range slice over one data row: `lower <= column < upper` in the
    /// requested order, truncated to `limit` when given
    async fn query_data_points(
        &self,
        key: &[u8],
        lower: u32,
        upper: u32,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<(u32, Vec<u8>)>>;

    async fn delete_data_row(&self, key: &[u8]) -> Result<()>;

    async fn delete_data_column(&self, key: &[u8], column: u32) -> Result<()>;

    async fn delete_row_key_index_entry(&self, metric: &[u8], row_key: &[u8]) -> Result<()>;

    /// Release the underlying session
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistency_level_parsing() {
        assert_eq!(
            "quorum".parse::<ConsistencyLevel>().unwrap(),
            ConsistencyLevel::Quorum
        );
        assert_eq!(
            " LOCAL_QUORUM ".parse::<ConsistencyLevel>().unwrap(),
            ConsistencyLevel::LocalQuorum
        );
        assert!("everyone".parse::<ConsistencyLevel>().is_err());
    }
}

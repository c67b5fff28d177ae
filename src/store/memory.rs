//! In-memory store
//!
//! Mirrors the table shapes of the real schema closely enough for the
//! engine's test suite to run the full write/read/delete paths without a
//! cluster: data rows keyed by serialized row key with a sorted column
//! map, both reverse indexes bucketed by `time_bucket`, and the string
//! index as scoped sets. TTLs are accepted and ignored; consistency does
//! not apply.
//!
//! Inserts apply before the call returns, so a submitted write is always
//! visible to a later query.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::CqlStore;
use crate::error::Result;
use crate::query::Order;

#[derive(Default)]
struct Tables {
    data_points: HashMap<Vec<u8>, BTreeMap<u32, Vec<u8>>>,
    row_key_index: HashMap<Vec<u8>, BTreeMap<i64, BTreeSet<Vec<u8>>>>,
    split_index: HashMap<(String, String, String), BTreeMap<i64, BTreeSet<Vec<u8>>>>,
    string_index: HashMap<Vec<u8>, BTreeSet<String>>,
    last_index_ttl: Option<u32>,
}

/// `CqlStore` backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    data_queries: AtomicUsize,
    index_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of data-table range slices issued so far
    pub fn data_query_count(&self) -> usize {
        self.data_queries.load(AtomicOrdering::Relaxed)
    }

    /// Number of index lookups issued so far
    pub fn index_query_count(&self) -> usize {
        self.index_queries.load(AtomicOrdering::Relaxed)
    }

    /// Number of distinct data rows currently stored
    pub fn data_row_count(&self) -> usize {
        self.tables.lock().data_points.len()
    }

    pub fn contains_data_row(&self, key: &[u8]) -> bool {
        self.tables.lock().data_points.contains_key(key)
    }

    /// TTL of the most recent reverse-index insert
    pub fn last_index_ttl(&self) -> Option<u32> {
        self.tables.lock().last_index_ttl
    }
}

#[async_trait]
impl CqlStore for MemoryStore {
    async fn insert_data_point(
        &self,
        key: &[u8],
        column: u32,
        value: &[u8],
        _ttl: u32,
    ) -> Result<()> {
        self.tables
            .lock()
            .data_points
            .entry(key.to_vec())
            .or_default()
            .insert(column, value.to_vec());
        Ok(())
    }

    async fn insert_row_key_index(
        &self,
        metric: &[u8],
        row_key: &[u8],
        time_bucket: i64,
        ttl: u32,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.last_index_ttl = Some(ttl);
        tables
            .row_key_index
            .entry(metric.to_vec())
            .or_default()
            .entry(time_bucket)
            .or_default()
            .insert(row_key.to_vec());
        Ok(())
    }

    async fn insert_row_key_split_index(
        &self,
        metric: &str,
        tag_name: &str,
        tag_value: &str,
        row_key: &[u8],
        time_bucket: i64,
        ttl: u32,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.last_index_ttl = Some(ttl);
        tables
            .split_index
            .entry((
                metric.to_string(),
                tag_name.to_string(),
                tag_value.to_string(),
            ))
            .or_default()
            .entry(time_bucket)
            .or_default()
            .insert(row_key.to_vec());
        Ok(())
    }

    async fn insert_string_index(&self, scope: &[u8], value: &str, _ttl: u32) -> Result<()> {
        self.tables
            .lock()
            .string_index
            .entry(scope.to_vec())
            .or_default()
            .insert(value.to_string());
        Ok(())
    }

    async fn query_string_index(&self, scope: &[u8]) -> Result<Vec<String>> {
        Ok(self
            .tables
            .lock()
            .string_index
            .get(scope)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn query_row_key_index(
        &self,
        metric: &[u8],
        time_bucket: i64,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>> {
        self.index_queries.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(self
            .tables
            .lock()
            .row_key_index
            .get(metric)
            .and_then(|buckets| buckets.get(&time_bucket))
            .map(|keys| keys.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn query_row_key_split_index(
        &self,
        metric: &str,
        tag_name: &str,
        tag_value: &str,
        time_bucket: i64,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>> {
        self.index_queries.fetch_add(1, AtomicOrdering::Relaxed);
        let lookup = (
            metric.to_string(),
            tag_name.to_string(),
            tag_value.to_string(),
        );
        Ok(self
            .tables
            .lock()
            .split_index
            .get(&lookup)
            .and_then(|buckets| buckets.get(&time_bucket))
            .map(|keys| keys.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn query_data_points(
        &self,
        key: &[u8],
        lower: u32,
        upper: u32,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<(u32, Vec<u8>)>> {
        self.data_queries.fetch_add(1, AtomicOrdering::Relaxed);
        let tables = self.tables.lock();
        let Some(columns) = tables.data_points.get(key) else {
            return Ok(Vec::new());
        };
        let slice = columns
            .range(lower..upper)
            .map(|(column, value)| (*column, value.clone()));
        let mut rows: Vec<(u32, Vec<u8>)> = match order {
            Order::Asc => slice.collect(),
            Order::Desc => slice.rev().collect(),
        };
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn delete_data_row(&self, key: &[u8]) -> Result<()> {
        self.tables.lock().data_points.remove(key);
        Ok(())
    }

    async fn delete_data_column(&self, key: &[u8], column: u32) -> Result<()> {
        let mut tables = self.tables.lock();
        if let Some(columns) = tables.data_points.get_mut(key) {
            columns.remove(&column);
            if columns.is_empty() {
                tables.data_points.remove(key);
            }
        }
        Ok(())
    }

    async fn delete_row_key_index_entry(&self, metric: &[u8], row_key: &[u8]) -> Result<()> {
        let mut tables = self.tables.lock();
        if let Some(buckets) = tables.row_key_index.get_mut(metric) {
            for keys in buckets.values_mut() {
                keys.remove(row_key);
            }
            buckets.retain(|_, keys| !keys.is_empty());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_data_point_range_and_order() {
        let store = MemoryStore::new();
        for column in [2u32, 4, 6, 8] {
            store
                .insert_data_point(b"key", column, &[column as u8], 0)
                .await
                .unwrap();
        }

        let asc = store
            .query_data_points(b"key", 2, 7, Order::Asc, None)
            .await
            .unwrap();
        assert_eq!(asc.iter().map(|(c, _)| *c).collect::<Vec<_>>(), [2, 4, 6]);

        let desc = store
            .query_data_points(b"key", 2, 7, Order::Desc, Some(2))
            .await
            .unwrap();
        assert_eq!(desc.iter().map(|(c, _)| *c).collect::<Vec<_>>(), [6, 4]);
    }

    #[tokio::test]
    async fn test_index_limit_pushdown() {
        let store = MemoryStore::new();
        for i in 0..5u8 {
            store
                .insert_row_key_index(b"cpu", &[i], 0, 0)
                .await
                .unwrap();
        }
        let rows = store.query_row_key_index(b"cpu", 0, 3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(store.index_query_count(), 1);
    }

    #[tokio::test]
    async fn test_index_entry_delete() {
        let store = MemoryStore::new();
        store.insert_row_key_index(b"cpu", b"k1", 0, 0).await.unwrap();
        store.insert_row_key_index(b"cpu", b"k2", 0, 0).await.unwrap();
        store.delete_row_key_index_entry(b"cpu", b"k1").await.unwrap();
        let rows = store.query_row_key_index(b"cpu", 0, 10).await.unwrap();
        assert_eq!(rows, vec![b"k2".to_vec()]);
    }
}

//! The datastore engine
//!
//! Owns the write path (cache-disciplined reverse-index fan-out plus the
//! data-point insert), the read path entry points (planner + runner), the
//! delete path and the engine counters. All store interaction goes
//! through the [`CqlStore`] seam, so the engine itself never touches a
//! driver type.

pub mod warmup;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{KnownKeyCache, RowKeyCache, StringKeyCache};
use crate::config::{Config, WarmingUpConfig};
use crate::datapoint::{DataPoint, LEGACY_DATA_TYPE};
use crate::error::Result;
use crate::key::{self, column, RowKey};
use crate::query::callback::QueryCallback;
use crate::query::memory::MemoryMonitor;
use crate::query::planner::Planner;
use crate::query::runner::Runner;
use crate::query::{MetricQuery, QueryMetadata};
use crate::store::{CqlStore, METRIC_NAMES_SCOPE, TAG_NAMES_SCOPE};

/// Monotonic engine counters, snapshotted and reset per collection
#[derive(Debug, Default)]
pub struct Counters {
    pub row_key_index_inserted: AtomicU64,
    pub next_row_key_index_inserted: AtomicU64,
    pub row_key_split_index_inserted: AtomicU64,
    pub read_rows_exceeded: AtomicU64,
    pub filtered_rows_exceeded: AtomicU64,
}

/// One emitted self-metric sample
#[derive(Debug, Clone)]
pub struct CounterSample {
    pub name: &'static str,
    pub timestamp: i64,
    pub value: u64,
    /// The configured hostname label
    pub host: String,
}

/// Which tags are split-indexed for a metric: the per-metric override
/// when present, otherwise the global list
#[derive(Debug, Clone, Default)]
pub struct IndexTagPolicy {
    global: Vec<String>,
    per_metric: HashMap<String, Vec<String>>,
}

impl IndexTagPolicy {
    pub fn new(global: Vec<String>, per_metric: HashMap<String, Vec<String>>) -> Self {
        Self { global, per_metric }
    }

    pub fn tags_for(&self, metric: &str) -> &[String] {
        self.per_metric
            .get(metric)
            .map(Vec::as_slice)
            .unwrap_or(&self.global)
    }
}

/// The storage engine: one long-lived store handle, three known-key
/// caches and the query machinery
pub struct Datastore {
    store: Arc<dyn CqlStore>,
    datapoint_ttl: u32,
    row_width_read: i64,
    row_width_write: i64,
    hostname: String,
    max_query_memory_bytes: usize,
    warming_up: WarmingUpConfig,
    index_tags: Arc<IndexTagPolicy>,
    row_key_cache: RowKeyCache,
    metric_name_cache: StringKeyCache,
    tag_name_cache: StringKeyCache,
    counters: Arc<Counters>,
    planner: Planner,
    runner: Runner,
}

impl Datastore {
    /// Create an engine with caches sized and TTL'd from the
    /// configuration
    pub fn new(config: &Config, store: Arc<dyn CqlStore>) -> Result<Self> {
        // Cache entries must not outlive the index rows they stand for.
        let cache_ttl = if config.datapoint_ttl_seconds > 0 {
            Duration::from_secs(
                config.datapoint_ttl_seconds as u64 + (config.row_width_write_ms / 1000) as u64,
            )
        } else {
            Duration::ZERO
        };
        Self::with_caches(
            config,
            store,
            KnownKeyCache::new(config.row_key_cache_size, cache_ttl),
            KnownKeyCache::new(config.string_cache_size, cache_ttl),
            KnownKeyCache::new(config.string_cache_size, cache_ttl),
        )
    }

    /// Create an engine with caller-supplied caches, e.g. disabled ones
    /// in tests
    pub fn with_caches(
        config: &Config,
        store: Arc<dyn CqlStore>,
        row_key_cache: RowKeyCache,
        metric_name_cache: StringKeyCache,
        tag_name_cache: StringKeyCache,
    ) -> Result<Self> {
        config.validate()?;

        let index_tags = Arc::new(IndexTagPolicy::new(
            config.index_tag_list(),
            config.metric_index_tag_map(),
        ));
        tracing::info!(tags = ?index_tags.tags_for(""), "split index tag list");

        let counters = Arc::new(Counters::default());
        let planner = Planner::new(
            Arc::clone(&store),
            config,
            Arc::clone(&index_tags),
            Arc::clone(&counters),
        );
        let runner = Runner::new(Arc::clone(&store), config);

        Ok(Self {
            store,
            datapoint_ttl: config.datapoint_ttl_seconds,
            row_width_read: config.row_width_read_ms,
            row_width_write: config.row_width_write_ms,
            hostname: config.hostname.clone(),
            max_query_memory_bytes: config.max_query_memory_bytes,
            warming_up: config.warming_up.clone(),
            index_tags,
            row_key_cache,
            metric_name_cache,
            tag_name_cache,
            counters,
            planner,
            runner,
        })
    }

    // ==================== Write path ====================

    /// Store one data point and its reverse-index artefacts
    pub async fn put_data_point(
        &self,
        metric: &str,
        tags: &BTreeMap<String, String>,
        point: &DataPoint,
        ttl_seconds: u32,
    ) -> Result<()> {
        let mut ttl = ttl_seconds;
        if ttl == 0 {
            ttl = self.datapoint_ttl;
        }
        // Index rows outlive the data they describe by one write row.
        let index_ttl = if ttl != 0 {
            ttl + (self.row_width_write / 1000) as u32
        } else {
            0
        };

        let row_time = key::row_time(point.timestamp, self.row_width_write);
        let row_key = RowKey::new(metric, row_time, &point.data_type, tags.clone());
        let serialized = row_key.to_bytes()?;

        if !self.row_key_cache.is_known(&serialized) {
            self.store_row_key_reverse_lookups(metric, row_time, &serialized, index_ttl, tags)
                .await?;
            self.row_key_cache.insert(serialized.clone());

            if !self.metric_name_cache.is_known(metric) {
                if metric.is_empty() {
                    tracing::warn!(?point, "attempted to index an empty metric name");
                }
                self.store
                    .insert_string_index(METRIC_NAMES_SCOPE.as_bytes(), metric, self.datapoint_ttl)
                    .await?;
                self.metric_name_cache.insert(metric.to_string());
            }

            for tag_name in tags.keys() {
                if !self.tag_name_cache.is_known(tag_name.as_str()) {
                    if tag_name.is_empty() {
                        tracing::warn!(metric, "attempted to index an empty tag name");
                    }
                    self.store
                        .insert_string_index(
                            TAG_NAMES_SCOPE.as_bytes(),
                            tag_name,
                            self.datapoint_ttl,
                        )
                        .await?;
                    self.tag_name_cache.insert(tag_name.clone());
                }
            }
        }

        if self.warming_up.enabled {
            self.warm_up_next_bucket(metric, tags, point, index_ttl).await?;
        }

        let column = column::encode(row_time, point.timestamp)?;
        self.store
            .insert_data_point(&serialized, column, &point.value, ttl)
            .await?;
        Ok(())
    }

    /// Pre-create the next bucket's index entries when the warm-up
    /// predicate says the boundary is near enough for this key
    async fn warm_up_next_bucket(
        &self,
        metric: &str,
        tags: &BTreeMap<String, String>,
        point: &DataPoint,
        index_ttl: u32,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let next_row_time =
            key::row_time(point.timestamp + self.row_width_write, self.row_width_write);
        let next_key = RowKey::new(metric, next_row_time, &point.data_type, tags.clone());

        if !warmup::is_warming_up_needed(
            warmup::key_hash(&next_key),
            now,
            next_row_time,
            self.warming_up.heating_interval_minutes,
            self.warming_up.row_interval_minutes,
        ) {
            return Ok(());
        }

        let serialized = next_key.to_bytes()?;
        if !self.row_key_cache.is_known(&serialized) {
            self.store_row_key_reverse_lookups(metric, next_row_time, &serialized, index_ttl, tags)
                .await?;
            self.row_key_cache.insert(serialized);
            self.counters
                .next_row_key_index_inserted
                .fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(())
    }

    async fn store_row_key_reverse_lookups(
        &self,
        metric: &str,
        row_time: i64,
        serialized: &[u8],
        index_ttl: u32,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.store
            .insert_row_key_index(metric.as_bytes(), serialized, row_time, index_ttl)
            .await?;
        self.counters
            .row_key_index_inserted
            .fetch_add(1, AtomicOrdering::Relaxed);

        for tag_name in self.index_tags.tags_for(metric) {
            match tags.get(tag_name) {
                Some(value) if !value.is_empty() => {
                    self.store
                        .insert_row_key_split_index(
                            metric, tag_name, value, serialized, row_time, index_ttl,
                        )
                        .await?;
                    self.counters
                        .row_key_split_index_inserted
                        .fetch_add(1, AtomicOrdering::Relaxed);
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ==================== Read path ====================

    /// Every metric name ever written
    pub async fn metric_names(&self) -> Result<Vec<String>> {
        self.store
            .query_string_index(METRIC_NAMES_SCOPE.as_bytes())
            .await
    }

    /// Every tag name ever written
    pub async fn tag_names(&self) -> Result<Vec<String>> {
        self.store.query_string_index(TAG_NAMES_SCOPE.as_bytes()).await
    }

    /// Stream the data points matching `query` to `callback`
    ///
    /// Returns the planner's observability record, or `None` when a
    /// plugin supplied the candidate keys and the planner never ran.
    pub async fn query(
        &self,
        query: &MetricQuery,
        callback: &mut dyn QueryCallback,
    ) -> Result<Option<QueryMetadata>> {
        let (keys, metadata) = self.keys_for_query(query).await?;
        self.runner.run(query, keys, callback).await?;
        Ok(metadata)
    }

    /// The tag key/value pairs of all rows matching `query`, without
    /// touching the data table
    pub async fn query_metric_tags(
        &self,
        query: &MetricQuery,
    ) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let (keys, _) = self.keys_for_query(query).await?;
        let mut monitor = MemoryMonitor::new(20, self.max_query_memory_bytes);
        let mut tag_set: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row_key in &keys {
            for (name, value) in row_key.tags() {
                monitor.observe(name.len() + value.len())?;
                tag_set.entry(name.clone()).or_default().insert(value.clone());
            }
        }
        Ok(tag_set)
    }

    async fn keys_for_query(
        &self,
        query: &MetricQuery,
    ) -> Result<(Vec<RowKey>, Option<QueryMetadata>)> {
        // The first plugin able to provide keys replaces the planner.
        for plugin in &query.plugins {
            if let Some(provider) = plugin.row_key_provider() {
                return Ok((provider.candidate_keys(query), None));
            }
        }
        let (keys, metadata) = self.planner.matching_row_keys(query).await?;
        Ok((keys, Some(metadata)))
    }

    // ==================== Delete path ====================

    /// Delete the data points matching `query`
    ///
    /// Rows fully covered by the range are dropped whole, together with
    /// their global-index entry; partially covered rows are re-queried
    /// and deleted column by column.
    pub async fn delete_data_points(&self, query: &MetricQuery) -> Result<()> {
        let (keys, _) = self.keys_for_query(query).await?;

        let mut partial_rows = Vec::new();
        let mut deleted_full_rows = false;
        for row_key in keys {
            let row_time = row_key.row_time();
            if query.start <= row_time && query.end >= row_time + self.row_width_read - 1 {
                let serialized = row_key.to_bytes()?;
                self.store.delete_data_row(&serialized).await?;
                self.store
                    .delete_row_key_index_entry(row_key.metric().as_bytes(), &serialized)
                    .await?;
                deleted_full_rows = true;
            } else {
                partial_rows.push(row_key);
            }
        }

        if deleted_full_rows {
            // The cache must not keep claiming the deleted index entries
            // exist; the next write through re-creates them.
            self.row_key_cache.clear();
        }

        if !partial_rows.is_empty() {
            let (sender, deleter) = self.spawn_deleter();
            let mut callback =
                DeletingCallback::new(&query.metric, self.row_width_write, sender);
            self.runner.run(query, partial_rows, &mut callback).await?;
            drop(callback);
            if let Err(e) = deleter.await {
                tracing::error!(error = %e, "column deleter task failed");
            }
        }
        Ok(())
    }

    /// Drains (key, column) pairs and issues the column deletes without
    /// blocking the runner
    fn spawn_deleter(&self) -> (mpsc::UnboundedSender<(Vec<u8>, u32)>, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(Vec<u8>, u32)>();
        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(async move {
            while let Some((row_key, column)) = receiver.recv().await {
                if let Err(e) = store.delete_data_column(&row_key, column).await {
                    tracing::error!(error = %e, "data point delete failed");
                }
            }
        });
        (sender, handle)
    }

    // ==================== Reporting ====================

    /// Snapshot and reset the engine counters as self-metric samples
    pub fn counter_samples(&self, now: i64) -> Vec<CounterSample> {
        let counters: [(&'static str, &AtomicU64); 5] = [
            (
                "kairosdb.inserted.row_key_index",
                &self.counters.row_key_index_inserted,
            ),
            (
                "kairosdb.inserted.next_row_key_index",
                &self.counters.next_row_key_index_inserted,
            ),
            (
                "kairosdb.inserted.row_key_split_index",
                &self.counters.row_key_split_index_inserted,
            ),
            (
                "kairosdb.limits.read_rows_exceeded",
                &self.counters.read_rows_exceeded,
            ),
            (
                "kairosdb.limits.filtered_rows_exceeded",
                &self.counters.filtered_rows_exceeded,
            ),
        ];
        counters
            .into_iter()
            .map(|(name, counter)| CounterSample {
                name,
                timestamp: now,
                value: counter.swap(0, AtomicOrdering::Relaxed),
                host: self.hostname.clone(),
            })
            .collect()
    }

    /// The engine counters, for callers that aggregate them directly
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Release the underlying session
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

/// Callback that turns a partial-row query back into per-column deletes
struct DeletingCallback {
    metric: String,
    row_width_write: i64,
    current_type: String,
    current_tags: BTreeMap<String, String>,
    current_row: Option<Vec<u8>>,
    deletes: mpsc::UnboundedSender<(Vec<u8>, u32)>,
}

impl DeletingCallback {
    fn new(metric: &str, row_width_write: i64, deletes: mpsc::UnboundedSender<(Vec<u8>, u32)>) -> Self {
        Self {
            metric: metric.to_string(),
            row_width_write,
            current_type: String::new(),
            current_tags: BTreeMap::new(),
            current_row: None,
            deletes,
        }
    }
}

impl QueryCallback for DeletingCallback {
    fn start_data_point_set(
        &mut self,
        data_type: &str,
        tags: &BTreeMap<String, String>,
    ) -> io::Result<()> {
        self.current_type = data_type.to_string();
        self.current_tags = tags.clone();
        // Re-derived from the first data point of the set.
        self.current_row = None;
        Ok(())
    }

    fn add_data_point(&mut self, point: DataPoint) -> io::Result<()> {
        let row_time = key::row_time(point.timestamp, self.row_width_write);
        if self.current_row.is_none() {
            let row_key = RowKey::new(
                &self.metric,
                row_time,
                &self.current_type,
                self.current_tags.clone(),
            );
            let serialized = row_key
                .to_bytes()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            self.current_row = Some(serialized);
        }

        // Legacy rows carry the long/float flag in the column.
        let column = if self.current_type == LEGACY_DATA_TYPE {
            column::encode_legacy(row_time, point.timestamp, point.legacy_long)
        } else {
            column::encode(row_time, point.timestamp)
        }
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if let Some(row_key) = &self.current_row {
            // A closed receiver means the deleter died; nothing to do
            // but let the remaining sends drop.
            let _ = self.deletes.send((row_key.clone(), column));
        }
        Ok(())
    }

    fn end_data_points(&mut self) -> io::Result<()> {
        Ok(())
    }
}

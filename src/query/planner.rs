//! Index reader and planner
//!
//! Turns a query into the set of row keys to read: picks the cheapest
//! eligible index, fans lookups out per bucket (and per split value),
//! drains them as they complete, filters candidates through the tag
//! globs and enforces both row-key ceilings incrementally so a runaway
//! query aborts early.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use rand::Rng;
use regex::Regex;

use crate::config::Config;
use crate::datastore::{Counters, IndexTagPolicy};
use crate::error::{Error, LimitKind, Result};
use crate::key::{self, RowKey};
use crate::query::{glob, MetricQuery, QueryClass, QueryMetadata};
use crate::store::CqlStore;

/// Read counts above this mark a query critical
const CRITICAL_READ_COUNT: usize = 5000;
/// Filtered-candidate counts above this mark a query critical
const CRITICAL_FILTERED_COUNT: usize = 100;

pub(crate) struct Planner {
    store: Arc<dyn CqlStore>,
    row_width_read: i64,
    row_width_write: i64,
    index_tags: Arc<IndexTagPolicy>,
    max_read_rows: usize,
    max_filtered_rows: usize,
    sampling_percentage: u32,
    counters: Arc<Counters>,
}

impl Planner {
    pub fn new(
        store: Arc<dyn CqlStore>,
        config: &Config,
        index_tags: Arc<IndexTagPolicy>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            store,
            row_width_read: config.row_width_read_ms,
            row_width_write: config.row_width_write_ms,
            index_tags,
            max_read_rows: config.max_rows_for_keys_query,
            max_filtered_rows: config.max_row_keys_for_query,
            sampling_percentage: config.query_sampling_percentage,
            counters,
        }
    }

    /// Resolve a query to the row keys matching its tag filters
    pub async fn matching_row_keys(
        &self,
        query: &MetricQuery,
    ) -> Result<(Vec<RowKey>, QueryMetadata)> {
        let start_bucket = key::row_time(query.start, self.row_width_read);
        // The end bucket is floored to the narrower write width so the
        // final partial bucket is still enumerated.
        let end_bucket = key::row_time(query.end, self.row_width_write);

        // One extra row lets the read ceiling trip inside the result set.
        let lookup_limit = self.max_read_rows + 1;

        let split = self.choose_split(query);
        let index_name = match split {
            Some((tag, _)) => format!("row_time_key_split_index:{tag}"),
            None => "row_time_key_index".to_string(),
        };

        let mut lookups: FuturesUnordered<BoxFuture<'static, Result<Vec<Vec<u8>>>>> =
            FuturesUnordered::new();
        let mut bucket = start_bucket;
        while bucket <= end_bucket {
            match split {
                Some((tag, values)) => {
                    for value in values {
                        let store = Arc::clone(&self.store);
                        let metric = query.metric.clone();
                        let tag = tag.to_string();
                        let value = value.clone();
                        lookups.push(
                            async move {
                                store
                                    .query_row_key_split_index(
                                        &metric,
                                        &tag,
                                        &value,
                                        bucket,
                                        lookup_limit,
                                    )
                                    .await
                            }
                            .boxed(),
                        );
                    }
                }
                None => {
                    let store = Arc::clone(&self.store);
                    let metric_bytes = query.metric.clone().into_bytes();
                    lookups.push(
                        async move {
                            store
                                .query_row_key_index(&metric_bytes, bucket, lookup_limit)
                                .await
                        }
                        .boxed(),
                    );
                }
            }
            bucket += self.row_width_read;
        }

        tracing::debug!(
            metric = %query.metric,
            index = %index_name,
            lookups = lookups.len(),
            "index fan-out"
        );

        let patterns = compile_tag_patterns(query)?;
        let mut row_keys: Vec<RowKey> = Vec::new();
        let mut read_count = 0usize;
        while let Some(result) = lookups.next().await {
            for bytes in result? {
                read_count += 1;
                if read_count > self.max_read_rows {
                    return Err(self.limit_violation(
                        LimitKind::ReadRows,
                        read_count,
                        row_keys.len(),
                        self.max_read_rows,
                        query,
                        &index_name,
                    ));
                }
                let row_key = RowKey::from_bytes(&bytes)?;
                if matches_tag_filters(&row_key, &patterns) {
                    row_keys.push(row_key);
                }
            }
            if row_keys.len() > self.max_filtered_rows {
                return Err(self.limit_violation(
                    LimitKind::FilteredRows,
                    read_count,
                    row_keys.len(),
                    self.max_filtered_rows,
                    query,
                    &index_name,
                ));
            }
        }

        let critical =
            read_count > CRITICAL_READ_COUNT || row_keys.len() > CRITICAL_FILTERED_COUNT;
        let sampled =
            critical || rand::thread_rng().gen_range(0..100u32) < self.sampling_percentage;
        let metadata = QueryMetadata {
            class: if critical {
                QueryClass::Critical
            } else {
                QueryClass::Simple
            },
            read_count,
            index: index_name,
            sampled,
        };

        tracing::debug!(
            metric = %query.metric,
            candidates = row_keys.len(),
            read = read_count,
            critical,
            "index lookup complete"
        );

        Ok((row_keys, metadata))
    }

    /// Pick the split-indexed tag with the fewest filter values; any tag
    /// filtered with a wildcard is ineligible
    fn choose_split<'a>(&'a self, query: &'a MetricQuery) -> Option<(&'a str, &'a BTreeSet<String>)> {
        let mut chosen: Option<(&str, &BTreeSet<String>)> = None;
        for tag in self.index_tags.tags_for(&query.metric) {
            let Some(values) = query.tags.get(tag) else {
                continue;
            };
            if values.is_empty() {
                continue;
            }
            if values.iter().any(|v| v.contains('*') || v.contains('?')) {
                continue;
            }
            let better = match chosen {
                None => true,
                Some((_, current)) => values.len() < current.len(),
            };
            if better {
                chosen = Some((tag.as_str(), values));
            }
        }
        chosen
    }

    fn limit_violation(
        &self,
        kind: LimitKind,
        read_count: usize,
        filtered_count: usize,
        limit: usize,
        query: &MetricQuery,
        index: &str,
    ) -> Error {
        let counter = match kind {
            LimitKind::ReadRows => &self.counters.read_rows_exceeded,
            LimitKind::FilteredRows => &self.counters.filtered_rows_exceeded,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);

        let duration = query.end - query.start;
        let is_until_now = Utc::now().timestamp_millis() - query.end <= 30_000;
        tracing::warn!(
            metric = %query.metric,
            filter = ?query.tags,
            read_count,
            filtered_count,
            start_time = query.start,
            end_time = query.end,
            duration,
            is_until_now,
            limit,
            index,
            "query limit violation"
        );

        Error::MaxRowKeysExceeded {
            kind,
            read_count,
            filtered_count,
            limit,
            metric: query.metric.clone(),
            index: index.to_string(),
        }
    }
}

fn compile_tag_patterns(query: &MetricQuery) -> Result<HashMap<&str, Vec<Regex>>> {
    let mut patterns = HashMap::with_capacity(query.tags.len());
    for (tag, globs) in &query.tags {
        let compiled: Vec<Regex> = globs
            .iter()
            .map(|pattern| glob::compile(pattern))
            .collect::<Result<_>>()?;
        patterns.insert(tag.as_str(), compiled);
    }
    Ok(patterns)
}

/// A candidate is kept when, for every filter tag, it carries the tag and
/// at least one glob matches its value; a missing tag rejects the key.
fn matches_tag_filters(row_key: &RowKey, patterns: &HashMap<&str, Vec<Regex>>) -> bool {
    patterns.iter().all(|(tag, globs)| {
        row_key
            .tags()
            .get(*tag)
            .map_or(false, |value| glob::matches_any(value, globs))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::memory::MemoryStore;
    use std::collections::BTreeMap;

    fn planner_with(
        store: Arc<MemoryStore>,
        config: &Config,
        global_tags: &[&str],
    ) -> Planner {
        let policy = IndexTagPolicy::new(
            global_tags.iter().map(|t| t.to_string()).collect(),
            HashMap::new(),
        );
        Planner::new(store, config, Arc::new(policy), Arc::new(Counters::default()))
    }

    fn config() -> Config {
        Config {
            row_width_read_ms: 3_600_000,
            row_width_write_ms: 3_600_000,
            ..Config::default()
        }
    }

    fn key_bytes(metric: &str, row_time: i64, tags: &[(&str, &str)]) -> Vec<u8> {
        let tags: BTreeMap<String, String> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RowKey::new(metric, row_time, "kairos_long", tags)
            .to_bytes()
            .unwrap()
    }

    async fn seed_global(store: &MemoryStore, metric: &str, row_time: i64, tags: &[(&str, &str)]) {
        let bytes = key_bytes(metric, row_time, tags);
        store
            .insert_row_key_index(metric.as_bytes(), &bytes, row_time, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_split_choice_prefers_smallest_value_set() {
        let store = Arc::new(MemoryStore::new());
        let planner = planner_with(Arc::clone(&store), &config(), &["a", "b"]);

        let query = MetricQuery::new("m", 0, 1000)
            .tag("a", "v1")
            .tag("b", "v1")
            .tag("b", "v2")
            .tag("b", "v3");
        let (_, metadata) = planner.matching_row_keys(&query).await.unwrap();
        assert_eq!(metadata.index, "row_time_key_split_index:a");
    }

    #[tokio::test]
    async fn test_wildcard_disqualifies_split_tag() {
        let store = Arc::new(MemoryStore::new());
        let planner = planner_with(Arc::clone(&store), &config(), &["env"]);

        let query = MetricQuery::new("m", 0, 1000).tag("env", "pr*");
        let (_, metadata) = planner.matching_row_keys(&query).await.unwrap();
        assert_eq!(metadata.index, "row_time_key_index");

        let query = MetricQuery::new("m", 0, 1000).tag("env", "prod?");
        let (_, metadata) = planner.matching_row_keys(&query).await.unwrap();
        assert_eq!(metadata.index, "row_time_key_index");
    }

    #[tokio::test]
    async fn test_filters_candidates_by_glob() {
        let store = Arc::new(MemoryStore::new());
        seed_global(&store, "m", 0, &[("host", "web-1")]).await;
        seed_global(&store, "m", 0, &[("host", "web-2")]).await;
        seed_global(&store, "m", 0, &[("host", "db-1")]).await;
        seed_global(&store, "m", 0, &[("dc", "x")]).await;

        let planner = planner_with(Arc::clone(&store), &config(), &[]);
        let query = MetricQuery::new("m", 0, 1000).tag("host", "web-*");
        let (keys, metadata) = planner.matching_row_keys(&query).await.unwrap();

        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.tags()["host"].starts_with("web-")));
        // The key without a host tag is rejected, but it was still read.
        assert_eq!(metadata.read_count, 4);
    }

    #[tokio::test]
    async fn test_read_ceiling_trips() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            seed_global(&store, "m", 0, &[("n", &i.to_string())]).await;
        }

        let mut cfg = config();
        cfg.max_rows_for_keys_query = 3;
        let planner = planner_with(Arc::clone(&store), &cfg, &[]);
        let counters = Arc::clone(&planner.counters);

        let err = planner
            .matching_row_keys(&MetricQuery::new("m", 0, 1000))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MaxRowKeysExceeded {
                kind: LimitKind::ReadRows,
                limit: 3,
                ..
            }
        ));
        assert_eq!(
            counters.read_rows_exceeded.load(AtomicOrdering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_filtered_ceiling_trips() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            seed_global(&store, "m", 0, &[("host", &format!("web-{i}"))]).await;
        }

        let mut cfg = config();
        cfg.max_row_keys_for_query = 2;
        let planner = planner_with(Arc::clone(&store), &cfg, &[]);
        let counters = Arc::clone(&planner.counters);

        let err = planner
            .matching_row_keys(&MetricQuery::new("m", 0, 1000).tag("host", "web-*"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MaxRowKeysExceeded {
                kind: LimitKind::FilteredRows,
                limit: 2,
                ..
            }
        ));
        assert_eq!(
            counters.filtered_rows_exceeded.load(AtomicOrdering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_split_lookup_fans_out_per_bucket_and_value() {
        let store = Arc::new(MemoryStore::new());
        let planner = planner_with(Arc::clone(&store), &config(), &["host"]);

        // Two buckets, two split values: four lookups.
        let query = MetricQuery::new("m", 0, 7_100_000)
            .tag("host", "a")
            .tag("host", "b");
        planner.matching_row_keys(&query).await.unwrap();
        assert_eq!(store.index_query_count(), 4);
    }
}

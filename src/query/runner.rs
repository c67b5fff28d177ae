//! Query runner
//!
//! Executes the data-table reads for a set of candidate row keys: sorts
//! them, groups neighbours sharing (row time, data type) into batches,
//! issues one clamped range slice per key and pushes decoded points to
//! the callback series by series.
//!
//! A failing callback is recorded and the remaining batches still run;
//! the callback is always finalized. Engine and store failures abort the
//! whole query.

use std::io;
use std::sync::Arc;

use crate::config::Config;
use crate::datapoint::{DataPoint, LEGACY_DATA_TYPE};
use crate::error::{Error, Result};
use crate::key::{column, RowKey};
use crate::query::callback::QueryCallback;
use crate::query::memory::MemoryMonitor;
use crate::query::{MetricQuery, Order};
use crate::store::CqlStore;

/// Below this many candidates the keys are read as one batch
const SINGLE_BATCH_THRESHOLD: usize = 64;

pub(crate) struct Runner {
    store: Arc<dyn CqlStore>,
    row_width_read: i64,
    max_query_memory_bytes: usize,
    memory_check_rate: u32,
}

enum BatchError {
    Engine(Error),
    Sink(io::Error),
}

impl From<Error> for BatchError {
    fn from(e: Error) -> Self {
        BatchError::Engine(e)
    }
}

impl From<io::Error> for BatchError {
    fn from(e: io::Error) -> Self {
        BatchError::Sink(e)
    }
}

impl Runner {
    pub fn new(store: Arc<dyn CqlStore>, config: &Config) -> Self {
        Self {
            store,
            row_width_read: config.row_width_read_ms,
            max_query_memory_bytes: config.max_query_memory_bytes,
            memory_check_rate: config.memory_check_rate,
        }
    }

    /// Stream the data points of `keys` to `callback` in the query's
    /// order
    pub async fn run(
        &self,
        query: &MetricQuery,
        mut keys: Vec<RowKey>,
        callback: &mut dyn QueryCallback,
    ) -> Result<()> {
        // Sort by row time in the requested direction so the callback
        // sees buckets in order; the full key ordering keeps batch
        // grouping deterministic.
        keys.sort();
        if query.order == Order::Desc {
            keys.reverse();
        }

        let mut monitor = MemoryMonitor::new(self.memory_check_rate, self.max_query_memory_bytes);
        let batches = form_batches(keys);
        tracing::debug!(metric = %query.metric, batches = batches.len(), "running data point batches");

        monitor.set_check_rate(1);
        for batch in &batches {
            match self.run_batch(query, batch, callback, &mut monitor).await {
                Ok(()) => {}
                Err(BatchError::Engine(e)) => return Err(e),
                Err(BatchError::Sink(e)) => {
                    tracing::warn!(
                        metric = %query.metric,
                        error = %e,
                        "result sink failed; continuing with remaining batches"
                    );
                }
            }
            monitor.check_now()?;
        }

        if let Err(e) = callback.end_data_points() {
            tracing::warn!(metric = %query.metric, error = %e, "result sink failed to finalize");
        }
        Ok(())
    }

    async fn run_batch(
        &self,
        query: &MetricQuery,
        batch: &[RowKey],
        callback: &mut dyn QueryCallback,
        monitor: &mut MemoryMonitor,
    ) -> std::result::Result<(), BatchError> {
        for key in batch {
            let row_time = key.row_time();
            let row_end = row_time + self.row_width_read - 1;
            if query.end < row_time || query.start > row_end {
                continue;
            }

            let lower = column::encode(row_time, query.start.max(row_time)).map_err(Error::from)?;
            // One past both flag variants of the clamped end timestamp.
            let upper = column::encode(row_time, query.end.min(row_end))
                .map_err(Error::from)?
                .saturating_add(2);

            let serialized = key.to_bytes().map_err(Error::from)?;
            monitor.observe(serialized.len())?;

            let columns = self
                .store
                .query_data_points(&serialized, lower, upper, query.order, query.limit)
                .await?;

            callback.start_data_point_set(key.data_type(), key.tags())?;
            for (column, value) in columns {
                monitor.observe(value.len() + 8)?;
                let timestamp = column::decode_timestamp(row_time, column);
                let is_legacy_long =
                    key.data_type() == LEGACY_DATA_TYPE && column::is_legacy_long(column);
                let point = DataPoint::new(timestamp, key.data_type(), value)
                    .legacy_long(is_legacy_long);
                callback.add_data_point(point)?;
            }
        }
        Ok(())
    }
}

/// Group sorted keys into runs of identical (row time, data type); small
/// candidate sets are read as a single batch.
fn form_batches(keys: Vec<RowKey>) -> Vec<Vec<RowKey>> {
    if keys.is_empty() {
        return Vec::new();
    }
    if keys.len() < SINGLE_BATCH_THRESHOLD {
        return vec![keys];
    }

    let mut batches = Vec::new();
    let mut current: Vec<RowKey> = Vec::new();
    for key in keys {
        let breaks = current.last().map_or(false, |last| {
            last.row_time() != key.row_time() || last.data_type() != key.data_type()
        });
        if breaks {
            batches.push(std::mem::take(&mut current));
        }
        current.push(key);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key(metric: &str, row_time: i64, data_type: &str, n: u32) -> RowKey {
        let mut tags = BTreeMap::new();
        tags.insert("n".to_string(), n.to_string());
        RowKey::new(metric, row_time, data_type, tags)
    }

    #[test]
    fn test_small_candidate_sets_form_one_batch() {
        let keys: Vec<RowKey> = (0..10).map(|i| key("m", 0, "kairos_long", i)).collect();
        let batches = form_batches(keys);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 10);
    }

    #[test]
    fn test_batches_split_on_row_time_and_type() {
        let mut keys = Vec::new();
        for i in 0..40 {
            keys.push(key("m", 0, "kairos_long", i));
        }
        for i in 0..40 {
            keys.push(key("m", 0, "kairos_double", i));
        }
        for i in 0..40 {
            keys.push(key("m", 3_600_000, "kairos_long", i));
        }
        keys.sort();

        let batches = form_batches(keys);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 40));
        for batch in &batches {
            assert!(batch
                .iter()
                .all(|k| k.row_time() == batch[0].row_time()
                    && k.data_type() == batch[0].data_type()));
        }
    }

    #[test]
    fn test_empty_candidates() {
        assert!(form_batches(Vec::new()).is_empty());
    }
}

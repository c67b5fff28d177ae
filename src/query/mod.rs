//! Query model and read path
//!
//! A query names a metric, a millisecond time range, a tag filter
//! multimap whose values are glob patterns, an optional per-row limit
//! and a scan order. The planner resolves it to candidate row keys, the
//! runner turns those into data-table slices streamed to a callback.
//!
//! Plugins can bypass the planner entirely by providing candidate row
//! keys themselves.

pub mod callback;
pub mod glob;
pub mod memory;
pub(crate) mod planner;
pub(crate) mod runner;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::key::RowKey;

/// Scan direction of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// A metric query against the engine
#[derive(Clone)]
pub struct MetricQuery {
    pub metric: String,
    /// Start of the queried range, inclusive, in milliseconds
    pub start: i64,
    /// End of the queried range, inclusive, in milliseconds
    pub end: i64,
    /// Tag filters: a candidate matches when, for every entry, at least
    /// one glob matches its value for that tag
    pub tags: BTreeMap<String, BTreeSet<String>>,
    /// Per-row cap on returned data points
    pub limit: Option<usize>,
    pub order: Order,
    pub plugins: Vec<Arc<dyn QueryPlugin>>,
}

impl MetricQuery {
    pub fn new(metric: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            metric: metric.into(),
            start,
            end,
            tags: BTreeMap::new(),
            limit: None,
            order: Order::Asc,
            plugins: Vec::new(),
        }
    }

    /// Builder method: add one glob filter value for a tag
    pub fn tag(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.tags
            .entry(name.into())
            .or_default()
            .insert(pattern.into());
        self
    }

    /// Builder method: cap the number of points returned per row
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Builder method: set the scan order
    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    /// Builder method: attach a plugin
    pub fn plugin(mut self, plugin: Arc<dyn QueryPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }
}

impl fmt::Debug for MetricQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricQuery")
            .field("metric", &self.metric)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("tags", &self.tags)
            .field("limit", &self.limit)
            .field("order", &self.order)
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

/// Extension point carried on a query
pub trait QueryPlugin: Send + Sync {
    /// Narrow capability: plugins that can name the row keys to read
    /// return a provider here
    fn row_key_provider(&self) -> Option<&dyn RowKeyProvider> {
        None
    }
}

/// Supplies candidate row keys in place of the index lookup
pub trait RowKeyProvider: Send + Sync {
    fn candidate_keys(&self, query: &MetricQuery) -> Vec<RowKey>;
}

/// How a finished index lookup is classified for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Simple,
    Critical,
}

/// Observability record attached to a planned query
#[derive(Debug, Clone)]
pub struct QueryMetadata {
    pub class: QueryClass,
    /// Index rows read, before tag filtering
    pub read_count: usize,
    /// Which index served the lookup
    pub index: String,
    /// Whether the query was selected for sampling
    pub sampled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builder() {
        let query = MetricQuery::new("cpu", 0, 1000)
            .tag("host", "a")
            .tag("host", "b")
            .tag("dc", "x")
            .limit(10)
            .order(Order::Desc);

        assert_eq!(query.metric, "cpu");
        assert_eq!(query.tags["host"].len(), 2);
        assert_eq!(query.tags["dc"].len(), 1);
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.order, Order::Desc);
    }
}

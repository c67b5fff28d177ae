//! # Cairn
//!
//! Wide-column time-series storage engine for Cassandra. Maps the
//! (metric name, tag set, timestamped values) domain model onto a
//! partitioned key/column schema built for cheap range reads over time.
//!
//! ## How it works
//!
//! - **Writes** serialize a canonical row key per (metric, row time,
//!   data type, tag set), fan the reverse-index inserts out
//!   fire-and-forget, and suppress redundant index writes with bounded
//!   known-key caches.
//! - **Reads** plan between a global metric index and a per-tag split
//!   index, fan bucket lookups out concurrently, filter candidates by
//!   glob tag filters under hard row ceilings, then stream data points
//!   batch by batch to a push callback.
//!
//! ## Modules
//!
//! - [`datastore`]: the engine — write, read, delete paths and counters
//! - [`key`]: row-key and column-name codecs
//! - [`cache`]: known-key caches backing the write path
//! - [`query`]: query model, planner, runner, glob filters
//! - [`store`]: the CQL seam — statements, consistency, backends
//! - [`config`]: TOML configuration and option grammars
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use cairn::store::memory::MemoryStore;
//! use cairn::{Config, DataPoint, Datastore, MetricQuery, SeriesCollector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Datastore::new(&Config::default(), Arc::new(MemoryStore::new()))?;
//!
//!     let mut tags = BTreeMap::new();
//!     tags.insert("host".to_string(), "a".to_string());
//!     let point = DataPoint::new(10_000, cairn::datapoint::DOUBLE_DATA_TYPE, vec![0, 1]);
//!     engine.put_data_point("cpu", &tags, &point, 0).await?;
//!
//!     let mut results = SeriesCollector::new();
//!     engine
//!         .query(&MetricQuery::new("cpu", 0, 20_000).tag("host", "a"), &mut results)
//!         .await?;
//!     println!("{} points", results.points().count());
//!
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod datapoint;
pub mod datastore;
pub mod error;
pub mod key;
pub mod query;
pub mod store;

// Re-export top-level types for convenience
pub use cache::{KnownKeyCache, RowKeyCache, StringKeyCache};
pub use config::{Config, ConsistencyConfig, WarmingUpConfig};
pub use datapoint::DataPoint;
pub use datastore::{CounterSample, Counters, Datastore, IndexTagPolicy};
pub use error::{Error, LimitKind, Result};
pub use key::RowKey;
pub use query::callback::{CollectedSeries, QueryCallback, SeriesCollector};
pub use query::memory::MemoryMonitor;
pub use query::{MetricQuery, Order, QueryClass, QueryMetadata, QueryPlugin, RowKeyProvider};
pub use store::{ConsistencyLevel, ConsistencyPolicy, CqlStore};

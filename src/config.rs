//! Engine configuration
//!
//! TOML-backed configuration with environment variable overrides
//! (`CAIRN_*`), plus the two list grammars that declare which tags are
//! split-indexed.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::store::{ConsistencyLevel, ConsistencyPolicy};

/// Main engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Default data TTL in seconds applied when a write carries none;
    /// 0 keeps data forever
    #[serde(default)]
    pub datapoint_ttl_seconds: u32,

    /// Bucket width used when enumerating read buckets; must be a
    /// multiple of the write width
    #[serde(default = "default_row_width_ms")]
    pub row_width_read_ms: i64,

    /// Bucket width every stored row time is floored to
    #[serde(default = "default_row_width_ms")]
    pub row_width_write_ms: i64,

    /// Comma-separated tag names split-indexed for every metric
    #[serde(default)]
    pub index_tag_list: String,

    /// Per-metric override: `metric=tag1,tag2;other_metric=tag3`.
    /// Malformed entries are dropped silently.
    #[serde(default)]
    pub metric_index_tag_list: String,

    /// Ceiling on index rows read per query, before tag filtering
    #[serde(default = "default_max_rows_for_keys_query")]
    pub max_rows_for_keys_query: usize,

    /// Ceiling on candidate row keys per query, after tag filtering
    #[serde(default = "default_max_row_keys_for_query")]
    pub max_row_keys_for_query: usize,

    #[serde(default)]
    pub consistency: ConsistencyConfig,

    #[serde(default)]
    pub warming_up: WarmingUpConfig,

    /// Probability (0-100) that a non-critical query is tagged for
    /// sampling metadata
    #[serde(default)]
    pub query_sampling_percentage: u32,

    /// Label applied to emitted self-metrics
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Byte ceiling a single query may materialize; 0 disables the check
    #[serde(default)]
    pub max_query_memory_bytes: usize,

    /// The memory ceiling is compared every this many observations
    #[serde(default = "default_memory_check_rate")]
    pub memory_check_rate: u32,

    #[serde(default = "default_row_key_cache_size")]
    pub row_key_cache_size: usize,

    #[serde(default = "default_string_cache_size")]
    pub string_cache_size: usize,
}

fn default_row_width_ms() -> i64 {
    // Three weeks, the classic row span for millisecond data.
    1_814_400_000
}

fn default_max_rows_for_keys_query() -> usize {
    10_000
}

fn default_max_row_keys_for_query() -> usize {
    10_000
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_memory_check_rate() -> u32 {
    20
}

fn default_row_key_cache_size() -> usize {
    1024 * 1024
}

fn default_string_cache_size() -> usize {
    16 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            datapoint_ttl_seconds: 0,
            row_width_read_ms: default_row_width_ms(),
            row_width_write_ms: default_row_width_ms(),
            index_tag_list: String::new(),
            metric_index_tag_list: String::new(),
            max_rows_for_keys_query: default_max_rows_for_keys_query(),
            max_row_keys_for_query: default_max_row_keys_for_query(),
            consistency: ConsistencyConfig::default(),
            warming_up: WarmingUpConfig::default(),
            query_sampling_percentage: 0,
            hostname: default_hostname(),
            max_query_memory_bytes: 0,
            memory_check_rate: default_memory_check_rate(),
            row_key_cache_size: default_row_key_cache_size(),
            string_cache_size: default_string_cache_size(),
        }
    }
}

/// Consistency level names per operation class
#[derive(Debug, Clone, Deserialize)]
pub struct ConsistencyConfig {
    #[serde(default = "default_read_level")]
    pub data_read_level: String,

    #[serde(default = "default_write_level")]
    pub data_write_level_datapoint: String,

    #[serde(default = "default_meta_level")]
    pub data_write_level_meta: String,
}

fn default_read_level() -> String {
    "ONE".to_string()
}

fn default_write_level() -> String {
    "ONE".to_string()
}

fn default_meta_level() -> String {
    "QUORUM".to_string()
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            data_read_level: default_read_level(),
            data_write_level_datapoint: default_write_level(),
            data_write_level_meta: default_meta_level(),
        }
    }
}

impl ConsistencyConfig {
    /// Parse the configured names into a policy
    pub fn policy(&self) -> Result<ConsistencyPolicy> {
        Ok(ConsistencyPolicy {
            read: self.data_read_level.parse::<ConsistencyLevel>()?,
            write_datapoint: self.data_write_level_datapoint.parse::<ConsistencyLevel>()?,
            write_meta: self.data_write_level_meta.parse::<ConsistencyLevel>()?,
        })
    }
}

/// Next-bucket warm-up configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WarmingUpConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Window before a bucket boundary during which warm-up may run
    #[serde(default = "default_heating_interval_minutes")]
    pub heating_interval_minutes: u32,

    /// Step at which keys become eligible within the window
    #[serde(default = "default_row_interval_minutes")]
    pub row_interval_minutes: u32,
}

fn default_heating_interval_minutes() -> u32 {
    10
}

fn default_row_interval_minutes() -> u32 {
    5
}

impl Default for WarmingUpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            heating_interval_minutes: default_heating_interval_minutes(),
            row_interval_minutes: default_row_interval_minutes(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {path:?}: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file with environment overrides applied
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `CAIRN_*` environment overrides to this configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(hostname) = std::env::var("CAIRN_HOSTNAME") {
            self.hostname = hostname;
        }
        if let Ok(ttl) = std::env::var("CAIRN_DATAPOINT_TTL_SECONDS") {
            if let Ok(ttl) = ttl.parse() {
                self.datapoint_ttl_seconds = ttl;
            }
        }
        if let Ok(tags) = std::env::var("CAIRN_INDEX_TAG_LIST") {
            self.index_tag_list = tags;
        }
        if let Ok(tags) = std::env::var("CAIRN_METRIC_INDEX_TAG_LIST") {
            self.metric_index_tag_list = tags;
        }
        if let Ok(pct) = std::env::var("CAIRN_QUERY_SAMPLING_PERCENTAGE") {
            if let Ok(pct) = pct.parse() {
                self.query_sampling_percentage = pct;
            }
        }
    }

    /// Check invariants between options
    pub fn validate(&self) -> Result<()> {
        if self.row_width_write_ms <= 0 {
            return Err(Error::Config(
                "row_width_write_ms must be positive".to_string(),
            ));
        }
        if self.row_width_read_ms < self.row_width_write_ms {
            return Err(Error::Config(
                "row_width_read_ms must be at least row_width_write_ms".to_string(),
            ));
        }
        if self.row_width_read_ms % self.row_width_write_ms != 0 {
            return Err(Error::Config(
                "row_width_read_ms must be a multiple of row_width_write_ms".to_string(),
            ));
        }
        if self.query_sampling_percentage > 100 {
            return Err(Error::Config(
                "query_sampling_percentage must be between 0 and 100".to_string(),
            ));
        }
        self.consistency.policy()?;
        Ok(())
    }

    /// Globally split-indexed tag names
    pub fn index_tag_list(&self) -> Vec<String> {
        parse_index_tag_list(&self.index_tag_list)
    }

    /// Per-metric split-index overrides
    pub fn metric_index_tag_map(&self) -> HashMap<String, Vec<String>> {
        parse_metric_index_tag_map(&self.metric_index_tag_list)
    }
}

fn parse_index_tag_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_metric_index_tag_map(raw: &str) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for entry in raw.split(';') {
        let Some((metric, tags)) = entry.trim().split_once('=') else {
            continue;
        };
        // A second `=` makes the entry malformed, not a value.
        if metric.is_empty() || tags.is_empty() || tags.contains('=') {
            continue;
        }
        let values: Vec<String> = tags
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if values.is_empty() {
            continue;
        }
        map.entry(metric.trim().to_string())
            .or_default()
            .extend(values);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_tag_list_parsing() {
        assert_eq!(parse_index_tag_list(""), Vec::<String>::new());
        assert_eq!(parse_index_tag_list("host"), vec!["host"]);
        assert_eq!(
            parse_index_tag_list(" host , dc ,,env"),
            vec!["host", "dc", "env"]
        );
    }

    #[test]
    fn test_metric_index_tag_map_parsing() {
        let map = parse_metric_index_tag_map("cpu=host,dc; mem=host ;broken;also=;=bad;x=a=b");
        assert_eq!(map.len(), 2);
        assert_eq!(map["cpu"], vec!["host", "dc"]);
        assert_eq!(map["mem"], vec!["host"]);
    }

    #[test]
    fn test_metric_index_tag_map_accumulates_repeats() {
        let map = parse_metric_index_tag_map("cpu=host;cpu=dc");
        assert_eq!(map["cpu"], vec!["host", "dc"]);
    }

    #[test]
    fn test_validate_row_widths() {
        let mut config = Config::default();
        config.row_width_write_ms = 3_600_000;
        config.row_width_read_ms = 1_800_000;
        assert!(config.validate().is_err());

        config.row_width_read_ms = 5_400_000;
        assert!(config.validate().is_err());

        config.row_width_read_ms = 7_200_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_consistency_names() {
        let mut config = Config::default();
        config.consistency.data_read_level = "SOMETIMES".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config: Config = toml::from_str(
            r#"
            datapoint_ttl_seconds = 86400
            row_width_read_ms = 7200000
            row_width_write_ms = 3600000
            index_tag_list = "host,dc"
            query_sampling_percentage = 5

            [consistency]
            data_read_level = "LOCAL_ONE"

            [warming_up]
            enabled = true
            heating_interval_minutes = 60
            row_interval_minutes = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.datapoint_ttl_seconds, 86_400);
        assert_eq!(config.index_tag_list(), vec!["host", "dc"]);
        assert!(config.warming_up.enabled);
        assert_eq!(
            config.consistency.policy().unwrap().read,
            ConsistencyLevel::LocalOne
        );
        assert!(config.validate().is_ok());
    }
}

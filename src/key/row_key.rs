//! Row-key codec
//!
//! A row key is the partition key of every table: metric name, row time,
//! data type and the full tag set, serialized into one canonical byte
//! string.
//!
//! Layout: metric bytes, 0x00, row time as big-endian i64, data type
//! bytes, 0x00, then `key=value:` for each tag in ascending key order.
//! The codec rejects fields containing a separator or terminator byte,
//! so the serialization is injective and round-trips.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

const TERMINATOR: u8 = 0x00;
const TAG_KEY_SEPARATOR: u8 = b'=';
const TAG_VALUE_SEPARATOR: u8 = b':';

/// Partition key of the data table; also the clustering value of both
/// reverse indexes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    metric: String,
    row_time: i64,
    data_type: String,
    tags: BTreeMap<String, String>,
}

impl RowKey {
    pub fn new(
        metric: impl Into<String>,
        row_time: i64,
        data_type: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            metric: metric.into(),
            row_time,
            data_type: data_type.into(),
            tags,
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// The row's temporal anchor: its timestamp floored to the write width
    pub fn row_time(&self) -> i64 {
        self.row_time
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// Tags in ascending key order
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Serialize to the canonical byte form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let tag_len: usize = self.tags.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
        let mut buf =
            Vec::with_capacity(self.metric.len() + self.data_type.len() + 10 + tag_len);

        check_free_of(&self.metric, "metric name", &[TERMINATOR])?;
        buf.extend_from_slice(self.metric.as_bytes());
        buf.push(TERMINATOR);

        buf.extend_from_slice(&self.row_time.to_be_bytes());

        check_free_of(&self.data_type, "data type", &[TERMINATOR])?;
        buf.extend_from_slice(self.data_type.as_bytes());
        buf.push(TERMINATOR);

        const TAG_SEPARATORS: [u8; 3] = [TERMINATOR, TAG_KEY_SEPARATOR, TAG_VALUE_SEPARATOR];
        for (key, value) in &self.tags {
            check_free_of(key, "tag name", &TAG_SEPARATORS)?;
            check_free_of(value, "tag value", &TAG_SEPARATORS)?;
            buf.extend_from_slice(key.as_bytes());
            buf.push(TAG_KEY_SEPARATOR);
            buf.extend_from_slice(value.as_bytes());
            buf.push(TAG_VALUE_SEPARATOR);
        }

        Ok(buf)
    }

    /// Deserialize from the canonical byte form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;

        let metric = take_until(&mut cursor, TERMINATOR, "metric name")?;

        if cursor.len() < 8 {
            return Err(Error::MalformedKey("truncated row time".to_string()));
        }
        let mut row_time_bytes = [0u8; 8];
        row_time_bytes.copy_from_slice(&cursor[..8]);
        let row_time = i64::from_be_bytes(row_time_bytes);
        cursor = &cursor[8..];

        let data_type = take_until(&mut cursor, TERMINATOR, "data type")?;

        let mut tags = BTreeMap::new();
        while !cursor.is_empty() {
            let key = take_until(&mut cursor, TAG_KEY_SEPARATOR, "tag name")?;
            let value = take_until(&mut cursor, TAG_VALUE_SEPARATOR, "tag value")?;
            tags.insert(key, value);
        }

        Ok(Self {
            metric,
            row_time,
            data_type,
            tags,
        })
    }
}

// Batches in the query runner group neighbours sharing (row time, data
// type), so the ordering leads with those fields.
impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row_time
            .cmp(&other.row_time)
            .then_with(|| self.data_type.cmp(&other.data_type))
            .then_with(|| self.metric.cmp(&other.metric))
            .then_with(|| self.tags.cmp(&other.tags))
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn check_free_of(field: &str, what: &str, banned: &[u8]) -> Result<()> {
    if field.bytes().any(|b| banned.contains(&b)) {
        return Err(Error::MalformedKey(format!(
            "{what} {field:?} contains a separator byte"
        )));
    }
    Ok(())
}

fn take_until(cursor: &mut &[u8], separator: u8, what: &str) -> Result<String> {
    let position = cursor
        .iter()
        .position(|&b| b == separator)
        .ok_or_else(|| Error::MalformedKey(format!("unterminated {what}")))?;
    let (field, rest) = cursor.split_at(position);
    *cursor = &rest[1..];
    String::from_utf8(field.to_vec())
        .map_err(|e| Error::MalformedKey(format!("{what} is not valid UTF-8: {e}")))
}

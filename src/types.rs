//! Core types for minitsdb
//!
//! Defines datapoints, tag sets, and the composite key encodings shared by
//! the datapoints and index tables.
//!
//! ## Key layout
//!
//! The backend addresses rows by composite string keys:
//!
//! - datapoints table: hash `domain|metric|tbase|tags`, range `toffset` (ms
//!   into the block, numeric)
//! - index table: hash `domain|metric`, range `tbase|tags`
//!
//! `tbase` is rendered as a zero-padded 13-digit decimal so that the
//! lexicographic `BETWEEN` the index queries use agrees with numeric order
//! over block start times. Tags are canonicalized as sorted `k=v` pairs
//! joined by commas, so the same tag set always produces the same key.
//! `|`, `,` and `=` are reserved and rejected at ingest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TsdbError};

/// Milliseconds since the epoch
pub type Timestamp = u64;

/// A tag set. BTreeMap keeps iteration sorted by key, which makes the
/// canonical encoding stable.
pub type Tags = BTreeMap<String, String>;

/// Separator between key segments
pub const KEY_SEPARATOR: char = '|';
/// Separator between tag pairs inside a key segment
pub const TAG_SEPARATOR: char = ',';

/// Width of the zero-padded block start time inside keys. Thirteen decimal
/// digits cover epoch milliseconds until the year 2286.
const TBASE_WIDTH: usize = 13;

/// A single measured value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: Timestamp,
    pub value: f64,
}

/// Render a block start time for use inside a composite key
pub fn format_tbase(tbase: Timestamp) -> String {
    format!("{:0width$}", tbase, width = TBASE_WIDTH)
}

/// Canonical encoding of a tag set: sorted `k=v` pairs joined by commas
pub fn canonical_tags(tags: &Tags) -> String {
    let pairs: Vec<String> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    pairs.join(&TAG_SEPARATOR.to_string())
}

/// Reject names containing the characters reserved by the key encoding
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TsdbError::request(format!("{} must not be empty", kind)));
    }
    if name.contains(KEY_SEPARATOR) || name.contains(TAG_SEPARATOR) || name.contains('=') {
        return Err(TsdbError::request(format!(
            "{} '{}' contains a reserved character ('|', ',' or '=')",
            kind, name
        )));
    }
    Ok(())
}

/// Hash key of the datapoints table for a point written at a time whose
/// block starts at `tbase`
pub fn data_points_key(domain: &str, metric: &str, tbase: Timestamp, tags: &Tags) -> String {
    format!(
        "{}{sep}{}{sep}{}{sep}{}",
        domain,
        metric,
        format_tbase(tbase),
        canonical_tags(tags),
        sep = KEY_SEPARATOR
    )
}

/// Hash key of the index table
pub fn index_hash_key(domain: &str, metric: &str) -> String {
    format!("{}{}{}", domain, KEY_SEPARATOR, metric)
}

/// Range key of the index table
pub fn index_range_key(tbase: Timestamp, tags: &Tags) -> String {
    format!("{}{}{}", format_tbase(tbase), KEY_SEPARATOR, canonical_tags(tags))
}

/// A decoded index row: everything needed to address one datapoints
/// hash key inside one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub domain: String,
    pub metric: String,
    pub tbase: Timestamp,
    pub tags: Tags,
}

impl IndexKey {
    /// Decode an index row from its hash and range key strings
    pub fn from_row(hash_key: &str, range_key: &str) -> Result<IndexKey> {
        let (domain, metric) = hash_key
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| TsdbError::Item(format!("malformed index hash key '{}'", hash_key)))?;
        let (tbase_str, tags_str) = range_key
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| TsdbError::Item(format!("malformed index range key '{}'", range_key)))?;
        let tbase: Timestamp = tbase_str
            .parse()
            .map_err(|_| TsdbError::Item(format!("malformed tbase '{}'", tbase_str)))?;
        Ok(IndexKey {
            domain: domain.to_string(),
            metric: metric.to_string(),
            tbase,
            tags: parse_tags(tags_str)?,
        })
    }

    /// Reproduce the datapoints hash key this index row points at
    pub fn data_points_key(&self) -> String {
        data_points_key(&self.domain, &self.metric, self.tbase, &self.tags)
    }
}

/// Decode a canonical tag string back into a tag set
pub fn parse_tags(encoded: &str) -> Result<Tags> {
    let mut tags = Tags::new();
    if encoded.is_empty() {
        return Ok(tags);
    }
    for pair in encoded.split(TAG_SEPARATOR) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| TsdbError::Item(format!("malformed tag pair '{}'", pair)))?;
        tags.insert(k.to_string(), v.to_string());
    }
    Ok(tags)
}

//! Datastore facade
//!
//! Sits between the HTTP layer and the block storage engine: parses the
//! JSON wire bodies, fans datapoint writes into the schema, assembles
//! query results, and maintains the flat name catalogs behind
//! write-through dedup caches.
//!
//! No aggregation happens here; queries return the raw values grouped by
//! tag set, newest first.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::backend::{
    AttrValue, Database, DatabaseRef, Item, KeyDef, KeyType, QueryOptions, TableSchema, Throughput,
};
use crate::error::{Result, TsdbError};
use crate::store::schema::{wait_for_table, MASTER_TABLE};
use crate::store::{Clock, KeyCache, Schema, StoreConfig};
use crate::types::{canonical_tags, validate_name, DataPoint, IndexKey, Tags, Timestamp, KEY_SEPARATOR};

const METRIC_NAMES_TABLE: &str = "amdw_metric_names";
const TAG_NAMES_TABLE: &str = "amdw_tag_names";
const TAG_VALUES_TABLE: &str = "amdw_tag_values";

const ATTR_CATALOG_HASH: &str = "domain";
const ATTR_CATALOG_RANGE: &str = "name";

/// One metric's worth of incoming datapoints
#[derive(Debug, Clone, PartialEq)]
pub struct DataPointSet {
    pub name: String,
    pub tags: Tags,
    pub points: Vec<DataPoint>,
}

#[derive(Deserialize)]
struct RawDataPointSet {
    name: String,
    #[serde(default)]
    tags: Tags,
    #[serde(default)]
    datapoints: Vec<(Timestamp, f64)>,
    #[serde(default)]
    timestamp: Option<Timestamp>,
    #[serde(default)]
    value: Option<f64>,
}

impl DataPointSet {
    /// Parse a request body: a single set or a list of sets. Points come
    /// either as a `datapoints` array of `[timestamp, value]` pairs or as a
    /// single `timestamp`/`value` attribute pair.
    pub fn from_json_object(body: &JsonValue) -> Result<Vec<DataPointSet>> {
        let raw_sets: Vec<RawDataPointSet> = match body {
            JsonValue::Array(entries) => entries
                .iter()
                .map(|v| serde_json::from_value(v.clone()))
                .collect::<std::result::Result<_, _>>()?,
            _ => vec![serde_json::from_value(body.clone())?],
        };
        Ok(raw_sets
            .into_iter()
            .map(|raw| {
                let mut points: Vec<DataPoint> = raw
                    .datapoints
                    .into_iter()
                    .map(|(timestamp, value)| DataPoint { timestamp, value })
                    .collect();
                if let (Some(timestamp), Some(value)) = (raw.timestamp, raw.value) {
                    points.push(DataPoint { timestamp, value });
                }
                DataPointSet {
                    name: raw.name,
                    tags: raw.tags,
                    points,
                }
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct RelativeTime {
    value: u64,
    unit: String,
}

impl RelativeTime {
    fn millis(&self) -> Result<u64> {
        let unit_ms: u64 = match self.unit.as_str() {
            "milliseconds" => 1,
            "seconds" => 1_000,
            "minutes" => 60_000,
            "hours" => 3_600_000,
            "days" => 86_400_000,
            "weeks" => 7 * 86_400_000,
            other => {
                return Err(TsdbError::request(format!("unknown time unit '{}'", other)));
            }
        };
        Ok(self.value * unit_ms)
    }
}

#[derive(Deserialize)]
struct RawQueryBody {
    #[serde(default)]
    start_absolute: Option<Timestamp>,
    #[serde(default)]
    start_relative: Option<RelativeTime>,
    #[serde(default)]
    end_absolute: Option<Timestamp>,
    #[serde(default)]
    end_relative: Option<RelativeTime>,
    metrics: Vec<RawQueryMetric>,
}

#[derive(Deserialize)]
struct RawQueryMetric {
    name: String,
    #[serde(default)]
    tags: HashMap<String, Vec<String>>,
}

/// One metric query with its resolved time window
#[derive(Debug, Clone)]
pub struct QueryMetric {
    pub name: String,
    /// tag key -> acceptable values; an empty list accepts any value
    pub tags: HashMap<String, Vec<String>>,
    pub start: Timestamp,
    pub end: Timestamp,
}

impl QueryMetric {
    /// Parse a query body, resolving relative times against `now`
    pub fn from_json_object(body: &JsonValue, now: Timestamp) -> Result<Vec<QueryMetric>> {
        let raw: RawQueryBody = serde_json::from_value(body.clone())?;
        let start = match (&raw.start_absolute, &raw.start_relative) {
            (Some(abs), _) => *abs,
            (None, Some(rel)) => now.saturating_sub(rel.millis()?),
            (None, None) => {
                return Err(TsdbError::request(
                    "query requires start_absolute or start_relative",
                ));
            }
        };
        let end = match (&raw.end_absolute, &raw.end_relative) {
            (Some(abs), _) => *abs,
            (None, Some(rel)) => now.saturating_sub(rel.millis()?),
            (None, None) => now,
        };
        if start > end {
            return Err(TsdbError::request("query start is after its end"));
        }
        Ok(raw
            .metrics
            .into_iter()
            .map(|metric| QueryMetric {
                name: metric.name,
                tags: metric.tags,
                start,
                end,
            })
            .collect())
    }

    fn matches(&self, key: &IndexKey) -> bool {
        self.tags.iter().all(|(tag, allowed)| {
            allowed.is_empty()
                || key
                    .tags
                    .get(tag)
                    .map_or(false, |value| allowed.contains(value))
        })
    }
}

/// Values for one tag set, newest first
#[derive(Debug, Clone, Serialize)]
pub struct MetricResult {
    pub name: String,
    pub tags: BTreeMap<String, Vec<String>>,
    pub values: Vec<(Timestamp, f64)>,
}

/// The answer to one `QueryMetric`
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub sample_size: usize,
    pub results: Vec<MetricResult>,
}

/// The front door of the store
pub struct Datastore {
    db: DatabaseRef,
    schema: Arc<Schema>,
    metric_names: KeyCache,
    tag_names: KeyCache,
    tag_values: KeyCache,
}

impl Datastore {
    /// Bind to the backend, bootstrapping the master table and the name
    /// catalogs when they do not exist yet
    pub fn open(db: DatabaseRef, config: Arc<StoreConfig>, clock: Arc<dyn Clock>) -> Result<Datastore> {
        if matches!(db.describe_table(MASTER_TABLE), Err(TsdbError::TableNotFound(_))) {
            Schema::create(&db, &config, &clock, Duration::from_secs(120))?;
        }
        for table in [METRIC_NAMES_TABLE, TAG_NAMES_TABLE, TAG_VALUES_TABLE] {
            if matches!(db.describe_table(table), Err(TsdbError::TableNotFound(_))) {
                db.create_table(
                    table,
                    TableSchema::new(
                        KeyDef::new(ATTR_CATALOG_HASH, KeyType::String),
                        KeyDef::new(ATTR_CATALOG_RANGE, KeyType::String),
                    ),
                    Throughput::new(5, 5),
                )?;
                wait_for_table(&db, table, Duration::from_secs(120), Duration::from_millis(100))?;
            }
        }
        let schema = Arc::new(Schema::open(Arc::clone(&db), Arc::clone(&config), clock)?);
        Ok(Datastore {
            db,
            metric_names: KeyCache::new(config.cache_metric_name),
            tag_names: KeyCache::new(config.cache_tag_name),
            tag_values: KeyCache::new(config.cache_tag_value),
            schema,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Store every point of a set, then record its names in the catalogs
    pub fn put_data_points(&self, domain: &str, set: &DataPointSet) -> Result<()> {
        validate_name("metric name", &set.name)?;
        for (tag, value) in &set.tags {
            validate_name("tag name", tag)?;
            validate_name("tag value", value)?;
        }
        for point in &set.points {
            self.schema
                .store_datapoint(point.timestamp, &set.name, &set.tags, point.value, domain)?;
        }
        self.record_catalog(&self.metric_names, METRIC_NAMES_TABLE, domain, &set.name)?;
        for (tag, value) in &set.tags {
            self.record_catalog(&self.tag_names, TAG_NAMES_TABLE, domain, tag)?;
            self.record_catalog(&self.tag_values, TAG_VALUES_TABLE, domain, value)?;
        }
        Ok(())
    }

    fn record_catalog(&self, cache: &KeyCache, table: &str, domain: &str, name: &str) -> Result<()> {
        let key = format!("{}{}{}", domain, KEY_SEPARATOR, name);
        if cache.contains(&key) {
            return Ok(());
        }
        let mut item = Item::new();
        item.insert(ATTR_CATALOG_HASH.into(), AttrValue::text(domain));
        item.insert(ATTR_CATALOG_RANGE.into(), AttrValue::text(name));
        self.db.put_item(table, item)?;
        cache.insert(&key);
        Ok(())
    }

    /// Run one metric query: resolve index keys, fetch each key's values,
    /// group by tag set, newest first
    pub fn query_database(&self, domain: &str, query: &QueryMetric) -> Result<QueryResult> {
        let keys = self.matching_keys(domain, query)?;
        let mut grouped: BTreeMap<String, (Tags, Vec<(Timestamp, f64)>)> = BTreeMap::new();
        for key in &keys {
            let rows =
                self.schema
                    .query_datapoints(key, query.start, query.end, &["value"])?;
            let entry = grouped
                .entry(canonical_tags(&key.tags))
                .or_insert_with(|| (key.tags.clone(), Vec::new()));
            for row in rows {
                entry.1.push(decode_value_row(&row, key.tbase)?);
            }
        }

        let mut sample_size = 0;
        let mut results = Vec::with_capacity(grouped.len());
        for (_, (tags, mut values)) in grouped {
            values.sort_by(|a, b| b.0.cmp(&a.0));
            sample_size += values.len();
            results.push(MetricResult {
                name: query.name.clone(),
                tags: tags
                    .into_iter()
                    .map(|(tag, value)| (tag, vec![value]))
                    .collect(),
                values,
            });
        }
        Ok(QueryResult {
            sample_size,
            results,
        })
    }

    /// The tag names and values a query would touch, without the data
    pub fn query_metric_tags(
        &self,
        domain: &str,
        query: &QueryMetric,
    ) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut tags: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for key in self.matching_keys(domain, query)? {
            for (tag, value) in key.tags {
                tags.entry(tag).or_default().insert(value);
            }
        }
        Ok(tags)
    }

    fn matching_keys(&self, domain: &str, query: &QueryMetric) -> Result<Vec<IndexKey>> {
        let keys = self
            .schema
            .query_index(domain, &query.name, query.start, query.end)?;
        Ok(keys.into_iter().filter(|key| query.matches(key)).collect())
    }

    pub fn get_metric_names(&self, domain: &str) -> Result<Vec<String>> {
        self.catalog_names(METRIC_NAMES_TABLE, domain)
    }

    pub fn get_tag_names(&self, domain: &str) -> Result<Vec<String>> {
        self.catalog_names(TAG_NAMES_TABLE, domain)
    }

    pub fn get_tag_values(&self, domain: &str) -> Result<Vec<String>> {
        self.catalog_names(TAG_VALUES_TABLE, domain)
    }

    fn catalog_names(&self, table: &str, domain: &str) -> Result<Vec<String>> {
        let rows = self.db.query(
            table,
            &AttrValue::text(domain),
            None,
            &QueryOptions::default(),
        )?;
        rows.iter()
            .map(|row| {
                row.get(ATTR_CATALOG_RANGE)
                    .and_then(AttrValue::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| TsdbError::Item("catalog row missing 'name'".into()))
            })
            .collect()
    }
}

fn decode_value_row(row: &Item, tbase: Timestamp) -> Result<(Timestamp, f64)> {
    let toffset = row
        .get(crate::store::block::ATTR_DP_RANGE)
        .and_then(AttrValue::as_u64)
        .ok_or_else(|| TsdbError::Item("datapoint row missing 'toffset'".into()))?;
    let value = row
        .get(crate::store::block::ATTR_DP_VALUE)
        .and_then(AttrValue::as_f64)
        .ok_or_else(|| TsdbError::Item("datapoint row missing 'value'".into()))?;
    Ok((tbase + toffset, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_datapointset_from_list() {
        let body = json!([
            {"name": "cpu", "tags": {"host": "a"}, "datapoints": [[10050, 1.5], [10060, 2]]},
            {"name": "mem", "timestamp": 10070, "value": 3.5}
        ]);
        let sets = DataPointSet::from_json_object(&body).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].name, "cpu");
        assert_eq!(sets[0].tags["host"], "a");
        assert_eq!(
            sets[0].points,
            vec![
                DataPoint { timestamp: 10050, value: 1.5 },
                DataPoint { timestamp: 10060, value: 2.0 },
            ]
        );
        assert_eq!(sets[1].points, vec![DataPoint { timestamp: 10070, value: 3.5 }]);
    }

    #[test]
    fn test_datapointset_from_single_object() {
        let body = json!({"name": "cpu", "datapoints": [[1, 1.0]]});
        let sets = DataPointSet::from_json_object(&body).unwrap();
        assert_eq!(sets.len(), 1);
        assert!(sets[0].tags.is_empty());
    }

    #[test]
    fn test_datapointset_rejects_garbage() {
        assert!(DataPointSet::from_json_object(&json!({"datapoints": []})).is_err());
        assert!(DataPointSet::from_json_object(&json!({"name": "m", "datapoints": [["x", 1]]})).is_err());
    }

    #[test]
    fn test_query_metric_absolute_window() {
        let body = json!({
            "start_absolute": 8500,
            "end_absolute": 10500,
            "metrics": [{"name": "cpu", "tags": {"host": ["a", "b"]}}]
        });
        let queries = QueryMetric::from_json_object(&body, 10050).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].start, 8500);
        assert_eq!(queries[0].end, 10500);
        assert_eq!(queries[0].tags["host"], vec!["a", "b"]);
    }

    #[test]
    fn test_query_metric_relative_window() {
        let body = json!({
            "start_relative": {"value": 2, "unit": "seconds"},
            "metrics": [{"name": "cpu"}]
        });
        let queries = QueryMetric::from_json_object(&body, 10050).unwrap();
        assert_eq!(queries[0].start, 8050);
        assert_eq!(queries[0].end, 10050);
    }

    #[test]
    fn test_query_metric_requires_start() {
        let body = json!({"metrics": [{"name": "cpu"}]});
        assert!(QueryMetric::from_json_object(&body, 10050).is_err());
        let body = json!({
            "start_relative": {"value": 1, "unit": "fortnights"},
            "metrics": [{"name": "cpu"}]
        });
        assert!(QueryMetric::from_json_object(&body, 10050).is_err());
    }

    #[test]
    fn test_query_metric_rejects_inverted_window() {
        let body = json!({
            "start_absolute": 2000,
            "end_absolute": 1000,
            "metrics": [{"name": "cpu"}]
        });
        assert!(QueryMetric::from_json_object(&body, 10050).is_err());
    }

    #[test]
    fn test_tag_predicate_matching() {
        let query = QueryMetric {
            name: "cpu".into(),
            tags: HashMap::from([("host".to_string(), vec!["a".to_string()])]),
            start: 0,
            end: 100,
        };
        let mut key = IndexKey {
            domain: "d".into(),
            metric: "cpu".into(),
            tbase: 0,
            tags: Tags::from([("host".to_string(), "a".to_string())]),
        };
        assert!(query.matches(&key));
        key.tags.insert("host".into(), "b".into());
        assert!(!query.matches(&key));
        key.tags.remove("host");
        assert!(!query.matches(&key));
    }
}

//! In-memory reference backend
//!
//! `MemoryDatabase` implements the full [`Database`](super::Database)
//! contract against process memory: a `RwLock`-protected map of tables,
//! each holding rows in a `BTreeMap` ordered by (hash key, range key).
//!
//! Two knobs make the hosted-database lifecycle observable in tests:
//! - `with_activation_delay` keeps a freshly created table in CREATING for
//!   the given wall-clock interval before `describe_table` reports ACTIVE;
//! - `write_count` exposes how many item writes a table has absorbed, which
//!   lets tests verify that the index dedup cache suppresses rewrites.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::{Result, TsdbError};

use super::{
    AttrValue, Database, Item, QueryOptions, RangeCondition, TableDescription, TableSchema,
    TableStatus, Throughput, MAX_BATCH_ITEMS,
};

/// Range keys ordered the way the backend orders them: numbers numerically,
/// strings bytewise. Numeric range keys are non-negative integral
/// milliseconds throughout this system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    N(u64),
    S(String),
}

fn sort_key(value: &AttrValue) -> Result<SortKey> {
    match value {
        AttrValue::N(_) => value
            .as_u64()
            .map(SortKey::N)
            .ok_or_else(|| TsdbError::Item("numeric key must be a non-negative integer".into())),
        AttrValue::S(s) => Ok(SortKey::S(s.clone())),
    }
}

/// Hash keys are compared for equality only; encode to a plain string
fn hash_bucket(value: &AttrValue) -> String {
    match value {
        AttrValue::N(v) if v.fract() == 0.0 => format!("{}", *v as i64),
        AttrValue::N(v) => format!("{}", v),
        AttrValue::S(s) => s.clone(),
    }
}

struct TableEntry {
    schema: TableSchema,
    throughput: Throughput,
    created_at: Instant,
    /// hash bucket -> range key -> item
    rows: HashMap<String, BTreeMap<SortKey, Item>>,
    writes: usize,
}

/// In-memory implementation of the backend database contract
pub struct MemoryDatabase {
    tables: RwLock<HashMap<String, TableEntry>>,
    activation_delay: Duration,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_activation_delay(Duration::ZERO)
    }

    /// Keep new tables in CREATING for `delay` before they go ACTIVE
    pub fn with_activation_delay(delay: Duration) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            activation_delay: delay,
        }
    }

    /// Total item writes a table has absorbed (puts and batch writes)
    pub fn write_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(|t| t.writes)
            .unwrap_or(0)
    }

    /// Number of rows currently stored in a table
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(|t| t.rows.values().map(|b| b.len()).sum())
            .unwrap_or(0)
    }

    /// Names of all existing tables, sorted
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn key_pair(entry: &TableEntry, item: &Item) -> Result<(String, SortKey)> {
        let hash = item
            .get(&entry.schema.hash_key.name)
            .ok_or_else(|| TsdbError::Item(format!("item missing hash key '{}'", entry.schema.hash_key.name)))?;
        let range = item
            .get(&entry.schema.range_key.name)
            .ok_or_else(|| TsdbError::Item(format!("item missing range key '{}'", entry.schema.range_key.name)))?;
        Ok((hash_bucket(hash), sort_key(range)?))
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemoryDatabase {
    fn create_table(&self, name: &str, schema: TableSchema, throughput: Throughput) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(name) {
            return Err(TsdbError::table_exists(name));
        }
        tables.insert(
            name.to_string(),
            TableEntry {
                schema,
                throughput,
                created_at: Instant::now(),
                rows: HashMap::new(),
                writes: 0,
            },
        );
        Ok(())
    }

    fn delete_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TsdbError::table_not_found(name))
    }

    fn describe_table(&self, name: &str) -> Result<TableDescription> {
        let tables = self.tables.read().unwrap();
        let entry = tables
            .get(name)
            .ok_or_else(|| TsdbError::table_not_found(name))?;
        let status = if entry.created_at.elapsed() < self.activation_delay {
            TableStatus::Creating
        } else {
            TableStatus::Active
        };
        Ok(TableDescription {
            name: name.to_string(),
            status,
            throughput: entry.throughput,
        })
    }

    fn update_throughput(&self, name: &str, throughput: Throughput) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let entry = tables
            .get_mut(name)
            .ok_or_else(|| TsdbError::table_not_found(name))?;
        entry.throughput = throughput;
        Ok(())
    }

    fn put_item(&self, table: &str, item: Item) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| TsdbError::table_not_found(table))?;
        let (hash, range) = Self::key_pair(entry, &item)?;
        entry.rows.entry(hash).or_default().insert(range, item);
        entry.writes += 1;
        Ok(())
    }

    fn delete_item(&self, table: &str, hash_key: &AttrValue, range_key: &AttrValue) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| TsdbError::table_not_found(table))?;
        let bucket = hash_bucket(hash_key);
        if let Some(rows) = entry.rows.get_mut(&bucket) {
            rows.remove(&sort_key(range_key)?);
        }
        Ok(())
    }

    fn batch_write(&self, table: &str, items: Vec<Item>) -> Result<()> {
        if items.len() > MAX_BATCH_ITEMS {
            return Err(TsdbError::Backend(format!(
                "batch of {} exceeds the {}-item limit",
                items.len(),
                MAX_BATCH_ITEMS
            )));
        }
        let mut tables = self.tables.write().unwrap();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| TsdbError::table_not_found(table))?;
        for item in items {
            let (hash, range) = Self::key_pair(entry, &item)?;
            entry.rows.entry(hash).or_default().insert(range, item);
            entry.writes += 1;
        }
        Ok(())
    }

    fn query(
        &self,
        table: &str,
        hash_key: &AttrValue,
        range: Option<&RangeCondition>,
        options: &QueryOptions,
    ) -> Result<Vec<Item>> {
        // Consistency selection is a no-op in memory; reads always observe
        // the latest write.
        let tables = self.tables.read().unwrap();
        let entry = tables
            .get(table)
            .ok_or_else(|| TsdbError::table_not_found(table))?;
        let bucket = match entry.rows.get(&hash_bucket(hash_key)) {
            Some(bucket) => bucket,
            None => return Ok(Vec::new()),
        };

        let mut matches: Vec<Item> = match range {
            None => bucket.values().cloned().collect(),
            Some(RangeCondition::Equal(v)) => {
                bucket.get(&sort_key(v)?).cloned().into_iter().collect()
            }
            Some(RangeCondition::Between(lo, hi)) => {
                let lo = sort_key(lo)?;
                let hi = sort_key(hi)?;
                if lo > hi {
                    Vec::new()
                } else {
                    bucket.range(lo..=hi).map(|(_, item)| item.clone()).collect()
                }
            }
        };

        if !options.scan_forward {
            matches.reverse();
        }
        if let Some(attrs) = &options.attributes {
            for item in &mut matches {
                item.retain(|k, _| attrs.iter().any(|a| a == k));
            }
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KeyDef;
    use crate::backend::KeyType;

    fn schema() -> TableSchema {
        TableSchema::new(
            KeyDef::new("pk", KeyType::String),
            KeyDef::new("sk", KeyType::Number),
        )
    }

    fn item(pk: &str, sk: u64, value: f64) -> Item {
        let mut item = Item::new();
        item.insert("pk".into(), AttrValue::text(pk));
        item.insert("sk".into(), AttrValue::from(sk));
        item.insert("value".into(), AttrValue::N(value));
        item
    }

    #[test]
    fn test_create_describe_delete() {
        let db = MemoryDatabase::new();
        db.create_table("t", schema(), Throughput::new(5, 5)).unwrap();
        assert!(matches!(
            db.create_table("t", schema(), Throughput::new(5, 5)),
            Err(TsdbError::TableExists(_))
        ));
        let desc = db.describe_table("t").unwrap();
        assert_eq!(desc.status, TableStatus::Active);
        assert_eq!(desc.throughput, Throughput::new(5, 5));
        db.delete_table("t").unwrap();
        assert!(matches!(db.describe_table("t"), Err(TsdbError::TableNotFound(_))));
    }

    #[test]
    fn test_activation_delay_reports_creating() {
        let db = MemoryDatabase::with_activation_delay(Duration::from_millis(40));
        db.create_table("t", schema(), Throughput::new(5, 5)).unwrap();
        assert_eq!(db.describe_table("t").unwrap().status, TableStatus::Creating);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(db.describe_table("t").unwrap().status, TableStatus::Active);
    }

    #[test]
    fn test_put_overwrites_same_key() {
        let db = MemoryDatabase::new();
        db.create_table("t", schema(), Throughput::new(5, 5)).unwrap();
        db.put_item("t", item("a", 1, 1.0)).unwrap();
        db.put_item("t", item("a", 1, 2.0)).unwrap();
        assert_eq!(db.row_count("t"), 1);
        assert_eq!(db.write_count("t"), 2);
        let rows = db
            .query("t", &AttrValue::text("a"), None, &QueryOptions::default())
            .unwrap();
        assert_eq!(rows[0].get("value").unwrap().as_f64(), Some(2.0));
    }

    #[test]
    fn test_query_between_and_order() {
        let db = MemoryDatabase::new();
        db.create_table("t", schema(), Throughput::new(5, 5)).unwrap();
        for sk in [5u64, 1, 3, 9, 7] {
            db.put_item("t", item("a", sk, sk as f64)).unwrap();
        }
        let between = RangeCondition::Between(AttrValue::from(3u64), AttrValue::from(7u64));
        let rows = db
            .query("t", &AttrValue::text("a"), Some(&between), &QueryOptions::default())
            .unwrap();
        let keys: Vec<u64> = rows.iter().map(|r| r["sk"].as_u64().unwrap()).collect();
        assert_eq!(keys, vec![3, 5, 7]);

        let opts = QueryOptions {
            scan_forward: false,
            ..Default::default()
        };
        let rows = db
            .query("t", &AttrValue::text("a"), Some(&between), &opts)
            .unwrap();
        let keys: Vec<u64> = rows.iter().map(|r| r["sk"].as_u64().unwrap()).collect();
        assert_eq!(keys, vec![7, 5, 3]);
    }

    #[test]
    fn test_query_projection() {
        let db = MemoryDatabase::new();
        db.create_table("t", schema(), Throughput::new(5, 5)).unwrap();
        db.put_item("t", item("a", 1, 1.5)).unwrap();
        let opts = QueryOptions {
            attributes: Some(vec!["sk".into()]),
            ..Default::default()
        };
        let rows = db
            .query("t", &AttrValue::text("a"), None, &opts)
            .unwrap();
        assert!(rows[0].contains_key("sk"));
        assert!(!rows[0].contains_key("value"));
        assert!(!rows[0].contains_key("pk"));
    }

    #[test]
    fn test_batch_write_limit_enforced() {
        let db = MemoryDatabase::new();
        db.create_table("t", schema(), Throughput::new(5, 5)).unwrap();
        let items: Vec<Item> = (0..MAX_BATCH_ITEMS as u64 + 1).map(|i| item("a", i, 0.0)).collect();
        assert!(db.batch_write("t", items).is_err());
        let items: Vec<Item> = (0..MAX_BATCH_ITEMS as u64).map(|i| item("a", i, 0.0)).collect();
        db.batch_write("t", items).unwrap();
        assert_eq!(db.row_count("t"), MAX_BATCH_ITEMS);
    }

    #[test]
    fn test_string_range_keys_order_bytewise() {
        let db = MemoryDatabase::new();
        let schema = TableSchema::new(
            KeyDef::new("pk", KeyType::String),
            KeyDef::new("sk", KeyType::String),
        );
        db.create_table("t", schema, Throughput::new(5, 5)).unwrap();
        for sk in ["0000000010000|h=a", "0000000009000|h=a", "0000000011000|h=a"] {
            let mut item = Item::new();
            item.insert("pk".into(), AttrValue::text("a"));
            item.insert("sk".into(), AttrValue::text(sk));
            db.put_item("t", item).unwrap();
        }
        let between = RangeCondition::Between(
            AttrValue::text("0000000009000"),
            AttrValue::text("0000000010001"),
        );
        let rows = db
            .query("t", &AttrValue::text("a"), Some(&between), &QueryOptions::default())
            .unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r["sk"].as_str().unwrap()).collect();
        assert_eq!(keys, vec!["0000000009000|h=a", "0000000010000|h=a"]);
    }
}

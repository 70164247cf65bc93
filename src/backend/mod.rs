//! Backend key-value database seam
//!
//! The storage engine consumes a hosted key-value database through the
//! [`Database`] trait. The trait captures exactly the capabilities the
//! engine relies on: create/delete table with a typed hash+range schema,
//! describe table (status and provisioned throughput), update throughput,
//! put item with overwrite, batch write, and query by hash equality plus an
//! optional range predicate with consistent/eventually-consistent selection.
//!
//! A production client for a real hosted database is an integration point;
//! this crate ships [`memory::MemoryDatabase`] as the reference
//! implementation, which also backs every test.

pub mod memory;

pub use memory::MemoryDatabase;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// An attribute value: the backend stores numbers and strings
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    N(f64),
    S(String),
}

impl AttrValue {
    /// Build a string attribute
    pub fn text(v: impl Into<String>) -> Self {
        AttrValue::S(v.into())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::N(v) => Some(*v),
            AttrValue::S(_) => None,
        }
    }

    /// Numeric attribute as an integer; fractional values are refused
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::N(v) if v.fract() == 0.0 && *v >= 0.0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s.as_str()),
            AttrValue::N(_) => None,
        }
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::N(v as f64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::N(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::S(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::S(v)
    }
}

/// An item is a flat bag of named attributes
pub type Item = HashMap<String, AttrValue>;

/// Key attribute type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Number,
    String,
}

/// One key attribute of a table schema
#[derive(Debug, Clone)]
pub struct KeyDef {
    pub name: String,
    pub key_type: KeyType,
}

impl KeyDef {
    pub fn new(name: &str, key_type: KeyType) -> Self {
        Self {
            name: name.to_string(),
            key_type,
        }
    }
}

/// Hash+range schema of a physical table
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub hash_key: KeyDef,
    pub range_key: KeyDef,
}

impl TableSchema {
    pub fn new(hash_key: KeyDef, range_key: KeyDef) -> Self {
        Self { hash_key, range_key }
    }
}

/// Provisioned read/write capacity of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub read: u64,
    pub write: u64,
}

impl Throughput {
    pub fn new(read: u64, write: u64) -> Self {
        Self { read, write }
    }
}

/// Lifecycle status reported by `describe_table`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Creating,
    Active,
    Updating,
    Deleting,
}

/// Live description of a physical table
#[derive(Debug, Clone)]
pub struct TableDescription {
    pub name: String,
    pub status: TableStatus,
    pub throughput: Throughput,
}

/// Range-key predicate for queries
#[derive(Debug, Clone)]
pub enum RangeCondition {
    Equal(AttrValue),
    /// Inclusive on both ends
    Between(AttrValue, AttrValue),
}

/// Per-query options
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Strongly consistent read when true, eventually consistent otherwise
    pub consistent: bool,
    /// Ascending range-key order when true, descending otherwise
    pub scan_forward: bool,
    /// Attribute projection; `None` returns whole items
    pub attributes: Option<Vec<String>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            consistent: false,
            scan_forward: true,
            attributes: None,
        }
    }
}

impl QueryOptions {
    /// Strongly consistent, full items, ascending
    pub fn consistent() -> Self {
        Self {
            consistent: true,
            ..Default::default()
        }
    }
}

/// The backend database capability set consumed by the storage engine.
///
/// Implementations must be safe for concurrent use; all methods may block on
/// network I/O. Table creation and deletion are asynchronous at the backend:
/// `create_table` returns once the table enters CREATING, and callers poll
/// `describe_table` until it reports ACTIVE.
pub trait Database: Send + Sync {
    fn create_table(&self, name: &str, schema: TableSchema, throughput: Throughput) -> Result<()>;

    fn delete_table(&self, name: &str) -> Result<()>;

    fn describe_table(&self, name: &str) -> Result<TableDescription>;

    fn update_throughput(&self, name: &str, throughput: Throughput) -> Result<()>;

    /// Put a single item, overwriting any existing item with the same key
    fn put_item(&self, table: &str, item: Item) -> Result<()>;

    /// Delete a single item by its full primary key
    fn delete_item(&self, table: &str, hash_key: &AttrValue, range_key: &AttrValue) -> Result<()>;

    /// Write a batch of items. Implementations bound the batch size; callers
    /// chunk accordingly (see [`MAX_BATCH_ITEMS`]).
    fn batch_write(&self, table: &str, items: Vec<Item>) -> Result<()>;

    /// Query items by hash-key equality and an optional range predicate
    fn query(
        &self,
        table: &str,
        hash_key: &AttrValue,
        range: Option<&RangeCondition>,
        options: &QueryOptions,
    ) -> Result<Vec<Item>>;
}

/// Largest batch the backend accepts in one `batch_write`
pub const MAX_BATCH_ITEMS: usize = 25;

/// Shared handle to a backend database
pub type DatabaseRef = Arc<dyn Database>;

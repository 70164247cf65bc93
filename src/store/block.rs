//! One ring slot of the block rotation engine
//!
//! A `Block` pairs a persistent master record (slot number, block start,
//! lifecycle state, physical table names) with live handles to its two
//! physical tables: the datapoints table and the tag index table. All
//! lifecycle transitions and the write path run through here.
//!
//! Master-record mutation is serialized by a per-block mutex. The mutex is
//! never held across a batch-write flush; the write path snapshots what it
//! needs and releases the lock before touching the backend.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{
    AttrValue, Database, DatabaseRef, Item, KeyDef, KeyType, QueryOptions, RangeCondition,
    TableDescription, TableSchema, Throughput,
};
use crate::error::{Result, TsdbError};
use crate::types::{
    data_points_key, index_hash_key, index_range_key, format_tbase, IndexKey, Tags, Timestamp,
};

use super::cache::KeyCache;
use super::writer::TimedBatchWriter;
use super::StoreConfig;

/// Attribute names of the datapoints table
pub const ATTR_DP_HASH: &str = "domain_metric_tbase_tags";
pub const ATTR_DP_RANGE: &str = "toffset";
pub const ATTR_DP_VALUE: &str = "value";

/// Attribute names of the index table
pub const ATTR_INDEX_HASH: &str = "domain_metric";
pub const ATTR_INDEX_RANGE: &str = "tbase_tags";

/// Attribute names of the master record
const ATTR_N: &str = "n";
const ATTR_TBASE: &str = "tbase";
const ATTR_STATE: &str = "state";
const ATTR_DP_NAME: &str = "data_points_name";
const ATTR_INDEX_NAME: &str = "index_name";

pub fn data_points_table_name(tbase: Timestamp) -> String {
    format!("amdw_dp_{}", tbase)
}

pub fn index_table_name(tbase: Timestamp) -> String {
    format!("amdw_dp_index_{}", tbase)
}

/// Lifecycle state of a block, derived from the master record plus live
/// descriptions of the two physical tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Slot exists, no physical tables
    Initial,
    /// At least one physical table still transitioning
    Creating,
    /// Both tables active with full write capacity
    Active,
    /// Both tables active, write capacity reduced to the minimum
    TurnedDown,
    /// The two tables disagree
    Undefined,
}

impl BlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::Initial => "INITIAL",
            BlockState::Creating => "CREATING",
            BlockState::Active => "ACTIVE",
            BlockState::TurnedDown => "TURNED_DOWN",
            BlockState::Undefined => "UNDEFINED",
        }
    }

    pub fn from_str(s: &str) -> Result<BlockState> {
        match s {
            "INITIAL" => Ok(BlockState::Initial),
            "CREATING" => Ok(BlockState::Creating),
            "ACTIVE" => Ok(BlockState::Active),
            "TURNED_DOWN" => Ok(BlockState::TurnedDown),
            "UNDEFINED" => Ok(BlockState::Undefined),
            other => Err(TsdbError::Item(format!("unknown block state '{}'", other))),
        }
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The persistent per-slot record in the master table
#[derive(Debug, Clone)]
pub struct MasterRecord {
    pub n: usize,
    pub tbase: Timestamp,
    pub state: BlockState,
    pub data_points_name: Option<String>,
    pub index_name: Option<String>,
}

impl MasterRecord {
    fn initial(n: usize, tbase: Timestamp) -> Self {
        Self {
            n,
            tbase,
            state: BlockState::Initial,
            data_points_name: None,
            index_name: None,
        }
    }

    pub fn to_item(&self) -> Item {
        let mut item = Item::new();
        item.insert(ATTR_N.into(), AttrValue::from(self.n as u64));
        item.insert(ATTR_TBASE.into(), AttrValue::from(self.tbase));
        item.insert(ATTR_STATE.into(), AttrValue::text(self.state.as_str()));
        if let Some(name) = &self.data_points_name {
            item.insert(ATTR_DP_NAME.into(), AttrValue::text(name.clone()));
        }
        if let Some(name) = &self.index_name {
            item.insert(ATTR_INDEX_NAME.into(), AttrValue::text(name.clone()));
        }
        item
    }

    pub fn from_item(item: &Item) -> Result<Self> {
        let n = item
            .get(ATTR_N)
            .and_then(AttrValue::as_u64)
            .ok_or_else(|| TsdbError::Item("master record missing 'n'".into()))?;
        let tbase = item
            .get(ATTR_TBASE)
            .and_then(AttrValue::as_u64)
            .ok_or_else(|| TsdbError::Item("master record missing 'tbase'".into()))?;
        let state = item
            .get(ATTR_STATE)
            .and_then(AttrValue::as_str)
            .ok_or_else(|| TsdbError::Item("master record missing 'state'".into()))
            .and_then(BlockState::from_str)?;
        let name_of = |attr: &str| {
            item.get(attr)
                .and_then(AttrValue::as_str)
                .map(str::to_string)
        };
        Ok(Self {
            n: n as usize,
            tbase,
            state,
            data_points_name: name_of(ATTR_DP_NAME),
            index_name: name_of(ATTR_INDEX_NAME),
        })
    }
}

struct Inner {
    record: MasterRecord,
    writer: Option<Arc<TimedBatchWriter>>,
}

/// One logical time slice of the retention window
pub struct Block {
    n: usize,
    config: Arc<StoreConfig>,
    db: DatabaseRef,
    master_table: String,
    cache: Arc<KeyCache>,
    inner: Mutex<Inner>,
}

impl Block {
    /// Bind to slot `n`, loading its master record. A slot with no record
    /// yet is initialized to INITIAL at `default_tbase`.
    pub fn open(
        config: Arc<StoreConfig>,
        db: DatabaseRef,
        cache: Arc<KeyCache>,
        master_table: &str,
        n: usize,
        default_tbase: Timestamp,
    ) -> Result<Block> {
        let rows = db.query(
            master_table,
            &AttrValue::from(n as u64),
            None,
            &QueryOptions::consistent(),
        )?;
        let record = match rows.first() {
            Some(item) => MasterRecord::from_item(item)?,
            None => {
                let record = MasterRecord::initial(n, config.base_time(default_tbase));
                db.put_item(master_table, record.to_item())?;
                record
            }
        };
        let block = Block {
            n,
            config,
            db,
            master_table: master_table.to_string(),
            cache,
            inner: Mutex::new(Inner {
                record,
                writer: None,
            }),
        };
        block.bind();
        Ok(block)
    }

    /// Slot number in the ring
    pub fn n(&self) -> usize {
        self.n
    }

    /// Start of the time slice this slot currently represents
    pub fn tbase(&self) -> Timestamp {
        self.inner.lock().unwrap().record.tbase
    }

    /// Snapshot of the master record
    pub fn record(&self) -> MasterRecord {
        self.inner.lock().unwrap().record.clone()
    }

    /// Whether a batched writer is currently attached
    pub fn has_writer(&self) -> bool {
        self.inner.lock().unwrap().writer.is_some()
    }

    /// Attach the batched writer to an existing datapoints table
    fn bind(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.writer.is_none() {
            if let Some(name) = inner.record.data_points_name.clone() {
                inner.writer = Some(Arc::new(TimedBatchWriter::new(
                    Arc::clone(&self.db),
                    &name,
                    Duration::from_millis(self.config.writer_flush_ms),
                )));
            }
        }
    }

    /// Re-read the master record to recover from external mutation
    pub fn refresh(&self) -> Result<BlockState> {
        let (n, tbase) = {
            let inner = self.inner.lock().unwrap();
            (inner.record.n, inner.record.tbase)
        };
        let rows = self.db.query(
            &self.master_table,
            &AttrValue::from(n as u64),
            Some(&RangeCondition::Equal(AttrValue::from(tbase))),
            &QueryOptions::consistent(),
        )?;
        let item = rows
            .first()
            .ok_or_else(|| TsdbError::Schema(format!("master record for slot {} is gone", n)))?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.record = MasterRecord::from_item(item)?;
        }
        self.bind();
        self.state()
    }

    fn table_state(desc: &TableDescription) -> BlockState {
        use crate::backend::TableStatus;
        match desc.status {
            TableStatus::Active if desc.throughput.write <= 1 => BlockState::TurnedDown,
            TableStatus::Active => BlockState::Active,
            // CREATING, UPDATING, DELETING: still transitioning
            _ => BlockState::Creating,
        }
    }

    /// Current lifecycle state, derived from the master record plus live
    /// descriptions of both physical tables
    pub fn state(&self) -> Result<BlockState> {
        let (state, dp_name, index_name) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.record.state,
                inner.record.data_points_name.clone(),
                inner.record.index_name.clone(),
            )
        };
        if state == BlockState::Initial {
            return Ok(BlockState::Initial);
        }
        let (dp_name, index_name) = match (dp_name, index_name) {
            (Some(dp), Some(index)) => (dp, index),
            _ => return Ok(BlockState::Initial),
        };
        let s1 = Self::table_state(&self.db.describe_table(&dp_name)?);
        let s2 = Self::table_state(&self.db.describe_table(&index_name)?);
        if s1 == s2 {
            Ok(s1)
        } else {
            Ok(BlockState::Undefined)
        }
    }

    /// Create both physical tables with full write throughput and persist
    /// the CREATING transition. Idempotent: tables that already exist are
    /// left alone, so a partially failed attempt converges on retry.
    pub fn create_tables(&self) -> Result<BlockState> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.record.data_points_name.is_some()
                && inner.record.index_name.is_some()
                && inner.writer.is_some()
            {
                drop(inner);
                return self.state();
            }
            let tbase = inner.record.tbase;
            let dp_name = data_points_table_name(tbase);
            let index_name = index_table_name(tbase);
            let blocks = self.config.blocks() as u64;

            self.ensure_table(
                &dp_name,
                TableSchema::new(
                    KeyDef::new(ATTR_DP_HASH, KeyType::String),
                    KeyDef::new(ATTR_DP_RANGE, KeyType::Number),
                ),
                Throughput::new(
                    (self.config.tp_read_datapoints / blocks).max(1),
                    self.config.tp_write_datapoints,
                ),
            )?;
            self.ensure_table(
                &index_name,
                TableSchema::new(
                    KeyDef::new(ATTR_INDEX_HASH, KeyType::String),
                    KeyDef::new(ATTR_INDEX_RANGE, KeyType::String),
                ),
                Throughput::new(
                    (self.config.tp_read_index_key / blocks).max(1),
                    self.config.tp_write_index_key,
                ),
            )?;

            inner.record.data_points_name = Some(dp_name);
            inner.record.index_name = Some(index_name);
            inner.record.state = BlockState::Creating;
            self.db
                .put_item(&self.master_table, inner.record.to_item())?;
            log::info!(
                "block {}: creating tables for tbase {}",
                self.n,
                inner.record.tbase
            );
        }
        self.bind();
        self.state()
    }

    fn ensure_table(&self, name: &str, schema: TableSchema, throughput: Throughput) -> Result<()> {
        match self.db.describe_table(name) {
            Ok(_) => Ok(()),
            Err(TsdbError::TableNotFound(_)) => self.db.create_table(name, schema, throughput),
            Err(e) => Err(e),
        }
    }

    /// Reuse this slot for the block starting at `base_time(timestamp)`.
    /// A timestamp that maps to a different slot is a programmer error; the
    /// same tbase is a no-op.
    pub fn replace(&self, timestamp: Timestamp) -> Result<()> {
        let pos = self.config.block_pos(timestamp);
        if pos != self.n {
            return Err(TsdbError::wrong_slot(timestamp, pos, self.n));
        }
        if self.config.base_time(timestamp) == self.tbase() {
            return Ok(());
        }
        self.delete_tables(Some(timestamp))?;
        Ok(())
    }

    /// Delete both physical tables and re-seed the master record for a new
    /// tbase (the current one when `timestamp` is `None`). Buffered writes
    /// are discarded, not flushed: their target table is going away.
    pub fn delete_tables(&self, timestamp: Option<Timestamp>) -> Result<BlockState> {
        let mut inner = self.inner.lock().unwrap();
        let new_tbase = self
            .config
            .base_time(timestamp.unwrap_or(inner.record.tbase));

        if let Some(writer) = inner.writer.take() {
            writer.discard();
        }
        if let Some(name) = inner.record.data_points_name.clone() {
            self.drop_table(&name)?;
            inner.record.data_points_name = None;
        }
        if let Some(name) = inner.record.index_name.clone() {
            self.drop_table(&name)?;
            inner.record.index_name = None;
        }

        let old_tbase = inner.record.tbase;
        self.db.delete_item(
            &self.master_table,
            &AttrValue::from(self.n as u64),
            &AttrValue::from(old_tbase),
        )?;
        inner.record.tbase = new_tbase;
        inner.record.state = BlockState::Initial;
        self.db
            .put_item(&self.master_table, inner.record.to_item())?;
        log::info!(
            "block {}: recycled tbase {} -> {}",
            self.n,
            old_tbase,
            new_tbase
        );
        Ok(BlockState::Initial)
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        match self.db.delete_table(name) {
            Ok(()) | Err(TsdbError::TableNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Flush and release the batched writer, then reduce both tables'
    /// write capacity to the minimum. Reads keep their per-block budget.
    pub fn turndown_tables(&self) -> Result<()> {
        let (writer, dp_name, index_name) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.writer.take(),
                inner.record.data_points_name.clone(),
                inner.record.index_name.clone(),
            )
        };
        if let Some(writer) = writer {
            if let Err(e) = writer.flush() {
                log::error!("block {}: turndown flush failed: {}", self.n, e);
            }
        }
        let (dp_name, index_name) = match (dp_name, index_name) {
            (Some(dp), Some(index)) => (dp, index),
            _ => {
                return Err(TsdbError::Block(format!(
                    "block {} has no tables to turn down",
                    self.n
                )))
            }
        };
        let blocks = self.config.blocks() as u64;
        self.db.update_throughput(
            &dp_name,
            Throughput::new((self.config.tp_read_datapoints / blocks).max(1), 1),
        )?;
        self.db.update_throughput(
            &index_name,
            Throughput::new((self.config.tp_read_index_key / blocks).max(1), 1),
        )?;
        log::info!("block {}: write capacity turned down", self.n);
        Ok(())
    }

    /// Poll until the block reports ACTIVE or `max_wait` elapses, then
    /// persist the observed state to the master record
    pub fn wait_for_active(&self, max_wait: Duration, retry: Duration) -> Result<BlockState> {
        let deadline = Instant::now() + max_wait;
        let mut state = self.state()?;
        while state != BlockState::Active && Instant::now() < deadline {
            thread::sleep(retry);
            state = self.state()?;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.record.state = state;
        self.db
            .put_item(&self.master_table, inner.record.to_item())?;
        Ok(state)
    }

    /// Store one datapoint. When the block is not writable (no writer
    /// attached, e.g. during a turndown window) the point is dropped
    /// silently; out-of-range times never reach here because routing
    /// filters them at `get_block`.
    pub fn store_datapoint(
        &self,
        timestamp: Timestamp,
        metric: &str,
        tags: &Tags,
        value: f64,
        domain: &str,
    ) -> Result<()> {
        let (writer, index_name) = {
            let inner = self.inner.lock().unwrap();
            (inner.writer.clone(), inner.record.index_name.clone())
        };
        let writer = match writer {
            Some(writer) => writer,
            None => return Ok(()),
        };

        let tbase = self.config.base_time(timestamp);
        let key = data_points_key(domain, metric, tbase, tags);
        // Write-through dedup: one index row per composite key, overwrite
        // keeps it idempotent when the cache is cold or has evicted the key.
        if !self.cache.contains(&key) {
            if let Some(index_name) = index_name {
                let mut row = Item::new();
                row.insert(
                    ATTR_INDEX_HASH.into(),
                    AttrValue::text(index_hash_key(domain, metric)),
                );
                row.insert(
                    ATTR_INDEX_RANGE.into(),
                    AttrValue::text(index_range_key(tbase, tags)),
                );
                self.db.put_item(&index_name, row)?;
                self.cache.insert(&key);
            }
        }

        let mut item = Item::new();
        item.insert(ATTR_DP_HASH.into(), AttrValue::text(key));
        item.insert(
            ATTR_DP_RANGE.into(),
            AttrValue::from(self.config.offset_time(timestamp)),
        );
        item.insert(ATTR_DP_VALUE.into(), AttrValue::N(value));
        writer.put(item)
    }

    /// Index keys for `(domain, metric)` whose block start falls inside
    /// `[base_time(start), base_time(end)]`. Empty when the block has no
    /// index table yet.
    pub fn query_index(
        &self,
        domain: &str,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<IndexKey>> {
        let index_name = match self.inner.lock().unwrap().record.index_name.clone() {
            Some(name) => name,
            None => return Ok(Vec::new()),
        };
        let lo = format_tbase(self.config.base_time(start));
        let hi = format_tbase(self.config.base_time(end) + 1);
        let rows = self.db.query(
            &index_name,
            &AttrValue::text(index_hash_key(domain, metric)),
            Some(&RangeCondition::Between(
                AttrValue::text(lo),
                AttrValue::text(hi),
            )),
            &QueryOptions::default(),
        )?;
        rows.iter()
            .map(|row| {
                let hash = row
                    .get(ATTR_INDEX_HASH)
                    .and_then(AttrValue::as_str)
                    .ok_or_else(|| TsdbError::Item("index row missing hash key".into()))?;
                let range = row
                    .get(ATTR_INDEX_RANGE)
                    .and_then(AttrValue::as_str)
                    .ok_or_else(|| TsdbError::Item("index row missing range key".into()))?;
                IndexKey::from_row(hash, range)
            })
            .collect()
    }

    /// Datapoint rows for one index key inside `[start, end]`, newest
    /// first. Each row carries `toffset` plus the requested attributes.
    pub fn query_datapoints(
        &self,
        index_key: &IndexKey,
        start: Timestamp,
        end: Timestamp,
        attributes: &[&str],
    ) -> Result<Vec<Item>> {
        let dp_name = match self.inner.lock().unwrap().record.data_points_name.clone() {
            Some(name) => name,
            None => return Ok(Vec::new()),
        };
        let (lo, hi) = match self.config.offset_range(index_key.tbase, start, end) {
            Some(range) => range,
            None => return Ok(Vec::new()),
        };
        let mut projection: Vec<String> = vec![ATTR_DP_RANGE.to_string()];
        projection.extend(attributes.iter().map(|a| a.to_string()));
        self.db.query(
            &dp_name,
            &AttrValue::text(index_key.data_points_key()),
            Some(&RangeCondition::Between(
                AttrValue::from(lo),
                AttrValue::from(hi),
            )),
            &QueryOptions {
                consistent: false,
                scan_forward: false,
                attributes: Some(projection),
            },
        )
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record();
        f.debug_struct("Block")
            .field("n", &record.n)
            .field("tbase", &record.tbase)
            .field("state", &record.state)
            .field("data_points_name", &record.data_points_name)
            .field("index_name", &record.index_name)
            .finish()
    }
}

//! The block ring
//!
//! `Schema` owns the ring of blocks plus the small master table that makes
//! slot assignments durable. It routes datapoint writes and index/datapoint
//! queries to the block covering their timestamp and hosts the maintenance
//! rules the background worker drives.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{
    AttrValue, Database, DatabaseRef, KeyDef, KeyType, QueryOptions, TableSchema, TableStatus,
    Throughput,
};
use crate::error::{Result, TsdbError};
use crate::types::{IndexKey, Tags, Timestamp};

use super::block::{Block, BlockState, MasterRecord};
use super::cache::KeyCache;
use super::clock::Clock;
use super::StoreConfig;

/// Name of the master table holding one record per ring slot
pub const MASTER_TABLE: &str = "amdw_dp_master";

/// Poll a table description until it reports ACTIVE
pub fn wait_for_table(
    db: &DatabaseRef,
    name: &str,
    max_wait: Duration,
    retry: Duration,
) -> Result<()> {
    let deadline = Instant::now() + max_wait;
    loop {
        if db.describe_table(name)?.status == TableStatus::Active {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TsdbError::Backend(format!(
                "table '{}' did not become active within {:?}",
                name, max_wait
            )));
        }
        thread::sleep(retry);
    }
}

/// The ring of blocks and its routing operations
pub struct Schema {
    config: Arc<StoreConfig>,
    db: DatabaseRef,
    clock: Arc<dyn Clock>,
    blocks: Vec<Arc<Block>>,
    /// Shared across blocks: composite keys embed the block start, so
    /// entries from different blocks can never collide
    index_key_cache: Arc<KeyCache>,
}

impl Schema {
    /// Bootstrap the master table and seed one INITIAL record per slot for
    /// the current block and the ones after it. Idempotent: existing slot
    /// records are left untouched.
    pub fn create(
        db: &DatabaseRef,
        config: &Arc<StoreConfig>,
        clock: &Arc<dyn Clock>,
        max_wait: Duration,
    ) -> Result<()> {
        match db.create_table(
            MASTER_TABLE,
            TableSchema::new(
                KeyDef::new("n", KeyType::Number),
                KeyDef::new("tbase", KeyType::Number),
            ),
            Throughput::new(5, 5),
        ) {
            Ok(()) | Err(TsdbError::TableExists(_)) => {}
            Err(e) => return Err(e),
        }
        wait_for_table(db, MASTER_TABLE, max_wait, Duration::from_millis(100))?;

        let now = clock.now();
        for i in 0..config.blocks() as u64 {
            let t = now + i * config.block_size();
            let n = config.block_pos(t);
            let existing = db.query(
                MASTER_TABLE,
                &AttrValue::from(n as u64),
                None,
                &QueryOptions::consistent(),
            )?;
            if existing.is_empty() {
                let record = MasterRecord {
                    n,
                    tbase: config.base_time(t),
                    state: BlockState::Initial,
                    data_points_name: None,
                    index_name: None,
                };
                db.put_item(MASTER_TABLE, record.to_item())?;
            }
        }
        log::info!(
            "schema created: {} slots of {} ms",
            config.blocks(),
            config.block_size()
        );
        Ok(())
    }

    /// Bind to an existing master table and load every slot. Slots with no
    /// record yet are initialized to INITIAL.
    pub fn open(db: DatabaseRef, config: Arc<StoreConfig>, clock: Arc<dyn Clock>) -> Result<Schema> {
        db.describe_table(MASTER_TABLE).map_err(|_| {
            TsdbError::Schema(format!(
                "master table '{}' not found; create the schema first",
                MASTER_TABLE
            ))
        })?;

        let cache = Arc::new(KeyCache::new(config.cache_write_index_key));
        let now = clock.now();
        let mut blocks = Vec::with_capacity(config.blocks());
        for n in 0..config.blocks() {
            // the natural tbase for this slot: whichever of the upcoming
            // block starts lands here
            let mut default_tbase = now;
            for i in 0..config.blocks() as u64 {
                let t = now + i * config.block_size();
                if config.block_pos(t) == n {
                    default_tbase = t;
                    break;
                }
            }
            blocks.push(Arc::new(Block::open(
                Arc::clone(&config),
                Arc::clone(&db),
                Arc::clone(&cache),
                MASTER_TABLE,
                n,
                default_tbase,
            )?));
        }
        Ok(Schema {
            config,
            db,
            clock,
            blocks,
            index_key_cache: cache,
        })
    }

    /// Best-effort teardown of every block's tables and the master table
    pub fn destroy(db: DatabaseRef, config: Arc<StoreConfig>, clock: Arc<dyn Clock>) -> Result<()> {
        let schema = Schema::open(Arc::clone(&db), config, clock)?;
        for block in schema.blocks() {
            if let Err(e) = block.delete_tables(None) {
                log::error!("destroy: block {} teardown failed: {}", block.n(), e);
            }
        }
        if let Err(e) = db.delete_table(MASTER_TABLE) {
            log::error!("destroy: master table teardown failed: {}", e);
        }
        Ok(())
    }

    pub fn config(&self) -> &Arc<StoreConfig> {
        &self.config
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    pub fn index_key_cache(&self) -> &Arc<KeyCache> {
        &self.index_key_cache
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// The block covering `t`, or `None` when its slot currently represents
    /// a different time slice. This gate is what makes out-of-window
    /// timestamps fall through silently.
    pub fn get_block(&self, t: Timestamp) -> Option<Arc<Block>> {
        let block = &self.blocks[self.config.block_pos(t)];
        if block.tbase() == self.config.base_time(t) {
            Some(Arc::clone(block))
        } else {
            None
        }
    }

    pub fn current(&self) -> Option<Arc<Block>> {
        self.get_block(self.clock.now())
    }

    pub fn next(&self) -> Option<Arc<Block>> {
        self.get_block(self.clock.now() + self.config.block_size())
    }

    pub fn previous(&self) -> Option<Arc<Block>> {
        self.clock
            .now()
            .checked_sub(self.config.block_size())
            .and_then(|t| self.get_block(t))
    }

    /// Point the slot for `t` at the block starting at `base_time(t)`,
    /// recycling whatever it held before
    pub fn create_block(&self, t: Timestamp) -> Result<Arc<Block>> {
        let block = &self.blocks[self.config.block_pos(t)];
        block.replace(t)?;
        Ok(Arc::clone(block))
    }

    pub fn create_current(&self) -> Result<Arc<Block>> {
        self.create_block(self.clock.now())
    }

    pub fn create_next(&self) -> Result<Arc<Block>> {
        self.create_block(self.clock.now() + self.config.block_size())
    }

    /// Milliseconds (and percent of a block) elapsed in the current block
    pub fn time_expired(&self) -> (u64, u32) {
        let now = self.clock.now();
        let expired = now - self.config.base_time(now);
        (expired, Self::percent(expired, self.config.block_size()))
    }

    /// Milliseconds (and percent of a block) until the next block starts
    pub fn time_remaining(&self) -> (u64, u32) {
        let now = self.clock.now();
        let remaining = self.config.base_time(now) + self.config.block_size() - now;
        (remaining, Self::percent(remaining, self.config.block_size()))
    }

    fn percent(part: u64, whole: u64) -> u32 {
        ((part * 100 + whole / 2) / whole) as u32
    }

    /// Store one datapoint, routed by timestamp. Times outside the ring are
    /// dropped silently.
    pub fn store_datapoint(
        &self,
        timestamp: Timestamp,
        metric: &str,
        tags: &Tags,
        value: f64,
        domain: &str,
    ) -> Result<()> {
        match self.get_block(timestamp) {
            Some(block) => block.store_datapoint(timestamp, metric, tags, value, domain),
            None => Ok(()),
        }
    }

    /// Index keys for `(domain, metric)` across every block the window
    /// touches. The window is clamped to the readable history first.
    pub fn query_index(
        &self,
        domain: &str,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<IndexKey>> {
        let now = self.clock.now();
        let start = start.max(now.saturating_sub(self.config.available_history()));
        let end = end.min(now);
        if start > end {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let mut t = start;
        while t < end + self.config.block_size() {
            if let Some(block) = self.get_block(t) {
                keys.extend(block.query_index(domain, metric, start, end)?);
            }
            t += self.config.block_size();
        }
        Ok(keys)
    }

    /// Datapoint rows for one index key, routed by its embedded block start
    pub fn query_datapoints(
        &self,
        index_key: &IndexKey,
        start: Timestamp,
        end: Timestamp,
        attributes: &[&str],
    ) -> Result<Vec<crate::backend::Item>> {
        match self.get_block(index_key.tbase) {
            Some(block) => block.query_datapoints(index_key, start, end, attributes),
            None => Ok(Vec::new()),
        }
    }

    /// Should the next block be created this tick?
    pub fn should_create_next(&self) -> Result<bool> {
        if let Some(next) = self.next() {
            if next.state()? == BlockState::Active {
                return Ok(false);
            }
        }
        let threshold = (60_000 * self.config.mx_create_next_min)
            .max(self.config.block_size() * self.config.mx_create_next_pct / 100);
        Ok(self.time_remaining().0 < threshold)
    }

    /// Should the previous block's write capacity be reclaimed this tick?
    pub fn should_turndown_previous(&self) -> Result<bool> {
        let previous = match self.previous() {
            Some(block) => block,
            None => return Ok(false),
        };
        if previous.state()? != BlockState::Active {
            return Ok(false);
        }
        let threshold = (60_000 * self.config.mx_turndown_min)
            .min(self.config.block_size() * self.config.mx_turndown_pct / 100);
        Ok(self.time_expired().0 > threshold)
    }

    /// Run the three maintenance rules. Each rule is idempotent and runs
    /// regardless of the others failing; the first failure is logged here
    /// and returned so direct callers can see it.
    pub fn perform_maintenance(&self) -> Result<()> {
        let mut first_err = None;
        for (rule, result) in [
            ("create next", self.maintain_next()),
            ("turndown previous", self.maintain_previous()),
            ("ensure current", self.maintain_current()),
        ] {
            if let Err(e) = result {
                log::error!("maintenance rule '{}' failed: {}", rule, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn maintain_next(&self) -> Result<()> {
        if self.should_create_next()? {
            let block = self.create_next()?;
            block.create_tables()?;
        }
        Ok(())
    }

    fn maintain_previous(&self) -> Result<()> {
        if self.should_turndown_previous()? {
            if let Some(previous) = self.previous() {
                previous.turndown_tables()?;
            }
        }
        Ok(())
    }

    fn maintain_current(&self) -> Result<()> {
        let missing = match self.current() {
            None => true,
            Some(block) => block.state()? == BlockState::Initial,
        };
        if missing {
            let block = self.create_current()?;
            block.create_tables()?;
        }
        Ok(())
    }
}

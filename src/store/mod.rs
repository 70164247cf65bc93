//! Block rotation storage engine
//!
//! Retention is partitioned into fixed-width time blocks. Each block owns a
//! dedicated pair of physical tables (datapoints + tag index) and cycles
//! through create -> active -> turn-down -> recycle under a background
//! maintenance loop. Reads and writes are routed to the block covering
//! their timestamp; expired blocks are dropped wholesale by deleting their
//! tables instead of deleting individual rows.
//!
//! ## Architecture
//! - `partition`: pure time math mapping timestamps to blocks
//! - `writer`: bounded batch buffer in front of the datapoints table
//! - `cache`: bounded LRU suppressing redundant index writes
//! - `block`: one ring slot (master record + two physical tables)
//! - `schema`: the ring itself, plus routing and the maintenance rules
//! - `maintenance`: the periodic worker driving the rules

pub mod block;
pub mod cache;
pub mod clock;
pub mod maintenance;
pub mod partition;
pub mod schema;
pub mod writer;

pub use block::{Block, BlockState, MasterRecord};
pub use cache::KeyCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use maintenance::MaintenanceWorker;
pub use schema::Schema;
pub use writer::TimedBatchWriter;

/// Storage engine configuration, immutable for the process lifetime.
///
/// Retention is expressed as a window (`store_history`, milliseconds) split
/// into `store_history_blocks` blocks; the ring carries one extra bumper
/// slot so recycling never collides with a slot still serving in-window
/// reads. Throughput budgets are split per block for reads and granted in
/// full to the block currently taking writes.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Retention window in milliseconds
    pub store_history: u64,
    /// Number of blocks the retention window is split into
    pub store_history_blocks: u64,

    /// Read capacity budget for datapoints tables, divided among blocks
    pub tp_read_datapoints: u64,
    /// Write capacity granted to the active datapoints table
    pub tp_write_datapoints: u64,
    /// Read capacity budget for index tables, divided among blocks
    pub tp_read_index_key: u64,
    /// Write capacity granted to the active index table
    pub tp_write_index_key: u64,

    /// Capacity of the index-key dedup cache
    pub cache_write_index_key: usize,
    /// Capacities of the name catalog write-through caches
    pub cache_metric_name: usize,
    pub cache_tag_name: usize,
    pub cache_tag_value: usize,

    /// Create the next block when less than `max(min*60s, pct% of a block)`
    /// remains in the current one
    pub mx_create_next_min: u64,
    pub mx_create_next_pct: u64,
    /// Turn the previous block down once more than `min(min*60s, pct% of a
    /// block)` of the current one has elapsed
    pub mx_turndown_min: u64,
    pub mx_turndown_pct: u64,

    /// Idle interval of the batched writer's background flush
    pub writer_flush_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_history: 360 * 24 * 60 * 60 * 1000, // 360 days
            store_history_blocks: 12,                 // 30-day blocks
            tp_read_datapoints: 40,
            tp_write_datapoints: 20,
            tp_read_index_key: 10,
            tp_write_index_key: 5,
            cache_write_index_key: 50_000,
            cache_metric_name: 1_000,
            cache_tag_name: 1_000,
            cache_tag_value: 5_000,
            mx_create_next_min: 60,
            mx_create_next_pct: 10,
            mx_turndown_min: 120,
            mx_turndown_pct: 25,
            writer_flush_ms: 500,
        }
    }
}

impl StoreConfig {
    /// One hour of history in four blocks; small caches. Handy for demos
    /// and local runs where table churn should be visible quickly.
    pub fn compact() -> Self {
        Self {
            store_history: 60 * 60 * 1000,
            store_history_blocks: 4,
            cache_write_index_key: 1_000,
            cache_metric_name: 100,
            cache_tag_name: 100,
            cache_tag_value: 500,
            ..Default::default()
        }
    }

    /// Width of one block in milliseconds
    pub fn block_size(&self) -> u64 {
        self.store_history / self.store_history_blocks
    }

    /// Number of ring slots: the history blocks plus one bumper
    pub fn blocks(&self) -> usize {
        (self.store_history_blocks + 1) as usize
    }

    /// The readable window: history without the bumper
    pub fn available_history(&self) -> u64 {
        self.store_history_blocks * self.block_size()
    }

    /// Full ring period: blocks * block size
    pub fn ring_period(&self) -> u64 {
        self.blocks() as u64 * self.block_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_quantities() {
        let config = StoreConfig {
            store_history: 3000,
            store_history_blocks: 3,
            ..Default::default()
        };
        assert_eq!(config.block_size(), 1000);
        assert_eq!(config.blocks(), 4);
        assert_eq!(config.available_history(), 3000);
        assert_eq!(config.ring_period(), 4000);
    }

    #[test]
    fn test_default_is_thirty_day_blocks() {
        let config = StoreConfig::default();
        assert_eq!(config.block_size(), 30 * 24 * 60 * 60 * 1000);
        assert_eq!(config.blocks(), 13);
    }
}

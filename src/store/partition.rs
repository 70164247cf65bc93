//! Time partitioner
//!
//! Pure functions mapping timestamps onto the block ring. A timestamp's
//! block starts at `base_time(t)` (t rounded down to a block boundary) and
//! lives in ring slot `block_pos(t)`, the block-aligned position modulo the
//! ring period. Datapoints are addressed inside their block by
//! `offset_time(t)`, milliseconds since the block start.

use crate::types::Timestamp;

use super::StoreConfig;

impl StoreConfig {
    /// Block-aligned start of the block containing `t`
    pub fn base_time(&self, t: Timestamp) -> Timestamp {
        t - t % self.block_size()
    }

    /// Ring slot of the block containing `t`, in `[0, blocks())`
    pub fn block_pos(&self, t: Timestamp) -> usize {
        (self.base_time(t) % self.ring_period() / self.block_size()) as usize
    }

    /// Milliseconds from the block start to `t`
    pub fn offset_time(&self, t: Timestamp) -> Timestamp {
        t - self.base_time(t)
    }

    /// Inclusive offset range a query window covers inside the block
    /// starting at `tbase`, clamped to the block. Returns `None` when the
    /// window misses the block entirely.
    pub fn offset_range(
        &self,
        tbase: Timestamp,
        start: Timestamp,
        end: Timestamp,
    ) -> Option<(Timestamp, Timestamp)> {
        let block_end = tbase + self.block_size() - 1;
        if end < tbase || start > block_end {
            return None;
        }
        let lo = start.max(tbase) - tbase;
        let hi = end.min(block_end) - tbase;
        Some((lo, hi))
    }
}

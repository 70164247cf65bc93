//! Batched table writer
//!
//! Buffers datapoint items in front of the backend's batch-write call.
//! A flush happens when the buffer reaches the backend's batch ceiling, when
//! the owner asks for one, or when the background flusher finds a non-empty
//! buffer after an idle interval, so low-rate producers still persist.
//!
//! A failed flush re-queues its items and the error is surfaced to the next
//! `put` or `flush` call. The writer's lifecycle is bound to its block:
//! turndown flushes once and drops the writer, recycle discards the buffer
//! since the table is being deleted anyway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::backend::{Database, DatabaseRef, Item, MAX_BATCH_ITEMS};
use crate::error::{Result, TsdbError};

struct WriterShared {
    db: DatabaseRef,
    table: String,
    buffer: Mutex<Vec<Item>>,
    /// Failure of a background flush, reported on the next put/flush
    pending_error: Mutex<Option<String>>,
    shutdown: AtomicBool,
}

impl WriterShared {
    /// Drain the buffer in backend-sized batches. Items enqueued while a
    /// batch is in flight are picked up by the next iteration; a failed
    /// batch is put back in front so nothing is dropped.
    fn flush(&self) -> Result<()> {
        loop {
            let batch: Vec<Item> = {
                let mut buffer = self.buffer.lock().unwrap();
                if buffer.is_empty() {
                    return Ok(());
                }
                let take = buffer.len().min(MAX_BATCH_ITEMS);
                buffer.drain(..take).collect()
            };
            if let Err(e) = self.db.batch_write(&self.table, batch.clone()) {
                let mut buffer = self.buffer.lock().unwrap();
                for (i, item) in batch.into_iter().enumerate() {
                    buffer.insert(i, item);
                }
                return Err(e);
            }
        }
    }

    fn take_pending_error(&self) -> Option<String> {
        self.pending_error.lock().unwrap().take()
    }
}

/// Background flusher: flush whatever accumulated, every idle interval
fn flusher_loop(shared: Arc<WriterShared>, interval: Duration) {
    log::debug!(
        "batch writer for '{}' started (flush interval: {:?})",
        shared.table,
        interval
    );
    while !shared.shutdown.load(Ordering::Relaxed) {
        let wake = Instant::now() + interval;
        while Instant::now() < wake {
            if shared.shutdown.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(20).min(interval));
        }
        if let Err(e) = shared.flush() {
            log::error!("background flush for '{}' failed: {}", shared.table, e);
            *shared.pending_error.lock().unwrap() = Some(e.to_string());
        }
    }
}

/// Batch buffer with threshold and idle-timer flushing
pub struct TimedBatchWriter {
    shared: Arc<WriterShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimedBatchWriter {
    pub fn new(db: DatabaseRef, table: &str, flush_interval: Duration) -> Self {
        let shared = Arc::new(WriterShared {
            db,
            table: table.to_string(),
            buffer: Mutex::new(Vec::new()),
            pending_error: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::spawn(move || flusher_loop(worker, flush_interval));
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue one item; flushes when the buffer reaches the batch ceiling.
    /// The item is buffered even when a stale background-flush error is
    /// being reported.
    pub fn put(&self, item: Item) -> Result<()> {
        let full = {
            let mut buffer = self.shared.buffer.lock().unwrap();
            buffer.push(item);
            buffer.len() >= MAX_BATCH_ITEMS
        };
        if let Some(msg) = self.shared.take_pending_error() {
            return Err(TsdbError::Backend(msg));
        }
        if full {
            self.shared.flush()?;
        }
        Ok(())
    }

    /// Force pending items to the backend; a no-op on an empty buffer.
    /// Clears a stale background-flush error: if the buffer writes cleanly
    /// now the earlier failure was transient, otherwise the fresh error is
    /// returned.
    pub fn flush(&self) -> Result<()> {
        self.shared.take_pending_error();
        self.shared.flush()
    }

    /// Drop buffered items without writing them. Used when the target table
    /// is about to be deleted.
    pub fn discard(&self) {
        self.shared.buffer.lock().unwrap().clear();
        self.shared.take_pending_error();
    }

    /// Number of items waiting to be flushed
    pub fn pending(&self) -> usize {
        self.shared.buffer.lock().unwrap().len()
    }
}

impl Drop for TimedBatchWriter {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Err(e) = self.shared.flush() {
            log::error!("final flush for '{}' failed: {}", self.shared.table, e);
        }
    }
}

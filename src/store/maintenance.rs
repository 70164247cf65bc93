//! Background maintenance worker
//!
//! A single thread that wakes on a fixed tick and runs the schema's
//! maintenance rules: create the upcoming block before its start arrives,
//! turn down the previous block once stragglers have tapered off, and make
//! sure the current block exists. Rule failures are logged and retried on
//! the next tick; the loop itself never aborts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::schema::Schema;

/// Standard tick between maintenance passes
pub const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

fn worker_loop(schema: Arc<Schema>, shutdown: Arc<AtomicBool>, tick: Duration) {
    log::info!("maintenance worker started (tick: {:?})", tick);
    loop {
        let wake = Instant::now() + tick;
        while Instant::now() < wake {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("maintenance worker shutting down");
                return;
            }
            thread::sleep(Duration::from_millis(20).min(tick));
        }
        // rule failures are already logged inside perform_maintenance
        let _ = schema.perform_maintenance();
    }
}

/// Handle to the maintenance thread
pub struct MaintenanceWorker {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Spawn the worker with the given tick (see [`MAINTENANCE_TICK`])
    pub fn start(schema: Arc<Schema>, tick: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || worker_loop(schema, flag, tick));
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the worker and wait for it to exit
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

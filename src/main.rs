//! minitsdb - A minimal time-series datapoint store
//!
//! Accepts high-rate metric writes (domain, metric name, tag set,
//! timestamp, value), serves range queries by metric, tags and time
//! window, and keeps storage cost proportional to the retention window by
//! rotating per-block tables instead of deleting individual rows.
//!
//! Architecture Overview:
//!
//!   HTTP API (axum)
//!     -> Datastore (JSON bodies, name catalogs)
//!       -> Schema (ring of blocks, routing, maintenance rules)
//!         -> Block (master record + datapoints/index table pair)
//!           -> backend key-value database (hash+range tables)
//!
//! A single background worker rotates the ring: it creates the upcoming
//! block ahead of time, turns down the write capacity of the previous one,
//! and recycles the oldest slot when the ring wraps.

use std::sync::Arc;

use log::info;

use minitsdb::backend::MemoryDatabase;
use minitsdb::store::StoreConfig;
use minitsdb::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments (simple)
    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--domain" | "-d" => {
                if i + 1 < args.len() {
                    config.domain = args[i + 1].clone();
                    i += 1;
                }
            }
            "--compact" | "-c" => {
                // one hour of history in four blocks; table churn is
                // visible within minutes instead of weeks
                config.store = StoreConfig::compact();
            }
            "--help" | "-h" => {
                println!("minitsdb - A minimal time-series datapoint store");
                println!();
                println!("Usage: minitsdb [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -b, --bind ADDR     Address to listen on (default: 127.0.0.1:8080)");
                println!("  -d, --domain NAME   Domain to serve (default: nodomain)");
                println!("  -c, --compact       Short retention preset for demos");
                println!("  -h, --help          Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!("Starting minitsdb server...");

    // The in-memory reference backend. A client for a hosted key-value
    // database plugs in through the same Database trait.
    let db = Arc::new(MemoryDatabase::new());
    let server = Server::new(config, db).await?;
    server.run().await?;

    Ok(())
}

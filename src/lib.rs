use std::net::SocketAddr;
use std::sync::Arc;

use log::info;

pub mod backend;
pub mod datastore;
pub mod error;
pub mod http;
pub mod store;
pub mod types;

use crate::backend::DatabaseRef;
use crate::datastore::Datastore;
use crate::error::Result;
use crate::store::maintenance::MAINTENANCE_TICK;
use crate::store::{Clock, MaintenanceWorker, StoreConfig, SystemClock};

/// Server configuration
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP API to
    pub bind_addr: SocketAddr,
    /// Domain every request is served under. Deriving it per request from
    /// auth or path is left to the deployment in front of this server.
    pub domain: String,
    /// Storage engine configuration
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().expect("invalid default bind address"),
            domain: "nodomain".to_string(),
            store: StoreConfig::default(),
        }
    }
}

/// The datapoint store server
pub struct Server {
    config: Config,
    datastore: Arc<Datastore>,
}

impl Server {
    /// Create a new server over the given backend database, bootstrapping
    /// the schema when the backend is empty
    pub async fn new(config: Config, db: DatabaseRef) -> Result<Self> {
        let store = Arc::new(config.store.clone());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let datastore = Arc::new(Datastore::open(db, store, clock)?);
        Ok(Self { config, datastore })
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.datastore
    }

    /// Run the server: start the maintenance worker and serve the API
    pub async fn run(&self) -> Result<()> {
        let mut worker =
            MaintenanceWorker::start(Arc::clone(self.datastore.schema()), MAINTENANCE_TICK);

        let app = http::router(Arc::clone(&self.datastore), self.config.domain.clone());
        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr).await?;
        info!("minitsdb server listening on {}", self.config.bind_addr);
        info!(
            "domain '{}': {} ring slots of {} ms",
            self.config.domain,
            self.config.store.blocks(),
            self.config.store.block_size()
        );

        let result = axum::serve(listener, app).await;
        worker.shutdown();
        result?;
        Ok(())
    }
}

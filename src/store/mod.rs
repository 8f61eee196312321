pub mod buffer;
pub mod keys;
pub mod ops;
pub mod protocol;
pub mod schema;
pub mod types;

pub use schema::TableChange;
pub use types::{Column, DataType, Database, Entity, ProtocolModule, QueryProtocol, Relation, Row, Table};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::engine::Engine;
use crate::error::DbResult;
use buffer::WriteBuffer;

/// In-memory catalog of databases and cached protocols. Converges with the
/// on-disk META/MAP keys before every schema mutation returns.
#[derive(Default)]
pub struct Catalog {
    pub databases: HashMap<String, Database>,
    pub protocols: HashMap<String, Arc<QueryProtocol>>,
}

/// Central coordinator between the schema/data layer and the key/value
/// engine: write buffering, secondary indices, schema migration and the
/// protocol registry.
pub struct StoreManager {
    engine: Arc<dyn Engine>,
    schema: RwLock<Catalog>,
    buffer: WriteBuffer,
    /// Serializes drain-and-flush cycles.
    flush_lock: Mutex<()>,
    /// Serializes sequence read-modify-write cycles.
    seq_lock: Mutex<()>,
    /// Shared by every data operation; exclusive for migrations that need
    /// quiescence. Always acquired before the schema catalog lock.
    migration_lock: RwLock<()>,
}

impl StoreManager {
    /// Builds a store manager over the given engine and loads the persisted
    /// schema and protocols into memory.
    pub fn new(engine: Arc<dyn Engine>) -> DbResult<Self> {
        let sm = Self {
            engine,
            schema: RwLock::new(Catalog::default()),
            buffer: WriteBuffer::new(),
            flush_lock: Mutex::new(()),
            seq_lock: Mutex::new(()),
            migration_lock: RwLock::new(()),
        };

        if let Err(e) = sm.load_schema() {
            tracing::error!("failed to load schema: {}", e);
        }
        if let Err(e) = sm.load_protocols() {
            tracing::error!("failed to load protocols: {}", e);
        }

        Ok(sm)
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Background flush loop. Drains the write buffer every `interval`
    /// until the shutdown signal fires, then performs one final flush.
    /// A failed flush is logged and its contents are not re-buffered.
    pub async fn run_flusher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush() {
                        tracing::error!("flush failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("flusher stopping, final flush");
                    if let Err(e) = self.flush() {
                        tracing::error!("final flush failed: {}", e);
                    }
                    return;
                }
            }
        }
    }

    /// Final drain-and-flush, used on shutdown paths that do not run the
    /// background flusher.
    pub fn shutdown(&self) {
        if let Err(e) = self.flush() {
            tracing::error!("shutdown flush failed: {}", e);
        }
    }
}

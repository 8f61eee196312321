use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use super::{Engine, IterFlow};
use crate::error::{DbError, DbResult};

/// RocksDB-backed engine. RocksDB owns durability; the store manager's
/// write buffer sits above this layer.
pub struct RocksEngine {
    db: DB,
}

impl RocksEngine {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Bound WAL growth and the number of info log files kept around.
        opts.set_max_total_wal_size(50 * 1024 * 1024);
        opts.set_keep_log_file_num(5);
        opts.set_recycle_log_file_num(3);

        let db = DB::open(&opts, path)
            .map_err(|e| DbError::Internal(format!("failed to open RocksDB: {}", e)))?;

        Ok(Self { db })
    }
}

impl Engine for RocksEngine {
    fn set(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.db
            .put(key, value)
            .map_err(|e| DbError::Internal(format!("rocksdb put: {}", e)))
    }

    fn get(&self, key: &[u8]) -> DbResult<Vec<u8>> {
        match self.db.get(key) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(DbError::NotFound(String::from_utf8_lossy(key).into_owned())),
            Err(e) => Err(DbError::Internal(format!("rocksdb get: {}", e))),
        }
    }

    fn delete(&self, key: &[u8]) -> DbResult<()> {
        self.db
            .delete(key)
            .map_err(|e| DbError::Internal(format!("rocksdb delete: {}", e)))
    }

    fn batch_set(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> DbResult<()> {
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put(key, value);
        }
        self.db
            .write(batch)
            .map_err(|e| DbError::Internal(format!("rocksdb batch write: {}", e)))
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> DbResult<IterFlow>,
    ) -> DbResult<()> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) =
                item.map_err(|e| DbError::Internal(format!("rocksdb iterator: {}", e)))?;
            if !key.starts_with(prefix) {
                break;
            }
            if f(&key, &value)? == IterFlow::Stop {
                break;
            }
        }
        Ok(())
    }
}

//! RocksDB-backed key/value store for persistent deployments.

use crate::storage::kv::{KeyValueStore, StoreError, WriteBatch};
use rocksdb::DB;
use std::path::Path;

/// Persistent store over a RocksDB database.
///
/// The crate's [`WriteBatch`] maps directly onto RocksDB's write batch, so a
/// chain transition commits through a single atomic backend write.
pub struct RocksDbStore {
    db: DB,
}

impl RocksDbStore {
    /// Opens (or creates) a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut options = rocksdb::Options::default();
        options.create_if_missing(true);

        let db = DB::open(&options, path).map_err(from_backend)?;
        Ok(Self { db })
    }
}

fn from_backend(err: rocksdb::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl KeyValueStore for RocksDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db.get(key).map_err(from_backend)
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.db.put(key, value).map_err(from_backend)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db.delete(key).map_err(from_backend)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut db_batch = rocksdb::WriteBatch::default();
        for (key, value) in batch.ops {
            match value {
                Some(value) => db_batch.put(key, value),
                None => db_batch.delete(key),
            }
        }
        self.db.write(db_batch).map_err(from_backend)
    }
}

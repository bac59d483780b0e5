//! Persistent device storage using RocksDB.

use crate::error::Result;
use crate::kv::KeyValueStore;
use rocksdb::{Options, DB};
use std::path::Path;

/// RocksDB-backed [`KeyValueStore`].
pub struct RocksKv {
    db: DB,
}

impl RocksKv {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl KeyValueStore for RocksKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        let iter = self.db.prefix_iterator(prefix.as_bytes());
        for item in iter {
            let (key, _) = item?;
            if key.starts_with(prefix.as_bytes()) {
                keys.push(String::from_utf8_lossy(&key).into_owned());
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

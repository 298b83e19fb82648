//! RocksDB storage layer
//!
//! All ledger state lives in one `TransactionDB`. Values are JSON documents;
//! keys are `:`-separated strings with zero-padded numeric components so that
//! lexicographic order matches numeric order (see the index helpers below).

use crate::config::StorageConfig;
use crate::errors::{LedgerError, LedgerResult};
use rocksdb::{
    Direction, IteratorMode, Options, Transaction, TransactionDB, TransactionDBOptions, TransactionOptions,
    WriteOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Shared handle to the ledger database
#[derive(Clone)]
pub struct LedgerStorage {
    db: Arc<TransactionDB>,
    lock_timeout_ms: i64,
}

impl LedgerStorage {
    pub fn open(config: &StorageConfig) -> LedgerResult<Self> {
        if config.clear_on_start {
            match std::fs::remove_dir_all(&config.data_directory) {
                Ok(()) => tracing::warn!(path = %config.data_directory, "Cleared ledger database on start"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_default_lock_timeout(config.lock_timeout_ms);
        txn_db_opts.set_txn_lock_timeout(config.lock_timeout_ms);

        let db = TransactionDB::open(&opts, &txn_db_opts, &config.data_directory)
            .map_err(|e| LedgerError::Storage(format!("failed to open {}: {}", config.data_directory, e)))?;

        tracing::info!(path = %config.data_directory, "Ledger database opened");

        Ok(Self {
            db: Arc::new(db),
            lock_timeout_ms: config.lock_timeout_ms,
        })
    }

    /// Open with default tuning at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        let config = StorageConfig {
            data_directory: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        };
        Self::open(&config)
    }

    /// Start a pessimistic transaction with deadlock detection.
    pub fn begin(&self) -> Transaction<'_, TransactionDB> {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_deadlock_detect(true);
        txn_opts.set_lock_timeout(self.lock_timeout_ms);
        self.db.transaction_opt(&WriteOptions::default(), &txn_opts)
    }

    pub fn get(&self, key: &[u8]) -> LedgerResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> LedgerResult<Option<T>> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Write outside any transaction. Only for records that are not part of
    /// a balance mutation (audit trail, key material).
    pub fn put(&self, key: &[u8], value: &[u8]) -> LedgerResult<()> {
        Ok(self.db.put(key, value)?)
    }

    pub fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> LedgerResult<()> {
        self.put(key, &encode(value)?)
    }

    /// Scan keys under `prefix` in ascending order, starting strictly after
    /// `start_after` when given.
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> LedgerResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let start = start_after.unwrap_or(prefix);
        let mut rows = Vec::new();

        for item in self.db.iterator(IteratorMode::From(start, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if start_after.is_some_and(|after| key.as_ref() == after) {
                continue;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }

        Ok(rows)
    }

    /// Scan keys under `prefix` in ascending order, seeking straight to
    /// `start` (inclusive).
    pub fn scan_from(&self, prefix: &[u8], start: &[u8], limit: usize) -> LedgerResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows = Vec::new();
        if limit == 0 {
            return Ok(rows);
        }

        for item in self.db.iterator(IteratorMode::From(start.max(prefix), Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }

        Ok(rows)
    }

    /// Keys only, for index prefixes whose values are empty.
    pub fn scan_keys(&self, prefix: &[u8], limit: usize) -> LedgerResult<Vec<String>> {
        Ok(self
            .scan_prefix(prefix, None, limit)?
            .into_iter()
            .map(|(key, _)| String::from_utf8_lossy(&key).into_owned())
            .collect())
    }
}

pub fn encode<T: Serialize>(value: &T) -> LedgerResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> LedgerResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        LedgerError::Serialization(format!(
            "corrupted value at {}: {}",
            String::from_utf8_lossy(key),
            e
        ))
    })
}

/// Zero-padded timestamp component so keys sort chronologically.
pub fn ts_component(ts_millis: i64) -> String {
    format!("{:020}", ts_millis.max(0))
}

/// Last `:`-separated component of an index key.
pub fn last_component(key: &str) -> &str {
    key.rsplit(':').next().unwrap_or(key)
}

/// Ids end up inside keys, so they may not contain the separator.
pub fn validate_id(kind: &str, id: &str) -> LedgerResult<()> {
    if id.is_empty() || id.len() > 128 || id.contains(':') || id.chars().any(char::is_whitespace) {
        return Err(LedgerError::invalid(format!("invalid {} '{}'", kind, id)));
    }
    Ok(())
}

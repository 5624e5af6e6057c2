//! Level 2 disk cache.
//!
//! Query results can be saved to, and restored from, an LMDB environment in
//! a working directory so that a new process can skip the database queries
//! of a previous run. Only results read from the database are saved; the
//! caller decides whether a restored result is still wanted.
//!
//! # Layout
//!
//! - key: `"{table}_{row}_{name}"`, `name` being the resolver's L2 cache name
//! - value: 8-byte little-endian save time (ms since epoch), then the
//!   `serde_json` list of [`SimplePayload`]s making up the result

use crate::result::SimplePayload;
use crate::row::TableRow;
use chrono::{DateTime, TimeZone, Utc};
use condb_core::{DbiConfig, L2CacheError};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use std::cell::Cell;
use std::path::{Path, PathBuf};

const DEFAULT_MAP_SIZE_MB: usize = 256;

/// A saved result as read back.
#[derive(Debug, Clone)]
pub struct L2Entry<R: TableRow> {
    pub saved_at: DateTime<Utc>,
    pub payloads: Vec<SimplePayload<R>>,
}

pub struct L2Cache {
    env: Env,
    db: Database<Bytes, Bytes>,
    dir: PathBuf,
    can_read: bool,
    can_write: bool,
    read_warned: Cell<bool>,
}

impl L2Cache {
    /// Open (creating if needed) the cache in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, can_read: bool, can_write: bool) -> Result<Self, L2CacheError> {
        std::fs::create_dir_all(&dir).map_err(|e| L2CacheError::Io(e.to_string()))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(DEFAULT_MAP_SIZE_MB * 1024 * 1024)
                .max_dbs(1)
                .open(dir.as_ref())
        }
        .map_err(|e| L2CacheError::Open(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| L2CacheError::Open(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?;

        tracing::debug!(dir = %dir.as_ref().display(), can_read, can_write, "Opened L2 cache");
        Ok(Self {
            env,
            db,
            dir: dir.as_ref().to_path_buf(),
            can_read,
            can_write,
            read_warned: Cell::new(false),
        })
    }

    /// The cache described by `config`, or `None` when it has no working
    /// directory or neither reads nor writes are enabled.
    pub fn from_config(config: &DbiConfig) -> Result<Option<Self>, L2CacheError> {
        let Some(dir) = config.l2_cache_dir.as_ref() else {
            return Ok(None);
        };
        if !config.can_read_l2() && !config.can_write_l2() {
            return Ok(None);
        }
        Self::open(dir, config.can_read_l2(), config.can_write_l2()).map(Some)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn can_read(&self) -> bool {
        self.can_read
    }

    pub fn can_write(&self) -> bool {
        self.can_write
    }

    pub fn key(table: &str, row: &str, name: &str) -> String {
        format!("{}_{}_{}", table, row, name)
    }

    /// Save the payloads of one result. Returns false when writing is
    /// disabled or there is nothing to save.
    pub fn save<R: TableRow>(
        &self,
        table: &str,
        name: &str,
        payloads: &[SimplePayload<R>],
    ) -> Result<bool, L2CacheError> {
        if !self.can_write || name.is_empty() || payloads.is_empty() {
            return Ok(false);
        }
        let key = Self::key(table, R::row_name(), name);

        let json = serde_json::to_vec(payloads).map_err(|e| L2CacheError::Serialization(e.to_string()))?;
        let mut value = Vec::with_capacity(8 + json.len());
        value.extend_from_slice(&Utc::now().timestamp_millis().to_le_bytes());
        value.extend_from_slice(&json);

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &value)
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?;

        let rows: usize = payloads.iter().map(|p| p.rows.len()).sum();
        tracing::info!(key = %key, rows, "Saved query result to L2 cache");
        Ok(true)
    }

    /// Read back a saved result, `None` when reading is disabled or nothing
    /// was saved under that name.
    pub fn restore<R: TableRow>(&self, table: &str, name: &str) -> Result<Option<L2Entry<R>>, L2CacheError> {
        if !self.can_read || name.is_empty() {
            return Ok(None);
        }
        let key = Self::key(table, R::row_name(), name);

        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?;
        let Some(bytes) = self
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?
        else {
            tracing::debug!(key = %key, "Nothing saved in L2 cache");
            return Ok(None);
        };

        if bytes.len() < 8 {
            return Err(L2CacheError::Deserialization(format!(
                "entry {} is {} bytes long",
                key,
                bytes.len()
            )));
        }
        let (stamp, json) = bytes.split_at(8);
        let mut millis = [0u8; 8];
        millis.copy_from_slice(stamp);
        let saved_at = Utc
            .timestamp_millis_opt(i64::from_le_bytes(millis))
            .single()
            .unwrap_or_else(Utc::now);
        let payloads: Vec<SimplePayload<R>> =
            serde_json::from_slice(json).map_err(|e| L2CacheError::Deserialization(e.to_string()))?;

        if !self.read_warned.replace(true) {
            tracing::warn!(
                dir = %self.dir.display(),
                "Reading from the L2 cache has been activated; use it for development, never for production"
            );
        }
        tracing::info!(key = %key, saved_at = %saved_at, "Restoring query result from L2 cache");
        Ok(Some(L2Entry { saved_at, payloads }))
    }

    /// Remove one saved result.
    pub fn remove(&self, table: &str, row: &str, name: &str) -> Result<bool, L2CacheError> {
        let key = Self::key(table, row, name);
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?;
        let removed = self
            .db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| L2CacheError::Transaction(e.to_string()))?;
        Ok(removed)
    }
}

impl std::fmt::Debug for L2Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L2Cache")
            .field("dir", &self.dir)
            .field("can_read", &self.can_read)
            .field("can_write", &self.can_write)
            .finish()
    }
}

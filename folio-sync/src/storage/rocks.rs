//! RocksDB-backed queue and snapshot store.
//!
//! Column families:
//! - `snapshots`: one `DocumentSnapshot` per document (bincode, LZ4 compressed),
//!   keyed by the 8-byte big-endian document id
//! - `queue`: `QueuedUpdate` records (bincode), keyed by
//!   `<doc_id:8 bytes BE><sequence:8 bytes BE>` so a prefix scan yields
//!   creation order
//!
//! The queue sequence is recovered from the highest stored key on open, so
//! ordering holds across restarts.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{
    decode_record, encode_record, now_millis, DocumentSnapshot, QueueStore, QueuedUpdate,
    SnapshotStore, StoreError,
};
use crate::document::DocumentId;

/// Column family names.
const CF_SNAPSHOTS: &str = "snapshots";
const CF_QUEUE: &str = "queue";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_QUEUE];

/// Queue key length: doc id + sequence.
const QUEUE_KEY_LEN: usize = 16;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_sync_data"),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable store for offline queues and document snapshots.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next queue sequence number
    sequence: AtomicU64,
    /// Serialises read-modify-write queue operations
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.config.path)
            .field("sequence", &self.sequence.load(Ordering::SeqCst))
            .finish()
    }
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);
        log::debug!(
            "Opened sync store at {} (next queue sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_QUEUE => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            _ => {}
        }

        opts
    }

    /// Highest queue sequence on disk + 1.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_QUEUE) else {
            return 0;
        };
        // Keys are prefixed by doc id, so the last key is not necessarily the
        // highest sequence; scan them all.
        db.iterator_cf(cf, IteratorMode::Start)
            .filter_map(Result::ok)
            .filter_map(|(key, _)| Self::queue_key_sequence(&key))
            .max()
            .map_or(0, |seq| seq + 1)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue_key(doc_id: DocumentId, sequence: u64) -> [u8; QUEUE_KEY_LEN] {
        let mut key = [0u8; QUEUE_KEY_LEN];
        key[..8].copy_from_slice(&doc_id.0.to_be_bytes());
        key[8..].copy_from_slice(&sequence.to_be_bytes());
        key
    }

    fn queue_key_sequence(key: &[u8]) -> Option<u64> {
        let bytes: [u8; 8] = key.get(8..QUEUE_KEY_LEN)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Walk one document's queue records in key order.
    fn scan_queue(
        &self,
        doc_id: DocumentId,
    ) -> Result<Vec<(Box<[u8]>, QueuedUpdate)>, StoreError> {
        let cf = self.cf(CF_QUEUE)?;
        let prefix = doc_id.0.to_be_bytes();
        let start = Self::queue_key(doc_id, 0);

        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != QUEUE_KEY_LEN || key[..8] != prefix {
                break;
            }
            out.push((key, decode_record::<QueuedUpdate>(&value)?));
        }
        Ok(out)
    }

    fn put_queued(&self, entry: &QueuedUpdate) -> Result<(), StoreError> {
        let cf = self.cf(CF_QUEUE)?;
        let key = Self::queue_key(entry.doc_id, entry.id);
        self.db
            .put_cf_opt(cf, key, encode_record(entry)?, &self.write_options())?;
        Ok(())
    }
}

impl QueueStore for RocksStore {
    fn append(&self, doc_id: DocumentId, payload: &[u8]) -> Result<QueuedUpdate, StoreError> {
        let _guard = self.lock();
        let entry = QueuedUpdate {
            id: self.sequence.fetch_add(1, Ordering::SeqCst),
            doc_id,
            payload: payload.to_vec(),
            created_at: now_millis(),
            retry_count: 0,
        };
        self.put_queued(&entry)?;
        Ok(entry)
    }

    fn read_all(&self, doc_id: DocumentId) -> Result<Vec<QueuedUpdate>, StoreError> {
        Ok(self
            .scan_queue(doc_id)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    fn delete(&self, doc_id: DocumentId, id: u64) -> Result<(), StoreError> {
        let _guard = self.lock();
        let cf = self.cf(CF_QUEUE)?;
        self.db
            .delete_cf_opt(cf, Self::queue_key(doc_id, id), &self.write_options())?;
        Ok(())
    }

    fn delete_all(&self, doc_id: DocumentId) -> Result<usize, StoreError> {
        let _guard = self.lock();
        let cf = self.cf(CF_QUEUE)?;
        let entries = self.scan_queue(doc_id)?;
        if entries.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::default();
        for (key, _) in &entries {
            batch.delete_cf(cf, key);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(entries.len())
    }

    fn increment_retry(&self, doc_id: DocumentId, id: u64) -> Result<u32, StoreError> {
        let _guard = self.lock();
        let cf = self.cf(CF_QUEUE)?;
        let bytes = self
            .db
            .get_cf(cf, Self::queue_key(doc_id, id))?
            .ok_or(StoreError::NotFound { doc_id, id })?;
        let mut entry: QueuedUpdate = decode_record(&bytes)?;
        entry.retry_count += 1;
        self.put_queued(&entry)?;
        Ok(entry.retry_count)
    }

    fn purge_exhausted(
        &self,
        doc_id: DocumentId,
        max_retries: u32,
    ) -> Result<Vec<QueuedUpdate>, StoreError> {
        let _guard = self.lock();
        let cf = self.cf(CF_QUEUE)?;
        let mut batch = WriteBatch::default();
        let mut purged = Vec::new();
        for (key, entry) in self.scan_queue(doc_id)? {
            if entry.retry_count > max_retries {
                batch.delete_cf(cf, &key);
                purged.push(entry);
            }
        }
        if !purged.is_empty() {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(purged)
    }
}

impl SnapshotStore for RocksStore {
    fn get(&self, doc_id: DocumentId) -> Result<Option<DocumentSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, doc_id.0.to_be_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                decode_record(&raw).map(Some)
            }
            None => Ok(None),
        }
    }

    fn get_raw(&self, doc_id: DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        Ok(self.db.get_cf(cf, doc_id.0.to_be_bytes())?)
    }

    fn upsert(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = lz4_flex::compress_prepend_size(&encode_record(snapshot)?);
        self.db.put_cf_opt(
            cf,
            snapshot.doc_id.0.to_be_bytes(),
            compressed,
            &self.write_options(),
        )?;
        Ok(())
    }

    fn delete(&self, doc_id: DocumentId) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        self.db
            .delete_cf_opt(cf, doc_id.0.to_be_bytes(), &self.write_options())?;
        Ok(())
    }
}

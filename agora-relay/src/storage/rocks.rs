//! RocksDB-backed durable event log.
//!
//! Column families:
//! - `events`: LZ4-compressed JSON room events, keyed by room then time
//! - `meta`: bookkeeping (the append sequence counter)
//!
//! Event key layout:
//! ```text
//! ┌────────────┬────────────┬─────────────┬─────────────┐
//! │ room len   │ room bytes │ time (ms)   │ sequence    │
//! │ 4 bytes BE │ variable   │ 8 bytes BE  │ 8 bytes BE  │
//! └────────────┴────────────┴─────────────┴─────────────┘
//! ```
//!
//! The length prefix keeps one room's keys contiguous, so a room's history
//! is a single forward prefix scan in time order. The sequence breaks ties
//! between events stamped in the same millisecond.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{DurableLog, LogError, MessageId};
use crate::protocol::RoomEvent;

const CF_EVENTS: &str = "events";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_EVENTS, CF_META];

const SEQUENCE_KEY: &[u8] = b"sequence";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("agora_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-supplied directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for LogError {
    fn from(e: rocksdb::Error) -> Self {
        LogError::Database(e.to_string())
    }
}

struct Inner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    sequence: AtomicU64,
    /// Held from sequence allocation until the batch commits, so the
    /// persisted counter only ever moves forward.
    write_lock: Mutex<()>,
}

/// Durable log over RocksDB.
///
/// Cheap to clone. Appends run on the blocking thread pool so the relay's
/// await on `append` never stalls the async workers.
#[derive(Clone)]
pub struct RocksEventLog {
    inner: Arc<Inner>,
}

impl RocksEventLog {
    /// Open (or create) the log at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, LogError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened event log at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                config,
                sequence: AtomicU64::new(sequence),
                write_lock: Mutex::new(()),
            }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_EVENTS => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, LogError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| LogError::Database(format!("Column family '{CF_META}' not found")))?;
        match db.get_cf(&cf, SEQUENCE_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            Some(bytes) => Err(LogError::Deserialization(format!(
                "sequence counter has {} bytes",
                bytes.len()
            ))),
            None => Ok(0),
        }
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Blocking append. Prefer the [`DurableLog`] impl from async code.
    pub fn append_blocking(&self, event: &RoomEvent) -> Result<MessageId, LogError> {
        self.inner.append(event)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// All stored events for `room`, oldest first. Blocking.
    pub fn load_room(&self, room: &str) -> Result<Vec<RoomEvent>, LogError> {
        self.load_room_since(room, 0)
    }

    /// Stored events for `room` with `time >= since_ms`, oldest first. Blocking.
    pub fn load_room_since(&self, room: &str, since_ms: u64) -> Result<Vec<RoomEvent>, LogError> {
        let inner = &self.inner;
        let cf = inner.cf(CF_EVENTS)?;
        let prefix = room_prefix(room);
        let start = event_key(room, since_ms, 0);

        let mut events = Vec::new();
        let iter = inner
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            events.push(decode_value(&value)?);
        }
        Ok(events)
    }

    /// Number of events appended over the log's lifetime.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), LogError> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }
}

impl Inner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LogError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LogError::Database(format!("Column family '{name}' not found")))
    }

    fn append(&self, event: &RoomEvent) -> Result<MessageId, LogError> {
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_meta = self.cf(CF_META)?;

        let id = Uuid::new_v4().to_string();
        let mut stored = event.clone();
        stored.message_id = Some(id.clone());

        let json = serde_json::to_vec(&stored).map_err(|e| LogError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| LogError::Database("append lock poisoned".into()))?;
        let seq = self.sequence.load(Ordering::SeqCst);
        let key = event_key(&event.room, event.time, seq);

        // Event and counter land in one batch.
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_events, &key, &compressed);
        batch.put_cf(&cf_meta, SEQUENCE_KEY, (seq + 1).to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        // Only a committed append advances the counter.
        self.sequence.store(seq + 1, Ordering::SeqCst);

        Ok(id)
    }
}

#[async_trait]
impl DurableLog for RocksEventLog {
    async fn append(&self, event: &RoomEvent) -> Result<MessageId, LogError> {
        let inner = self.inner.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || inner.append(&event))
            .await
            .map_err(|e| LogError::Task(e.to_string()))?
    }
}

fn room_prefix(room: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(4 + room.len());
    prefix.extend_from_slice(&(room.len() as u32).to_be_bytes());
    prefix.extend_from_slice(room.as_bytes());
    prefix
}

fn event_key(room: &str, time: u64, seq: u64) -> Vec<u8> {
    let mut key = room_prefix(room);
    key.extend_from_slice(&time.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decode_value(value: &[u8]) -> Result<RoomEvent, LogError> {
    let json = lz4_flex::decompress_size_prepended(value)
        .map_err(|e| LogError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| LogError::Deserialization(e.to_string()))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

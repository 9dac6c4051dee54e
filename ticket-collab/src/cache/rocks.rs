//! RocksDB-backed room cache.
//!
//! Column families:
//! - `rooms`   : full Yrs room state (LZ4 compressed), keyed by room id
//! - `metadata`: [`CacheMetadata`] (bincode), keyed by room id
//!
//! Snapshot and metadata are written in one `WriteBatch`, so a crash never
//! leaves metadata describing a snapshot that isn't there.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::LocalCache;
use crate::comment::{now_millis, RoomId};
use crate::config::CacheConfig;
use crate::error::CacheError;

const CF_ROOMS: &str = "rooms";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_METADATA];

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub room_id: String,
    /// Uncompressed snapshot size in bytes
    pub size: u64,
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch
    pub updated_at: u64,
    /// Number of snapshots written for this room
    pub writes: u64,
}

impl CacheMetadata {
    fn new(room_id: &RoomId) -> Self {
        Self {
            room_id: room_id.to_string(),
            size: 0,
            compressed_size: 0,
            updated_at: 0,
            writes: 0,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB room cache.
pub struct RocksCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
}

impl RocksCache {
    /// Open (or create) the cache at the configured path.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(3);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room cache at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &CacheConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 frames
            CF_ROOMS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Metadata of a cached room.
    pub fn metadata(&self, room_id: &RoomId) -> Result<Option<CacheMetadata>, CacheError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(CacheMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every room with a cached snapshot.
    pub fn list_rooms(&self) -> Result<Vec<RoomId>, CacheError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            match std::str::from_utf8(&key) {
                Ok(id) => rooms.push(RoomId::new(id)),
                Err(_) => log::warn!("Skipping non-utf8 cache key"),
            }
        }
        Ok(rooms)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), CacheError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CacheError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CacheError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl LocalCache for RocksCache {
    fn load(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>, CacheError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| CacheError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn persist(&self, room_id: &RoomId, state: &[u8]) -> Result<(), CacheError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(state);

        let mut meta = self
            .metadata(room_id)?
            .unwrap_or_else(|| CacheMetadata::new(room_id));
        meta.size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_millis();
        meta.writes += 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_rooms, room_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, room_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Cached room {room_id}: {} bytes ({} compressed)",
            meta.size,
            meta.compressed_size
        );
        Ok(())
    }

    fn remove(&self, room_id: &RoomId) -> Result<(), CacheError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_rooms, room_id.as_bytes());
        batch.delete_cf(cf_meta, room_id.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}

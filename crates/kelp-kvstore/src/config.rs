//! Typed configuration consumed at engine construction.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How much of the RocksDB statistics machinery to enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatisticsLevel {
    /// No statistics object; ticker stats are unavailable.
    Off,
    ExceptDetailedTimers,
    ExceptTimeForMutex,
    All,
}

/// Optional compaction-style optimization applied to a column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionOptimization {
    None,
    Level,
    Universal,
}

/// Engine configuration. One engine instance serves one shard; vBuckets are
/// assigned to shards by `vbid % max_shards`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KVStoreConfig {
    /// Root directory; each vBucket lives in `<db_name>/rocksdb.<vbid>/`.
    pub db_name: PathBuf,

    /// Number of vBucket slots in the handle map.
    pub max_vbuckets: u16,

    /// Total shard count across the bucket.
    pub max_shards: u16,

    /// This engine's shard id (0..max_shards).
    pub shard_id: u16,

    /// Low-priority background threads (compactions); 0 = available CPUs.
    pub low_pri_background_threads: usize,

    /// High-priority background threads (flushes); 0 = available CPUs.
    pub high_pri_background_threads: usize,

    /// Total block cache bytes, divided per shard; 0 disables the shared cache.
    pub block_cache_size: usize,

    pub statistics_level: StatisticsLevel,

    /// Memtable budget for the default column family; 0 keeps the RocksDB default.
    pub default_cf_mem_budget: usize,

    /// Memtable budget for the seqno column family; 0 keeps the RocksDB default.
    pub seqno_cf_mem_budget: usize,

    pub default_cf_compaction: CompactionOptimization,
    pub seqno_cf_compaction: CompactionOptimization,

    /// Extra `key=value;key=value` overlay applied to every column family.
    pub cf_options: String,

    /// Extra `key=value;key=value` overlay applied to block-based table options.
    pub bbt_options: String,
}

/// RocksDB's built-in default write buffer size, used for batch-split
/// accounting when no explicit memory budget is configured.
pub(crate) const ROCKSDB_DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Memtable size for the `_local` column family; its writes are tiny and
/// infrequent, so keep it at the RocksDB minimum.
pub(crate) const LOCAL_CF_WRITE_BUFFER_SIZE: usize = 64 * 1024;

impl Default for KVStoreConfig {
    fn default() -> Self {
        Self {
            db_name: PathBuf::from("data"),
            max_vbuckets: 1024,
            max_shards: 4,
            shard_id: 0,
            low_pri_background_threads: 0,
            high_pri_background_threads: 0,
            block_cache_size: 0,
            statistics_level: StatisticsLevel::Off,
            default_cf_mem_budget: 0,
            seqno_cf_mem_budget: 0,
            default_cf_compaction: CompactionOptimization::None,
            seqno_cf_compaction: CompactionOptimization::None,
            cf_options: String::new(),
            bbt_options: String::new(),
        }
    }
}

impl KVStoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_vbuckets == 0 {
            return Err(Error::ConfigInvalid("max_vbuckets must be > 0".into()));
        }
        if self.max_shards == 0 {
            return Err(Error::ConfigInvalid("max_shards must be > 0".into()));
        }
        if self.shard_id >= self.max_shards {
            return Err(Error::ConfigInvalid(format!(
                "shard_id ({}) must be < max_shards ({})",
                self.shard_id, self.max_shards
            )));
        }
        // Fail early rather than at first commit.
        parse_overlay(&self.cf_options, CF_OVERLAY_KEYS)?;
        parse_overlay(&self.bbt_options, BBT_OVERLAY_KEYS)?;
        Ok(())
    }

    /// Effective write buffer size of the default column family.
    pub(crate) fn default_cf_write_buffer(&self) -> usize {
        if self.default_cf_mem_budget > 0 {
            self.default_cf_mem_budget
        } else {
            ROCKSDB_DEFAULT_WRITE_BUFFER_SIZE
        }
    }

    /// Effective write buffer size of the seqno column family.
    pub(crate) fn seqno_cf_write_buffer(&self) -> usize {
        if self.seqno_cf_mem_budget > 0 {
            self.seqno_cf_mem_budget
        } else {
            ROCKSDB_DEFAULT_WRITE_BUFFER_SIZE
        }
    }

    /// Commit batches larger than this are split and flushed early so a
    /// single write batch cannot bloat the memtables of both data CFs.
    pub(crate) fn batch_split_limit(&self) -> usize {
        self.default_cf_write_buffer() + self.seqno_cf_write_buffer()
    }

    /// Block cache bytes for this shard.
    pub(crate) fn shard_block_cache_size(&self) -> usize {
        self.block_cache_size / self.max_shards as usize
    }

    pub(crate) fn background_threads(count: usize) -> i32 {
        let count = if count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            count
        };
        count.min(i32::MAX as usize) as i32
    }
}

const CF_OVERLAY_KEYS: &[&str] = &[
    "write_buffer_size",
    "max_write_buffer_number",
    "level0_file_num_compaction_trigger",
    "target_file_size_base",
];

const BBT_OVERLAY_KEYS: &[&str] = &[
    "block_size",
    "cache_index_and_filter_blocks",
    "bloom_bits_per_key",
];

/// Parses a `key=value;key=value` overlay string, validating keys against the
/// permitted vocabulary.
pub(crate) fn parse_overlay<'a>(
    overlay: &'a str,
    allowed: &[&str],
) -> Result<Vec<(&'a str, &'a str)>> {
    let mut pairs = Vec::new();
    for entry in overlay.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((key, value)) = entry.split_once('=') else {
            return Err(Error::ConfigInvalid(format!(
                "option entry '{entry}' is not key=value"
            )));
        };
        let (key, value) = (key.trim(), value.trim());
        if !allowed.contains(&key) {
            return Err(Error::ConfigInvalid(format!("unknown option key '{key}'")));
        }
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Applies the column-family overlay string on top of baseline options.
pub(crate) fn apply_cf_overlay(opts: &mut rocksdb::Options, overlay: &str) -> Result<()> {
    for (key, value) in parse_overlay(overlay, CF_OVERLAY_KEYS)? {
        match key {
            "write_buffer_size" => opts.set_write_buffer_size(parse_value(key, value)?),
            "max_write_buffer_number" => opts.set_max_write_buffer_number(parse_value(key, value)?),
            "level0_file_num_compaction_trigger" => {
                opts.set_level_zero_file_num_compaction_trigger(parse_value(key, value)?)
            }
            "target_file_size_base" => opts.set_target_file_size_base(parse_value(key, value)?),
            _ => unreachable!("key validated by parse_overlay"),
        }
    }
    Ok(())
}

/// Parsed block-based-table overlay, applied when each CF's table factory is
/// built (the factory also carries the shared block cache).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct BbtOverlay {
    pub block_size: Option<usize>,
    pub cache_index_and_filter_blocks: Option<bool>,
    pub bloom_bits_per_key: Option<f64>,
}

pub(crate) fn parse_bbt_overlay(overlay: &str) -> Result<BbtOverlay> {
    let mut out = BbtOverlay::default();
    for (key, value) in parse_overlay(overlay, BBT_OVERLAY_KEYS)? {
        match key {
            "block_size" => out.block_size = Some(parse_value(key, value)?),
            "cache_index_and_filter_blocks" => {
                out.cache_index_and_filter_blocks = Some(parse_value(key, value)?)
            }
            "bloom_bits_per_key" => out.bloom_bits_per_key = Some(parse_value(key, value)?),
            _ => unreachable!("key validated by parse_overlay"),
        }
    }
    Ok(out)
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid value '{value}' for '{key}'")))
}

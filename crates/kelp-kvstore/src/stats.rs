//! Engine statistics: named queries over the open databases plus the
//! engine-local counter block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kelp_observe::{Histogram, Meter};
use rocksdb::statistics::Ticker;
use rocksdb::{Cache, DB};

use crate::config::StatisticsLevel;
use crate::error::{Error, Result};
use crate::handle::StoreHandle;
use crate::kvstore::KVStore;

const SIZE_ALL_MEM_TABLES: &str = "rocksdb.size-all-mem-tables";
const TOTAL_SST_FILES_SIZE: &str = "rocksdb.total-sst-files-size";

/// Engine-local counters and latency histograms, updated on the hot paths.
pub(crate) struct EngineStats {
    pub io_num_write: AtomicU64,
    pub io_write_bytes: AtomicU64,
    pub set_failures: AtomicU64,
    pub del_failures: AtomicU64,
    pub docs_committed: AtomicU64,
    pub loaded_vbuckets: AtomicU64,
    pub high_seqno_mismatches: AtomicU64,

    pub commit_histo: Box<dyn Histogram>,
    pub save_docs_histo: Box<dyn Histogram>,
    pub snapshot_histo: Box<dyn Histogram>,
    pub batch_size_histo: Box<dyn Histogram>,
    pub write_time_histo: Box<dyn Histogram>,
    pub del_time_histo: Box<dyn Histogram>,
}

impl EngineStats {
    pub(crate) fn new(meter: &Arc<dyn Meter>) -> Self {
        Self {
            io_num_write: AtomicU64::new(0),
            io_write_bytes: AtomicU64::new(0),
            set_failures: AtomicU64::new(0),
            del_failures: AtomicU64::new(0),
            docs_committed: AtomicU64::new(0),
            loaded_vbuckets: AtomicU64::new(0),
            high_seqno_mismatches: AtomicU64::new(0),
            commit_histo: meter.histo("kvstore_commit_ms", &[], &[]),
            save_docs_histo: meter.histo("kvstore_batch_put_ms", &[], &[]),
            snapshot_histo: meter.histo("kvstore_snapshot_ms", &[], &[]),
            batch_size_histo: meter.histo("kvstore_commit_batch_docs", &[], &[]),
            write_time_histo: meter.histo("kvstore_set_latency_ms", &[], &[]),
            del_time_histo: meter.histo("kvstore_del_latency_ms", &[], &[]),
        }
    }

    fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            io_num_write: self.io_num_write.load(Ordering::Relaxed),
            io_write_bytes: self.io_write_bytes.load(Ordering::Relaxed),
            set_failures: self.set_failures.load(Ordering::Relaxed),
            del_failures: self.del_failures.load(Ordering::Relaxed),
            docs_committed: self.docs_committed.load(Ordering::Relaxed),
            loaded_vbuckets: self.loaded_vbuckets.load(Ordering::Relaxed),
            high_seqno_mismatches: self.high_seqno_mismatches.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine-local counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub io_num_write: u64,
    pub io_write_bytes: u64,
    pub set_failures: u64,
    pub del_failures: u64,
    /// Documents flushed by the most recent commit.
    pub docs_committed: u64,
    pub loaded_vbuckets: u64,
    pub high_seqno_mismatches: u64,
}

/// Capability report for the surrounding bucket orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageProperties {
    pub efficient_vb_dump: bool,
    pub efficient_vb_deletion: bool,
    pub persisted_deletion: bool,
    pub efficient_get: bool,
    pub concurrent_write_compact: bool,
}

#[derive(Debug, Clone, Copy)]
enum CfSelector {
    Default,
    Seqno,
    Local,
}

impl CfSelector {
    fn of<'a>(&self, handle: &'a StoreHandle) -> &'a rocksdb::ColumnFamily {
        match self {
            CfSelector::Default => handle.default_cf(),
            CfSelector::Seqno => handle.seqno_cf(),
            CfSelector::Local => handle.local_cf(),
        }
    }
}

impl KVStore {
    /// Looks up a named statistic. Walks the open-handles map under the map
    /// mutex so the queried databases cannot be destroyed mid-walk.
    pub fn get_stat(&self, name: &str) -> Result<u64> {
        match name {
            // Memory usage by category, aggregated across open vBuckets.
            "kMemTableTotal" => self.mem_usage_stat(name, |u| u.mem_table_total),
            "kMemTableUnFlushed" => self.mem_usage_stat(name, |u| u.mem_table_unflushed),
            "kTableReadersTotal" => self.mem_usage_stat(name, |u| u.mem_table_readers_total),
            "kCacheTotal" => self.mem_usage_stat(name, |u| u.cache_total),

            // Memtable size per column family.
            "default_kSizeAllMemTables" => {
                self.property_stat(CfSelector::Default, SIZE_ALL_MEM_TABLES)
            }
            "seqno_kSizeAllMemTables" => self.property_stat(CfSelector::Seqno, SIZE_ALL_MEM_TABLES),
            "local_kSizeAllMemTables" => self.property_stat(CfSelector::Local, SIZE_ALL_MEM_TABLES),

            // Disk usage per column family.
            "default_kTotalSstFilesSize" => {
                self.property_stat(CfSelector::Default, TOTAL_SST_FILES_SIZE)
            }
            "seqno_kTotalSstFilesSize" => {
                self.property_stat(CfSelector::Seqno, TOTAL_SST_FILES_SIZE)
            }
            "local_kTotalSstFilesSize" => {
                self.property_stat(CfSelector::Local, TOTAL_SST_FILES_SIZE)
            }

            // Block cache hit/miss tickers from the shared statistics object.
            "rocksdb.block.cache.hit" => self.ticker_stat(Ticker::BlockCacheHit),
            "rocksdb.block.cache.miss" => self.ticker_stat(Ticker::BlockCacheMiss),
            "rocksdb.block.cache.data.hit" => self.ticker_stat(Ticker::BlockCacheDataHit),
            "rocksdb.block.cache.data.miss" => self.ticker_stat(Ticker::BlockCacheDataMiss),
            "rocksdb.block.cache.index.hit" => self.ticker_stat(Ticker::BlockCacheIndexHit),
            "rocksdb.block.cache.index.miss" => self.ticker_stat(Ticker::BlockCacheIndexMiss),
            "rocksdb.block.cache.filter.hit" => self.ticker_stat(Ticker::BlockCacheFilterHit),
            "rocksdb.block.cache.filter.miss" => self.ticker_stat(Ticker::BlockCacheFilterMiss),

            _ => Err(Error::UnknownStat(name.into())),
        }
    }

    /// Point-in-time copy of the engine-local counters.
    pub fn engine_stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn storage_properties(&self) -> StorageProperties {
        StorageProperties {
            efficient_vb_dump: true,
            efficient_vb_deletion: true,
            // Tombstones are retained with no scheduled purge.
            persisted_deletion: false,
            efficient_get: true,
            concurrent_write_compact: true,
        }
    }

    fn mem_usage_stat(
        &self,
        name: &str,
        pick: fn(&rocksdb::perf::MemoryUsageStats) -> u64,
    ) -> Result<u64> {
        let map = self.vb_map.lock();
        let handles: Vec<&Arc<StoreHandle>> = map.iter().flatten().collect();
        if handles.is_empty() {
            return Err(Error::UnknownStat(format!("{name}: no open vbuckets")));
        }
        let dbs: Vec<&DB> = handles.iter().map(|h| h.db()).collect();
        let caches: Vec<&Cache> = self.block_cache.iter().collect();
        let usage = rocksdb::perf::get_memory_usage_stats(
            Some(dbs.as_slice()),
            if caches.is_empty() {
                None
            } else {
                Some(caches.as_slice())
            },
        )
        .map_err(Error::Read)?;
        Ok(pick(&usage))
    }

    fn property_stat(&self, cf: CfSelector, property: &str) -> Result<u64> {
        let map = self.vb_map.lock();
        let mut total = 0;
        for handle in map.iter().flatten() {
            if let Some(value) = handle
                .db()
                .property_int_value_cf(cf.of(handle), property)
                .map_err(Error::Read)?
            {
                total += value;
            }
        }
        Ok(total)
    }

    fn ticker_stat(&self, ticker: Ticker) -> Result<u64> {
        if self.config.statistics_level == StatisticsLevel::Off {
            return Err(Error::UnknownStat(
                "statistics are disabled by configuration".into(),
            ));
        }
        Ok(self.opts.lock().db.get_ticker_count(ticker))
    }
}

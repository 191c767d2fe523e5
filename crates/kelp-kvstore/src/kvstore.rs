//! The per-vBucket persistence engine.
//!
//! One `KVStore` instance serves one shard: it owns a map of lazily opened
//! per-vBucket RocksDB databases, batches transactional mutations into
//! durable atomic writes, serves point reads, and manages vBucket lifecycle
//! (delete, reset, state snapshots).
//!
//! Lock order: write mutex (`pending`) before map mutex (`vb_map`) before
//! options mutex (`opts`). Every path other than delete/reset takes at most
//! one of the first two.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use kelp_observe::{CommitEvt, CommitKind, Meter, NoopMeter, StoreEvent, VBucketEvt, VBucketKind};
use parking_lot::{Mutex, RwLock};
use rocksdb::{
    BlockBasedOptions, Cache, Env, ErrorKind, Options, WriteBatch, WriteOptions, DB,
};
use tracing::{debug, info, warn};

use crate::codec::{self, MetaData};
use crate::config::{
    apply_cf_overlay, parse_bbt_overlay, BbtOverlay, CompactionOptimization, KVStoreConfig,
    StatisticsLevel, LOCAL_CF_WRITE_BUFFER_SIZE,
};
use crate::error::{Error, Result};
use crate::handle::{discover_vbuckets, vb_db_subdir, StoreHandle, MANIFEST_KEY, VBSTATE_KEY};
use crate::item::{BgFetchItem, DocKey, GetMetaOnly, GetValue, Item, Vbid};
use crate::scan::PinnedSnapshot;
use crate::state::{VBStatePersist, VBucketState, VBucketStateKind};
use crate::stats::EngineStats;

/// Opaque caller context carried through a transaction and handed back to
/// completion callbacks.
pub type TxContext = Box<dyn Any + Send>;

/// Outcome of a flushed mutation, as reported to completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Success,
    /// The flush of a delete hit a non-existent document; the request is
    /// dropped from the flush queue.
    DocNotFound,
    /// The write failed; the caller re-queues the batch.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetResult {
    pub status: MutationStatus,
    /// Whether the set inserted a new record rather than updating one.
    /// Reported conservatively as `true`: distinguishing would cost a point
    /// read per request.
    pub inserted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelResult {
    pub status: MutationStatus,
    /// Whether the delete removed an existing record; conservatively `true`,
    /// see [`SetResult::inserted`].
    pub existed: bool,
}

pub type SetCallback = Box<dyn FnOnce(&mut (dyn Any + Send), SetResult) + Send>;
pub type DelCallback = Box<dyn FnOnce(&mut (dyn Any + Send), DelResult) + Send>;

enum MutationCallback {
    Set(SetCallback),
    Del(DelCallback),
}

/// A mutation buffered between `begin` and `commit`.
pub(crate) struct TxRequest {
    pub(crate) item: Item,
    pub(crate) meta: MetaData,
    callback: MutationCallback,
    enqueued_at: Instant,
}

impl TxRequest {
    fn new(item: Item, callback: MutationCallback) -> Self {
        // Deletions record the deletion wall-clock time in the exptime slot.
        let exptime = if item.deleted {
            wall_clock_secs()
        } else {
            item.exptime
        };
        let meta = MetaData::from_item(&item, exptime);
        Self {
            item,
            meta,
            callback,
            enqueued_at: Instant::now(),
        }
    }

    fn data_size(&self) -> u64 {
        (codec::META_SIZE + self.item.body.len() + self.item.key.len()) as u64
    }
}

/// RocksDB options shared by every vBucket database of this shard. The DB
/// options carry the shared statistics object, so ticker queries read
/// aggregates across all open databases.
pub(crate) struct EngineOptions {
    pub(crate) db: Options,
    pub(crate) default_cf: Options,
    pub(crate) seqno_cf: Options,
    pub(crate) local_cf: Options,
}

pub struct KVStore {
    pub(crate) config: KVStoreConfig,

    /// vbid -> open handle; doubles as the walk list for stats queries.
    pub(crate) vb_map: Mutex<Vec<Option<Arc<StoreHandle>>>>,
    pub(crate) cached_states: RwLock<Vec<Option<VBucketState>>>,

    /// Requests queued by the current transaction. The mutex guards only the
    /// swap with commit's local batch, never the I/O.
    pending: Mutex<Vec<TxRequest>>,
    in_transaction: AtomicBool,
    tx_ctx: Mutex<Option<TxContext>>,

    pub(crate) scan_counter: AtomicU64,
    pub(crate) scan_snapshots: Mutex<HashMap<u64, Arc<PinnedSnapshot>>>,

    pub(crate) stats: EngineStats,
    pub(crate) meter: Arc<dyn Meter>,

    // Declared after the handle maps so every database closes before the
    // options and shared cache are released.
    pub(crate) opts: Mutex<EngineOptions>,
    pub(crate) block_cache: Option<Cache>,
}

impl KVStore {
    /// Opens the engine: configures RocksDB, then discovers and opens every
    /// vBucket owned by this shard, caching its persisted state.
    pub fn open(config: KVStoreConfig) -> Result<Self> {
        Self::with_meter(config, Arc::new(NoopMeter))
    }

    pub fn with_meter(config: KVStoreConfig, meter: Arc<dyn Meter>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.db_name)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Background threads are per-environment, shared across all vBucket
        // databases of this shard.
        let mut env = Env::new().map_err(Error::Open)?;
        env.set_background_threads(KVStoreConfig::background_threads(
            config.low_pri_background_threads,
        ));
        env.set_high_priority_background_threads(KVStoreConfig::background_threads(
            config.high_pri_background_threads,
        ));
        db_opts.set_env(&env);

        // One statistics object serves every database opened with (clones
        // of) these options, so ticker counts aggregate across vBuckets.
        if let Some(level) = rocksdb_stats_level(config.statistics_level) {
            db_opts.enable_statistics();
            db_opts.set_statistics_level(level);
        }

        let block_cache = if config.block_cache_size > 0 {
            Some(Cache::new_lru_cache(config.shard_block_cache_size()))
        } else {
            None
        };

        let bbt_overlay = parse_bbt_overlay(&config.bbt_options)?;

        let mut default_cf = baseline_default_cf_options(&config);
        let mut seqno_cf = baseline_seqno_cf_options(&config);
        let mut local_cf = baseline_local_cf_options();
        // The read path is random point gets, so the default CF keeps bloom
        // filters per SST; lookups by seqno go through the comparator-ordered
        // index instead and carry no bloom by default.
        apply_user_cf_options(
            &mut default_cf,
            &config,
            &block_cache,
            &bbt_overlay,
            Some(10.0),
        )?;
        apply_user_cf_options(&mut seqno_cf, &config, &block_cache, &bbt_overlay, None)?;
        apply_user_cf_options(&mut local_cf, &config, &block_cache, &bbt_overlay, None)?;

        let store = Self {
            opts: Mutex::new(EngineOptions {
                db: db_opts,
                default_cf,
                seqno_cf,
                local_cf,
            }),
            block_cache,
            vb_map: Mutex::new(vec![None; config.max_vbuckets as usize]),
            cached_states: RwLock::new(vec![None; config.max_vbuckets as usize]),
            pending: Mutex::new(Vec::new()),
            in_transaction: AtomicBool::new(false),
            tx_ctx: Mutex::new(None),
            scan_counter: AtomicU64::new(0),
            scan_snapshots: Mutex::new(HashMap::new()),
            stats: EngineStats::new(&meter),
            meter,
            config,
        };

        let vbids = discover_vbuckets(
            &store.config.db_name,
            store.config.max_vbuckets,
            store.config.max_shards,
            store.config.shard_id,
        )?;
        for vbid in &vbids {
            let handle = store.open_db(*vbid)?;
            store.read_vb_state(&handle)?;
            store.stats.loaded_vbuckets.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            "opened shard {} of {} at {}: {} vbucket(s) recovered",
            store.config.shard_id,
            store.config.max_shards,
            store.config.db_name.display(),
            vbids.len()
        );

        Ok(store)
    }

    /// Returns the (shared) handle for `vbid`, opening the database lazily on
    /// first access.
    pub(crate) fn open_db(&self, vbid: Vbid) -> Result<Arc<StoreHandle>> {
        if vbid >= self.config.max_vbuckets {
            return Err(Error::ConfigInvalid(format!(
                "vb:{vbid} is beyond max_vbuckets ({})",
                self.config.max_vbuckets
            )));
        }

        let mut map = self.vb_map.lock();
        if let Some(handle) = &map[vbid as usize] {
            return Ok(handle.clone());
        }

        let (db_opts, default_cf, seqno_cf, local_cf) = {
            let opts = self.opts.lock();
            (
                opts.db.clone(),
                opts.default_cf.clone(),
                opts.seqno_cf.clone(),
                opts.local_cf.clone(),
            )
        };
        let path = vb_db_subdir(&self.config.db_name, vbid);
        let handle = Arc::new(StoreHandle::open(
            path, vbid, &db_opts, default_cf, seqno_cf, local_cf,
        )?);
        debug!("vb:{vbid} database opened");
        self.meter.emit(StoreEvent::VBucket(VBucketEvt {
            vbid,
            kind: VBucketKind::Opened,
        }));
        map[vbid as usize] = Some(handle.clone());
        Ok(handle)
    }

    /// Reads the persisted state of one vBucket into the cache, deriving the
    /// high seqno from the seqno index.
    pub(crate) fn read_vb_state(&self, handle: &StoreHandle) -> Result<VBucketState> {
        let vbid = handle.vbid();
        let high_seqno = handle.high_seqno()?;
        let state = match handle.read_vbstate_blob()? {
            Some(blob) => VBucketState::from_json(vbid, &blob, high_seqno),
            None => {
                info!("vb:{vbid} no state blob found, defaulting to dead");
                VBucketState::dead_with_high_seqno(high_seqno)
            }
        };
        self.cached_states.write()[vbid as usize] = Some(state.clone());
        Ok(state)
    }

    // ---- transactions ------------------------------------------------------

    /// Opens a transaction. Any queued `set`/`del` requests are flushed by
    /// the next `commit`.
    pub fn begin(&self, tx_ctx: TxContext) {
        *self.tx_ctx.lock() = Some(tx_ctx);
        self.in_transaction.store(true, Ordering::SeqCst);
    }

    /// Queues a set. All requests queued within one transaction must belong
    /// to the same vBucket.
    pub fn set(&self, item: Item, callback: SetCallback) -> Result<()> {
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Err(Error::NotInTransaction);
        }
        self.pending
            .lock()
            .push(TxRequest::new(item, MutationCallback::Set(callback)));
        Ok(())
    }

    /// Queues a delete. The record persists as a tombstone.
    pub fn del(&self, item: Item, callback: DelCallback) -> Result<()> {
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Err(Error::NotInTransaction);
        }
        let item = Item { deleted: true, ..item };
        self.pending
            .lock()
            .push(TxRequest::new(item, MutationCallback::Del(callback)));
        Ok(())
    }

    /// Flushes every queued request to disk in one atomic, durable batch per
    /// vBucket, together with the vBucket state blob and, when supplied, the
    /// opaque collections manifest.
    ///
    /// A commit outside a transaction, or with nothing queued, is a no-op
    /// success. On failure `in_transaction` stays true so the caller may
    /// retry or roll back.
    pub fn commit(&self, manifest: Option<&[u8]>) -> Result<()> {
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Ok(());
        }

        let commit_batch = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        if commit_batch.is_empty() {
            self.in_transaction.store(false, Ordering::SeqCst);
            *self.tx_ctx.lock() = None;
            return Ok(());
        }

        let vbid = commit_batch[0].item.vbid;
        let result = self.save_docs(vbid, manifest, &commit_batch);
        if let Err(e) = &result {
            warn!("vb:{vbid} commit failed: {e}");
        }
        self.commit_callbacks(&result, commit_batch);

        match result {
            Ok(()) => {
                self.in_transaction.store(false, Ordering::SeqCst);
                *self.tx_ctx.lock() = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Abandons the open transaction and clears the request buffer. The
    /// durable store is left unchanged.
    pub fn rollback(&self) {
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            self.pending.lock().clear();
            *self.tx_ctx.lock() = None;
        }
    }

    fn save_docs(&self, vbid: Vbid, manifest: Option<&[u8]>, requests: &[TxRequest]) -> Result<()> {
        let handle = self.open_db(vbid)?;

        // The state blob committed alongside the data must exist; a vBucket
        // that was never snapshotted reads back as the dead default.
        let state = match self.cached_states.read()[vbid as usize].clone() {
            Some(state) => state,
            None => self.read_vb_state(&handle)?,
        };

        let batch_limit = self.config.batch_split_limit();
        let mut batch = WriteBatch::default();
        let mut max_batch_seqno = 0i64;

        for request in requests {
            max_batch_seqno = max_batch_seqno.max(request.meta.by_seqno);
            self.add_request_to_batch(&handle, &mut batch, request);

            // Split oversized batches so one commit cannot bloat the data
            // memtables past their combined budget. The check is approximate:
            // the batch spans two column families with separate memtables.
            if batch.size_in_bytes() > batch_limit {
                let bytes = batch.size_in_bytes() as u64;
                self.write_and_time(&handle, std::mem::take(&mut batch))?;
                self.meter.emit(StoreEvent::Commit(CommitEvt {
                    vbid,
                    kind: CommitKind::BatchSplit { bytes },
                }));
            }
        }

        save_vbstate_to_batch(&handle, &state, &mut batch);
        if let Some(blob) = manifest {
            batch.put_cf(handle.local_cf(), MANIFEST_KEY, blob);
        }
        let flushed_bytes = batch.size_in_bytes() as u64;
        self.write_and_time(&handle, batch)?;

        self.stats.batch_size_histo.observe(requests.len() as f64);
        self.stats
            .docs_committed
            .store(requests.len() as u64, Ordering::Relaxed);
        self.meter.emit(StoreEvent::Commit(CommitEvt {
            vbid,
            kind: CommitKind::Flushed {
                docs: requests.len(),
                bytes: flushed_bytes,
            },
        }));

        // Read the high seqno back through the index and reconcile the cache.
        // A mismatch with the batch maximum is observable but not fatal.
        let persisted = handle.high_seqno()?;
        if persisted != max_batch_seqno {
            warn!(
                "vb:{vbid} high seqno on disk ({persisted}) does not match \
                 the batch maximum ({max_batch_seqno})"
            );
            self.stats
                .high_seqno_mismatches
                .fetch_add(1, Ordering::Relaxed);
            self.meter.emit(StoreEvent::Commit(CommitEvt {
                vbid,
                kind: CommitKind::HighSeqnoMismatch {
                    persisted,
                    expected: max_batch_seqno,
                },
            }));
        }
        if let Some(state) = self.cached_states.write()[vbid as usize].as_mut() {
            state.high_seqno = persisted;
        }

        Ok(())
    }

    fn add_request_to_batch(
        &self,
        handle: &StoreHandle,
        batch: &mut WriteBatch,
        request: &TxRequest,
    ) {
        let start = Instant::now();
        let record = codec::encode_record(&request.meta, &request.item.body);
        batch.put_cf(handle.default_cf(), request.item.key.data(), record);
        batch.put_cf(
            handle.seqno_cf(),
            codec::seqno_slice(request.meta.by_seqno),
            request.item.key.data(),
        );
        self.stats.save_docs_histo.observe(elapsed_ms(start));
    }

    fn write_and_time(&self, handle: &StoreHandle, batch: WriteBatch) -> Result<()> {
        let start = Instant::now();
        let result = handle.db().write_opt(batch, &durable_write_options());
        self.stats.commit_histo.observe(elapsed_ms(start));
        result.map_err(commit_error)
    }

    fn commit_callbacks(&self, result: &Result<()>, requests: Vec<TxRequest>) {
        let status = match result {
            Ok(()) => MutationStatus::Success,
            Err(Error::DocNotFound) => MutationStatus::DocNotFound,
            Err(_) => MutationStatus::Failed,
        };

        let mut ctx_guard = self.tx_ctx.lock();
        let Some(ctx) = ctx_guard.as_mut() else {
            return;
        };

        for request in requests {
            self.stats.io_num_write.fetch_add(1, Ordering::Relaxed);
            self.stats
                .io_write_bytes
                .fetch_add(request.data_size(), Ordering::Relaxed);
            let queued_ms = elapsed_ms(request.enqueued_at);

            match request.callback {
                MutationCallback::Set(cb) => {
                    if status == MutationStatus::Success {
                        self.stats.write_time_histo.observe(queued_ms);
                    } else {
                        self.stats.set_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    cb(
                        ctx.as_mut(),
                        SetResult {
                            status,
                            inserted: true,
                        },
                    );
                }
                MutationCallback::Del(cb) => {
                    if status == MutationStatus::Success {
                        self.stats.del_time_histo.observe(queued_ms);
                    } else {
                        self.stats.del_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    cb(
                        ctx.as_mut(),
                        DelResult {
                            status,
                            existed: true,
                        },
                    );
                }
            }
        }
    }

    // ---- reads -------------------------------------------------------------

    /// Point lookup. Tombstones read as [`Error::KeyNotFound`]; scans with
    /// [`crate::DocumentFilter::IncludeDeletes`] observe them instead.
    pub fn get(&self, key: &DocKey, vbid: Vbid) -> Result<GetValue> {
        self.get_with_header(key, vbid, GetMetaOnly::No)
    }

    /// Point lookup with optional body suppression.
    pub fn get_with_header(
        &self,
        key: &DocKey,
        vbid: Vbid,
        meta_only: GetMetaOnly,
    ) -> Result<GetValue> {
        let handle = self.open_db(vbid)?;
        let raw = handle
            .db()
            .get_pinned_cf(handle.default_cf(), key.data())
            .map_err(Error::Read)?
            .ok_or(Error::KeyNotFound)?;
        let value = make_get_value(vbid, key.clone(), &raw, meta_only)?;
        if value.item.deleted {
            return Err(Error::KeyNotFound);
        }
        Ok(value)
    }

    /// One independent lookup per queued fetch; results are filled in place.
    pub fn get_multi(&self, vbid: Vbid, fetches: &mut [BgFetchItem]) -> Result<()> {
        let handle = self.open_db(vbid)?;
        // TODO: gather keys and use batched_multi_get_cf_opt per batch.
        for fetch in fetches.iter_mut() {
            let result = match handle.db().get_pinned_cf(handle.default_cf(), fetch.key.data()) {
                Ok(Some(raw)) => {
                    make_get_value(vbid, fetch.key.clone(), &raw, fetch.meta_only).and_then(
                        |value| {
                            if value.item.deleted {
                                Err(Error::KeyNotFound)
                            } else {
                                Ok(value)
                            }
                        },
                    )
                }
                Ok(None) => Err(Error::KeyNotFound),
                Err(e) => Err(Error::Read(e)),
            };
            fetch.result = Some(result);
        }
        Ok(())
    }

    // ---- vBucket lifecycle -------------------------------------------------

    /// The cached state of every discovered or updated vBucket.
    pub fn list_persisted_vbuckets(&self) -> Vec<(Vbid, VBucketState)> {
        self.cached_states
            .read()
            .iter()
            .enumerate()
            .filter_map(|(vbid, state)| state.clone().map(|s| (vbid as Vbid, s)))
            .collect()
    }

    /// Merges a state update into the cache; returns whether the blob needs
    /// persisting.
    pub(crate) fn update_cached_vb_state(&self, vbid: Vbid, new_state: &VBucketState) -> bool {
        let mut states = self.cached_states.write();
        match states[vbid as usize].as_mut() {
            Some(cached) => cached.merge_from(new_state),
            None => {
                states[vbid as usize] = Some(new_state.clone());
                true
            }
        }
    }

    /// Updates the vBucket state and, depending on `persist`, writes the blob
    /// durably in a dedicated batch.
    pub fn snapshot_vbucket(
        &self,
        vbid: Vbid,
        state: &VBucketState,
        persist: VBStatePersist,
    ) -> Result<()> {
        let start = Instant::now();

        let needs_persist = self.update_cached_vb_state(vbid, state);
        if needs_persist
            && matches!(
                persist,
                VBStatePersist::PersistWithoutCommit | VBStatePersist::PersistWithCommit
            )
        {
            let handle = self.open_db(vbid)?;
            let merged = self.cached_states.read()[vbid as usize]
                .clone()
                .unwrap_or_else(|| state.clone());
            let mut batch = WriteBatch::default();
            save_vbstate_to_batch(&handle, &merged, &mut batch);
            handle
                .db()
                .write_opt(batch, &durable_write_options())
                .map_err(|e| {
                    warn!(
                        "vb:{vbid} snapshot failed writing state {}: {e}",
                        merged.state.as_str()
                    );
                    Error::WriteFailed(e)
                })?;
        }

        debug!("vb:{vbid} snapshotted state {}", state.state.as_str());
        self.stats.snapshot_histo.observe(elapsed_ms(start));
        Ok(())
    }

    /// Destroys a vBucket's on-disk files.
    ///
    /// The handle is swapped out of the map under the write and map mutexes,
    /// then this thread spins until it is the exclusive owner, so no reader,
    /// writer or scan still holds the database when destruction runs.
    pub fn delete_vbucket(&self, vbid: Vbid) -> Result<()> {
        // Write mutex before map mutex. Holding the write mutex keeps
        // commits out for the duration of the drain and destroy.
        let _write_guard = self.pending.lock();
        let handle = {
            let mut map = self.vb_map.lock();
            map.get_mut(vbid as usize).and_then(Option::take)
        };
        let Some(handle) = handle else {
            warn!("vb:{vbid} delete requested but database not open");
            return Ok(());
        };

        while Arc::strong_count(&handle) > 1 {
            std::thread::sleep(Duration::from_micros(100));
        }
        let path = handle.path().to_path_buf();
        drop(handle);

        let db_opts = self.opts.lock().db.clone();
        DB::destroy(&db_opts, &path)
            .map_err(|e| Error::DestroyFailed(format!("vb:{vbid} at {}: {e}", path.display())))?;
        info!("vb:{vbid} database destroyed");
        self.meter.emit(StoreEvent::VBucket(VBucketEvt {
            vbid,
            kind: VBucketKind::Deleted,
        }));
        Ok(())
    }

    /// Clears a vBucket's data without removing the vBucket: drain and
    /// destroy like delete, then reopen empty and persist the carried-over
    /// state with its sequence counters reset.
    pub fn reset_vbucket(&self, vbid: Vbid) -> Result<()> {
        {
            let _write_guard = self.pending.lock();
            let handle = {
                let mut map = self.vb_map.lock();
                map.get_mut(vbid as usize).and_then(Option::take)
            };
            if let Some(handle) = handle {
                while Arc::strong_count(&handle) > 1 {
                    std::thread::sleep(Duration::from_micros(100));
                }
                let path = handle.path().to_path_buf();
                drop(handle);
                let db_opts = self.opts.lock().db.clone();
                DB::destroy(&db_opts, &path).map_err(|e| {
                    Error::DestroyFailed(format!("vb:{vbid} at {}: {e}", path.display()))
                })?;
            }
        }

        let state = {
            let mut states = self.cached_states.write();
            let slot = &mut states[vbid as usize];
            let mut state = slot
                .clone()
                .unwrap_or_else(|| VBucketState::new(VBucketStateKind::Dead));
            state.high_seqno = 0;
            state.checkpoint_id = 0;
            state.max_deleted_seqno = 0;
            state.last_snap_start = 0;
            state.last_snap_end = 0;
            *slot = Some(state.clone());
            state
        };

        let handle = self.open_db(vbid)?;
        let mut batch = WriteBatch::default();
        save_vbstate_to_batch(&handle, &state, &mut batch);
        handle
            .db()
            .write_opt(batch, &durable_write_options())
            .map_err(Error::WriteFailed)?;

        info!("vb:{vbid} reset");
        self.meter.emit(StoreEvent::VBucket(VBucketEvt {
            vbid,
            kind: VBucketKind::Reset,
        }));
        Ok(())
    }

    /// The opaque collections manifest blob last committed for `vbid`.
    pub fn collections_manifest(&self, vbid: Vbid) -> Result<Option<Vec<u8>>> {
        let handle = self.open_db(vbid)?;
        handle.read_manifest_blob()
    }

    pub fn num_shards(&self) -> u16 {
        self.config.max_shards
    }

    pub fn config(&self) -> &KVStoreConfig {
        &self.config
    }
}

/// Decodes a stored record into a read result.
pub(crate) fn make_get_value(
    vbid: Vbid,
    key: DocKey,
    raw: &[u8],
    meta_only: GetMetaOnly,
) -> Result<GetValue> {
    let include_body = meta_only == GetMetaOnly::No;
    let (meta, body) = codec::split_record(raw, include_body)?;
    Ok(GetValue {
        item: Item {
            key,
            vbid,
            by_seqno: meta.by_seqno,
            rev_seqno: meta.rev_seqno,
            cas: meta.cas,
            flags: meta.flags,
            exptime: meta.exptime,
            datatype: meta.datatype,
            deleted: meta.deleted,
            body,
        },
        keys_only: false,
    })
}

fn save_vbstate_to_batch(handle: &StoreHandle, state: &VBucketState, batch: &mut WriteBatch) {
    batch.put_cf(handle.local_cf(), VBSTATE_KEY, state.to_json().as_bytes());
}

fn durable_write_options() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

/// Maps a batch-write failure onto the flush contract: not-found drops the
/// request, busy re-queues, anything else surfaces with the inner status.
fn commit_error(e: rocksdb::Error) -> Error {
    match e.kind() {
        ErrorKind::NotFound => Error::DocNotFound,
        ErrorKind::Busy | ErrorKind::TryAgain => Error::Busy,
        _ => Error::WriteFailed(e),
    }
}

fn rocksdb_stats_level(level: StatisticsLevel) -> Option<rocksdb::statistics::StatsLevel> {
    use rocksdb::statistics::StatsLevel as RocksLevel;
    match level {
        StatisticsLevel::Off => None,
        StatisticsLevel::ExceptDetailedTimers => Some(RocksLevel::ExceptDetailedTimers),
        StatisticsLevel::ExceptTimeForMutex => Some(RocksLevel::ExceptTimeForMutex),
        StatisticsLevel::All => Some(RocksLevel::All),
    }
}

fn baseline_default_cf_options(config: &KVStoreConfig) -> Options {
    let mut opts = Options::default();
    // The read path is random point gets by key.
    opts.optimize_for_point_lookup(1);
    if config.default_cf_mem_budget > 0 {
        opts.set_write_buffer_size(config.default_cf_mem_budget);
    }
    apply_compaction_optimization(
        &mut opts,
        config.default_cf_compaction,
        config.default_cf_write_buffer(),
    );
    opts
}

fn baseline_seqno_cf_options(config: &KVStoreConfig) -> Options {
    let mut opts = Options::default();
    // Keys are raw i64 seqnos; ordering must be numeric, not lexicographic.
    opts.set_comparator("vbid_seqno_comparator", Box::new(codec::compare_seqno_keys));
    if config.seqno_cf_mem_budget > 0 {
        opts.set_write_buffer_size(config.seqno_cf_mem_budget);
    }
    apply_compaction_optimization(
        &mut opts,
        config.seqno_cf_compaction,
        config.seqno_cf_write_buffer(),
    );
    opts
}

fn baseline_local_cf_options() -> Options {
    let mut opts = Options::default();
    opts.set_write_buffer_size(LOCAL_CF_WRITE_BUFFER_SIZE);
    opts
}

fn apply_compaction_optimization(
    opts: &mut Options,
    optimization: CompactionOptimization,
    memtable_budget: usize,
) {
    match optimization {
        CompactionOptimization::None => {}
        CompactionOptimization::Level => opts.optimize_level_style_compaction(memtable_budget),
        CompactionOptimization::Universal => {
            opts.optimize_universal_style_compaction(memtable_budget)
        }
    }
}

/// Overlays the user option string and installs the block-based table
/// factory carrying the shared block cache.
fn apply_user_cf_options(
    opts: &mut Options,
    config: &KVStoreConfig,
    block_cache: &Option<Cache>,
    bbt_overlay: &BbtOverlay,
    default_bloom_bits: Option<f64>,
) -> Result<()> {
    apply_cf_overlay(opts, &config.cf_options)?;

    let mut table = BlockBasedOptions::default();
    if let Some(bits) = bbt_overlay.bloom_bits_per_key.or(default_bloom_bits) {
        table.set_bloom_filter(bits, false);
    }
    if let Some(size) = bbt_overlay.block_size {
        table.set_block_size(size);
    }
    if let Some(cache_index) = bbt_overlay.cache_index_and_filter_blocks {
        table.set_cache_index_and_filter_blocks(cache_index);
    }
    if let Some(cache) = block_cache {
        table.set_block_cache(cache);
    }
    opts.set_block_based_table_factory(&table);
    Ok(())
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

fn wall_clock_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

//! Seqno-ordered scans over pinned snapshots.
//!
//! A scan walks the seqno column family of one vBucket from a start seqno to
//! the vBucket's high seqno as of scan open, under a snapshot pinned for the
//! scan's whole lifetime. Because the index accumulates one mapping per
//! overwrite and never purges the old ones, every hit is validated against
//! the record it points at: a mapping whose record now carries a newer seqno
//! is stale and skipped.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use kelp_observe::{ScanEvt, ScanKind, StoreEvent};
use rocksdb::ReadOptions;
use tracing::{debug, error};

use crate::codec;
use crate::error::Result;
use crate::handle::StoreHandle;
use crate::item::{DocKey, DocumentFilter, GetMetaOnly, GetValue, ValueFilter, Vbid};
use crate::kvstore::{make_get_value, KVStore};

/// Status a scan callback returns to steer the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Proceed with the next document.
    Continue,
    /// The document is already held by the consumer; skip the value callback
    /// but account the seqno as read.
    KeyExists,
    /// The consumer is out of memory; pause the scan. A paused scan resumes
    /// from the seqno after the last one read.
    NoMemory,
}

/// Key/seqno probe offered to the cache-lookup callback before the value is
/// fetched and decoded.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub key: DocKey,
    pub by_seqno: i64,
    pub vbid: Vbid,
}

/// Receives each emitted document.
pub trait ScanCallback: Send {
    fn on_value(&mut self, value: GetValue) -> CallbackStatus;
}

/// Consulted per document before emission; lets the consumer skip documents
/// it already holds.
pub trait CacheLookupCallback: Send {
    fn on_lookup(&mut self, lookup: &CacheLookup) -> CallbackStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// The scan ran to its max seqno.
    Success,
    /// A callback reported memory pressure; call `scan` again to resume.
    Again,
    /// The scan could not run: its snapshot is gone or a record in range
    /// could not be read or decoded.
    Failed,
}

/// A database snapshot pinned for the lifetime of one scan. The snapshot
/// borrows from the handle it was taken on, so the pair travels together and
/// the snapshot can never outlive (or be applied to) a different database.
#[ouroboros::self_referencing]
pub(crate) struct PinnedSnapshot {
    handle: Arc<StoreHandle>,
    #[borrows(handle)]
    #[covariant]
    snapshot: rocksdb::Snapshot<'this>,
}

// SAFETY: the snapshot is an immutable token into a thread-safe database,
// and the database it borrows is owned by the same struct via `Arc`.
unsafe impl Send for PinnedSnapshot {}
unsafe impl Sync for PinnedSnapshot {}

fn pin_snapshot(handle: Arc<StoreHandle>) -> PinnedSnapshot {
    PinnedSnapshotBuilder {
        handle,
        snapshot_builder: |handle| handle.db().snapshot(),
    }
    .build()
}

/// State of one in-flight scan. Exclusive to a single consumer; drop it via
/// [`KVStore::destroy_scan`] to release the pinned snapshot.
pub struct ScanContext {
    pub(crate) scan_id: u64,
    pub(crate) vbid: Vbid,
    pub(crate) start_seqno: i64,
    pub(crate) max_seqno: i64,
    pub(crate) last_read_seqno: i64,
    pub(crate) document_count: u64,
    pub(crate) doc_filter: DocumentFilter,
    pub(crate) val_filter: ValueFilter,
    pub(crate) callback: Box<dyn ScanCallback>,
    pub(crate) lookup: Box<dyn CacheLookupCallback>,
}

impl ScanContext {
    pub fn scan_id(&self) -> u64 {
        self.scan_id
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn start_seqno(&self) -> i64 {
        self.start_seqno
    }

    pub fn max_seqno(&self) -> i64 {
        self.max_seqno
    }

    pub fn last_read_seqno(&self) -> i64 {
        self.last_read_seqno
    }

    /// Approximate number of documents the scan will visit. The scan is
    /// inclusive at both ends, so this is the seqno difference plus one; it
    /// over-counts by the number of stale and filtered mappings in range.
    pub fn document_count(&self) -> u64 {
        self.document_count
    }
}

impl std::fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanContext")
            .field("scan_id", &self.scan_id)
            .field("vbid", &self.vbid)
            .field("start_seqno", &self.start_seqno)
            .field("max_seqno", &self.max_seqno)
            .field("last_read_seqno", &self.last_read_seqno)
            .finish()
    }
}

impl KVStore {
    /// Opens a scan: pins a snapshot of the vBucket's database and fixes the
    /// scan window at `start_seqno ..= current high seqno`.
    pub fn init_scan(
        &self,
        callback: Box<dyn ScanCallback>,
        lookup: Box<dyn CacheLookupCallback>,
        vbid: Vbid,
        start_seqno: i64,
        doc_filter: DocumentFilter,
        val_filter: ValueFilter,
    ) -> Result<ScanContext> {
        let scan_id = self.scan_counter.fetch_add(1, Ordering::SeqCst);
        let handle = self.open_db(vbid)?;

        let max_seqno = match self.cached_states.read()[vbid as usize].clone() {
            Some(state) => state.high_seqno,
            None => self.read_vb_state(&handle)?.high_seqno,
        };

        self.scan_snapshots
            .lock()
            .insert(scan_id, Arc::new(pin_snapshot(handle)));

        let document_count = if start_seqno > max_seqno {
            0
        } else {
            (max_seqno - start_seqno) as u64 + 1
        };

        debug!("vb:{vbid} scan {scan_id} opened for seqnos {start_seqno}..={max_seqno}");
        self.meter.emit(StoreEvent::Scan(ScanEvt {
            vbid,
            kind: ScanKind::Opened { scan_id },
        }));

        Ok(ScanContext {
            scan_id,
            vbid,
            start_seqno,
            max_seqno,
            last_read_seqno: 0,
            document_count,
            doc_filter,
            val_filter,
            callback,
            lookup,
        })
    }

    /// Runs (or resumes) a scan. Returns [`ScanStatus::Again`] when a
    /// callback reported memory pressure; the pinned snapshot guarantees the
    /// resumed scan observes the same totally ordered sequence.
    pub fn scan(&self, ctx: &mut ScanContext) -> ScanStatus {
        if ctx.last_read_seqno == ctx.max_seqno {
            return ScanStatus::Success;
        }

        let start_seqno = if ctx.last_read_seqno != 0 {
            ctx.last_read_seqno + 1
        } else {
            ctx.start_seqno
        };

        let Some(pinned) = self.scan_snapshots.lock().get(&ctx.scan_id).cloned() else {
            error!("vb:{} scan {} has no pinned snapshot", ctx.vbid, ctx.scan_id);
            return ScanStatus::Failed;
        };
        let handle = pinned.borrow_handle();
        let snapshot = pinned.borrow_snapshot();

        let meta_only = if ctx.val_filter == ValueFilter::KeysOnly {
            GetMetaOnly::Yes
        } else {
            GetMetaOnly::No
        };

        let mut iter_opts = ReadOptions::default();
        iter_opts.set_snapshot(snapshot);
        let mut get_opts = ReadOptions::default();
        get_opts.set_snapshot(snapshot);

        let mut it = handle.db().raw_iterator_cf_opt(handle.seqno_cf(), iter_opts);
        it.seek(codec::seqno_slice(start_seqno));

        while it.valid() {
            let Some(raw_key) = it.key() else { break };
            let seqno = match codec::numeric_seqno(raw_key) {
                Ok(seqno) => seqno,
                Err(e) => {
                    error!("vb:{} scan {}: {e}", ctx.vbid, ctx.scan_id);
                    return ScanStatus::Failed;
                }
            };
            if seqno > ctx.max_seqno {
                break;
            }
            let Some(key_bytes) = it.value() else { break };
            let key = DocKey::from_bytes(Bytes::copy_from_slice(key_bytes));

            let raw = match handle
                .db()
                .get_pinned_cf_opt(handle.default_cf(), key.data(), &get_opts)
            {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    // Stale mapping for a record that no longer exists.
                    it.next();
                    continue;
                }
                Err(e) => {
                    error!("vb:{} scan {} record read failed: {e}", ctx.vbid, ctx.scan_id);
                    return ScanStatus::Failed;
                }
            };

            let value = match make_get_value(ctx.vbid, key.clone(), &raw, meta_only) {
                Ok(value) => value,
                Err(e) => {
                    error!("vb:{} scan {} record decode failed: {e}", ctx.vbid, ctx.scan_id);
                    return ScanStatus::Failed;
                }
            };
            let by_seqno = value.item.by_seqno;

            if by_seqno > seqno {
                // Overwritten since this mapping was written; stale.
                it.next();
                continue;
            }
            if by_seqno < seqno {
                panic!(
                    "vb:{} seqno index entry {seqno} is newer than its record \
                     ({by_seqno}) within one snapshot",
                    ctx.vbid
                );
            }

            if ctx.doc_filter == DocumentFilter::NoDeletes && value.item.deleted {
                it.next();
                continue;
            }

            let probe = CacheLookup {
                key,
                by_seqno,
                vbid: ctx.vbid,
            };
            match ctx.lookup.on_lookup(&probe) {
                CallbackStatus::KeyExists => {
                    ctx.last_read_seqno = by_seqno;
                    it.next();
                    continue;
                }
                CallbackStatus::NoMemory => {
                    self.emit_scan_paused(ctx);
                    return ScanStatus::Again;
                }
                CallbackStatus::Continue => {}
            }

            let value = GetValue {
                keys_only: ctx.val_filter == ValueFilter::KeysOnly,
                ..value
            };
            if ctx.callback.on_value(value) == CallbackStatus::NoMemory {
                self.emit_scan_paused(ctx);
                return ScanStatus::Again;
            }

            ctx.last_read_seqno = by_seqno;
            it.next();
        }

        // The iterator status is asserted at end of scan; a failed iterator
        // means the snapshot itself cannot be trusted.
        if let Err(e) = it.status() {
            panic!("vb:{} scan {} iterator failed: {e}", ctx.vbid, ctx.scan_id);
        }
        ScanStatus::Success
    }

    /// Releases the scan's pinned snapshot (and its hold on the database).
    pub fn destroy_scan(&self, ctx: ScanContext) {
        self.scan_snapshots.lock().remove(&ctx.scan_id);
        debug!("vb:{} scan {} destroyed", ctx.vbid, ctx.scan_id);
        self.meter.emit(StoreEvent::Scan(ScanEvt {
            vbid: ctx.vbid,
            kind: ScanKind::Closed {
                scan_id: ctx.scan_id,
            },
        }));
    }

    fn emit_scan_paused(&self, ctx: &ScanContext) {
        debug!(
            "vb:{} scan {} paused at seqno {}",
            ctx.vbid, ctx.scan_id, ctx.last_read_seqno
        );
        self.meter.emit(StoreEvent::Scan(ScanEvt {
            vbid: ctx.vbid,
            kind: ScanKind::Paused {
                scan_id: ctx.scan_id,
                last_read_seqno: ctx.last_read_seqno,
            },
        }));
    }
}

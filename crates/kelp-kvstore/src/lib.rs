//! kelp-kvstore: the per-vBucket persistence engine.
//!
//! Durably stores document mutations keyed by an application key inside a
//! numbered vBucket partition, serves point reads, enumerates mutations in
//! seqno order for replication streams, and persists per-vBucket state
//! across restarts.
//!
//! Each vBucket is one RocksDB database with three column families:
//!
//! ```text
//! <db_name>/rocksdb.<vbid>/
//!   ├─ default            key -> metadata || body   (point-lookup tuned)
//!   ├─ vbid_seqno_to_key  seqno -> key              (numeric comparator)
//!   └─ _local             "vbstate", manifest       (small internal blobs)
//! ```
//!
//! Every commit updates the key-indexed and seqno-indexed families plus the
//! state blob in one atomic, durable write batch. Scans iterate the seqno
//! family under a snapshot pinned for the scan's lifetime, so a paused scan
//! resumes over the same totally ordered sequence. Store handles are shared;
//! destroying a vBucket drains them to exclusive ownership before touching
//! the filesystem.
//!
//! # Example
//!
//! ```no_run
//! use kelp_kvstore::{DocKey, Item, KVStore, KVStoreConfig};
//!
//! fn main() -> kelp_kvstore::Result<()> {
//!     let store = KVStore::open(KVStoreConfig::default())?;
//!
//!     store.begin(Box::new(()));
//!     let item = Item::new(DocKey::from_bytes("key"), 0, 1, "value").with_cas(100);
//!     store.set(item, Box::new(|_, _| {}))?;
//!     store.commit(None)?;
//!
//!     let value = store.get(&DocKey::from_bytes("key"), 0)?;
//!     assert_eq!(value.item.cas, 100);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod item;
pub mod kvstore;
pub mod scan;
pub mod state;
pub mod stats;

pub use config::{CompactionOptimization, KVStoreConfig, StatisticsLevel};
pub use error::{Error, Result};
pub use item::{
    BgFetchItem, DocKey, DocNamespace, DocumentFilter, GetMetaOnly, GetValue, Item, ValueFilter,
    Vbid,
};
pub use kvstore::{
    DelCallback, DelResult, KVStore, MutationStatus, SetCallback, SetResult, TxContext,
};
pub use scan::{
    CacheLookup, CacheLookupCallback, CallbackStatus, ScanCallback, ScanContext, ScanStatus,
};
pub use state::{
    VBStatePersist, VBucketState, VBucketStateKind, HLC_EPOCH_UNINITIALIZED,
};
pub use stats::{EngineStatsSnapshot, StorageProperties};

// Re-export the observability ABI so embedders can wire a meter without a
// direct dependency.
pub use kelp_observe::{Meter, NoopMeter};

//! The per-vBucket store handle: one RocksDB database plus its three column
//! families.
//!
//! Column-family handles are borrowed from the owning `DB` on demand, so they
//! cannot outlive it; the mandatory release order (CF handles first, database
//! last) is enforced by the borrow checker rather than by destructor
//! discipline.

use std::path::{Path, PathBuf};

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use tracing::warn;

use crate::codec::{numeric_seqno, seqno_slice};
use crate::error::{Error, Result};
use crate::item::Vbid;

/// Column family holding `key -> metadata || body`.
pub(crate) const DEFAULT_CF: &str = "default";
/// Column family holding `seqno -> key`, ordered by the numeric comparator.
pub(crate) const SEQNO_CF: &str = "vbid_seqno_to_key";
/// Column family holding small internal metadata.
pub(crate) const LOCAL_CF: &str = "_local";

/// Local-CF key of the vBucket state blob.
pub(crate) const VBSTATE_KEY: &[u8] = b"vbstate";
/// Local-CF key of the opaque collections manifest blob.
pub(crate) const MANIFEST_KEY: &[u8] = b"collections_manifest";

/// One open vBucket database. Shared among readers, writers and scans via
/// `Arc`; `delete_vbucket` waits for exclusive ownership before destroying
/// the on-disk files.
pub struct StoreHandle {
    db: DB,
    vbid: Vbid,
    path: PathBuf,
}

impl StoreHandle {
    pub(crate) fn open(
        path: PathBuf,
        vbid: Vbid,
        db_opts: &Options,
        default_cf_opts: Options,
        seqno_cf_opts: Options,
        local_cf_opts: Options,
    ) -> Result<Self> {
        let descriptors = vec![
            ColumnFamilyDescriptor::new(DEFAULT_CF, default_cf_opts),
            ColumnFamilyDescriptor::new(SEQNO_CF, seqno_cf_opts),
            ColumnFamilyDescriptor::new(LOCAL_CF, local_cf_opts),
        ];
        let db = DB::open_cf_descriptors(db_opts, &path, descriptors).map_err(Error::Open)?;
        for name in [DEFAULT_CF, SEQNO_CF, LOCAL_CF] {
            if db.cf_handle(name).is_none() {
                return Err(Error::ConfigInvalid(format!(
                    "column family '{name}' missing after open of vb:{vbid}"
                )));
            }
        }
        Ok(Self { db, vbid, path })
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn db(&self) -> &DB {
        &self.db
    }

    pub(crate) fn default_cf(&self) -> &ColumnFamily {
        self.cf(DEFAULT_CF)
    }

    pub(crate) fn seqno_cf(&self) -> &ColumnFamily {
        self.cf(SEQNO_CF)
    }

    pub(crate) fn local_cf(&self) -> &ColumnFamily {
        self.cf(LOCAL_CF)
    }

    fn cf(&self, name: &str) -> &ColumnFamily {
        // All three families are opened (and verified) in `open`.
        self.db
            .cf_handle(name)
            .expect("column family handles exist for the lifetime of the DB")
    }

    /// The highest seqno ever committed to this vBucket: seek backwards from
    /// the maximum key in the seqno index. Returns 0 for an empty index.
    pub(crate) fn high_seqno(&self) -> Result<i64> {
        let mut it = self.db.raw_iterator_cf(self.seqno_cf());
        it.seek_for_prev(seqno_slice(i64::MAX));
        if !it.valid() {
            it.status().map_err(Error::Read)?;
            return Ok(0);
        }
        let key = it
            .key()
            .ok_or_else(|| Error::CorruptIndex("valid iterator yielded no key".into()))?;
        numeric_seqno(key)
    }

    /// Reads the raw vBucket state blob, if any.
    pub(crate) fn read_vbstate_blob(&self) -> Result<Option<Vec<u8>>> {
        match self.db.get_cf(self.local_cf(), VBSTATE_KEY) {
            Ok(blob) => Ok(blob),
            Err(e) => Err(Error::Read(e)),
        }
    }

    /// Reads the raw collections manifest blob, if any.
    pub(crate) fn read_manifest_blob(&self) -> Result<Option<Vec<u8>>> {
        match self.db.get_cf(self.local_cf(), MANIFEST_KEY) {
            Ok(blob) => Ok(blob),
            Err(e) => Err(Error::Read(e)),
        }
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("vbid", &self.vbid)
            .field("path", &self.path)
            .finish()
    }
}

/// Subdirectory holding one vBucket's database.
pub(crate) fn vb_db_subdir(db_name: &Path, vbid: Vbid) -> PathBuf {
    db_name.join(format!("rocksdb.{vbid}"))
}

/// Enumerates the persistence directory for `rocksdb.<N>` entries and keeps
/// the vBuckets owned by this shard.
pub(crate) fn discover_vbuckets(
    db_name: &Path,
    max_vbuckets: u16,
    max_shards: u16,
    shard_id: u16,
) -> Result<Vec<Vbid>> {
    let mut vbids = Vec::new();
    for entry in std::fs::read_dir(db_name)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(suffix) = name.strip_prefix("rocksdb.") else {
            continue;
        };
        let Ok(vbid) = suffix.parse::<Vbid>() else {
            warn!(
                "ignoring entry '{name}' in {}: not a vbucket directory",
                db_name.display()
            );
            continue;
        };
        if vbid >= max_vbuckets {
            warn!("ignoring vb:{vbid}: beyond max_vbuckets ({max_vbuckets})");
            continue;
        }
        if vbid % max_shards == shard_id {
            vbids.push(vbid);
        }
    }
    vbids.sort_unstable();
    Ok(vbids)
}

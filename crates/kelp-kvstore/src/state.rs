//! Per-vBucket state: the JSON blob persisted under the `_local` column
//! family and the in-memory cache update rules.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::item::Vbid;

/// Sentinel for an HLC epoch seqno that has never been initialised.
pub const HLC_EPOCH_UNINITIALIZED: i64 = -1;

/// Membership state of a vBucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketStateKind {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VBucketStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VBucketStateKind::Active => "active",
            VBucketStateKind::Replica => "replica",
            VBucketStateKind::Pending => "pending",
            VBucketStateKind::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(VBucketStateKind::Active),
            "replica" => Some(VBucketStateKind::Replica),
            "pending" => Some(VBucketStateKind::Pending),
            "dead" => Some(VBucketStateKind::Dead),
            _ => None,
        }
    }
}

/// How `snapshot_vbucket` persists a state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBStatePersist {
    /// Update the in-memory cache only.
    CacheOnly,
    /// Queue the blob into a batch and write it without an explicit commit.
    PersistWithoutCommit,
    /// Write the blob and commit durably.
    PersistWithCommit,
}

/// The state blob kept per vBucket, persisted atomically with data commits.
#[derive(Debug, Clone, PartialEq)]
pub struct VBucketState {
    pub state: VBucketStateKind,
    pub checkpoint_id: u64,
    pub max_deleted_seqno: u64,
    pub high_seqno: i64,
    pub purge_seqno: u64,
    pub last_snap_start: u64,
    pub last_snap_end: u64,
    pub max_cas: u64,
    pub hlc_epoch_seqno: i64,
    pub might_contain_xattrs: bool,
    /// Opaque failover table, stored as nested JSON.
    pub failover_table: Option<Value>,
}

impl VBucketState {
    pub fn new(state: VBucketStateKind) -> Self {
        Self {
            state,
            checkpoint_id: 0,
            max_deleted_seqno: 0,
            high_seqno: 0,
            purge_seqno: 0,
            last_snap_start: 0,
            last_snap_end: 0,
            max_cas: 0,
            hlc_epoch_seqno: HLC_EPOCH_UNINITIALIZED,
            might_contain_xattrs: false,
            failover_table: None,
        }
    }

    /// The default a vBucket decays to when no blob exists or the blob is
    /// unparsable: dead, counters zeroed. The high seqno comes from the seqno
    /// index, not the blob, so it survives.
    pub fn dead_with_high_seqno(high_seqno: i64) -> Self {
        Self {
            high_seqno,
            ..Self::new(VBucketStateKind::Dead)
        }
    }

    /// Serializes the blob written under the `"vbstate"` local key. Numeric
    /// fields are encoded as decimal strings for compatibility with the
    /// historical on-disk format.
    pub fn to_json(&self) -> String {
        let mut obj = Map::new();
        obj.insert("state".into(), json!(self.state.as_str()));
        obj.insert("checkpoint_id".into(), json!(self.checkpoint_id.to_string()));
        obj.insert(
            "max_deleted_seqno".into(),
            json!(self.max_deleted_seqno.to_string()),
        );
        if let Some(failovers) = &self.failover_table {
            obj.insert("failover_table".into(), failovers.clone());
        }
        obj.insert("snap_start".into(), json!(self.last_snap_start.to_string()));
        obj.insert("snap_end".into(), json!(self.last_snap_end.to_string()));
        obj.insert("max_cas".into(), json!(self.max_cas.to_string()));
        obj.insert("hlc_epoch".into(), json!(self.hlc_epoch_seqno.to_string()));
        obj.insert(
            "might_contain_xattrs".into(),
            json!(self.might_contain_xattrs),
        );
        Value::Object(obj).to_string()
    }

    /// Parses a state blob read from disk. `high_seqno` is the value read
    /// back from the seqno index for this vBucket.
    ///
    /// Decay rules: missing `snap_start`/`snap_end` fall back to the high
    /// seqno, missing `max_cas` to 0, missing `hlc_epoch` to the
    /// uninitialised sentinel. A blob that cannot be parsed, or that lacks
    /// the mandatory `state`/`checkpoint_id`/`max_deleted_seqno` fields,
    /// decays to dead with zeroed counters.
    pub fn from_json(vbid: Vbid, blob: &[u8], high_seqno: i64) -> Self {
        let parsed: Value = match serde_json::from_slice(blob) {
            Ok(v) => v,
            Err(e) => {
                warn!("vb:{vbid} failed to parse vbstate blob: {e}");
                return Self::dead_with_high_seqno(high_seqno);
            }
        };

        let state_str = json_field_str(&parsed, "state");
        let checkpoint_id = json_field_u64(&parsed, "checkpoint_id");
        let max_deleted_seqno = json_field_u64(&parsed, "max_deleted_seqno");

        let (Some(state_str), Some(checkpoint_id), Some(max_deleted_seqno)) =
            (state_str, checkpoint_id, max_deleted_seqno)
        else {
            warn!(
                "vb:{vbid} vbstate blob is in the wrong format: {}",
                String::from_utf8_lossy(blob)
            );
            return Self::dead_with_high_seqno(high_seqno);
        };

        let state = VBucketStateKind::parse(state_str).unwrap_or_else(|| {
            warn!("vb:{vbid} unknown vbucket state '{state_str}', treating as dead");
            VBucketStateKind::Dead
        });

        Self {
            state,
            checkpoint_id,
            max_deleted_seqno,
            high_seqno,
            purge_seqno: 0,
            last_snap_start: json_field_u64(&parsed, "snap_start").unwrap_or(high_seqno as u64),
            last_snap_end: json_field_u64(&parsed, "snap_end").unwrap_or(high_seqno as u64),
            max_cas: json_field_u64(&parsed, "max_cas").unwrap_or(0),
            hlc_epoch_seqno: json_field_i64(&parsed, "hlc_epoch")
                .unwrap_or(HLC_EPOCH_UNINITIALIZED),
            might_contain_xattrs: parsed
                .get("might_contain_xattrs")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            failover_table: parsed.get("failover_table").cloned(),
        }
    }

    /// Merges `incoming` into `self` and reports whether the blob needs to be
    /// re-persisted (state, checkpoint id or failover table changed).
    ///
    /// The cached high seqno is authoritative for what has actually been
    /// committed; a stale caller snapshot never regresses it.
    pub fn merge_from(&mut self, incoming: &VBucketState) -> bool {
        let needs_persist = self.state != incoming.state
            || self.checkpoint_id != incoming.checkpoint_id
            || self.failover_table != incoming.failover_table;

        let high_seqno = self.high_seqno.max(incoming.high_seqno);
        *self = incoming.clone();
        self.high_seqno = high_seqno;
        needs_persist
    }
}

fn json_field_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

fn json_field_u64(v: &Value, key: &str) -> Option<u64> {
    json_field_str(v, key).and_then(|s| s.parse().ok())
}

fn json_field_i64(v: &Value, key: &str) -> Option<i64> {
    json_field_str(v, key).and_then(|s| s.parse().ok())
}

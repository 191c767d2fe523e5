//! Document model: keys, items and the filter enums used by reads and scans.

use bytes::Bytes;

/// vBucket identifier: a 16-bit partition of the keyspace.
pub type Vbid = u16;

/// Namespace tag carried by a document key.
///
/// The persisted key mapping stores raw key bytes only; the namespace travels
/// out of band with the key value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocNamespace {
    Default,
    Collections,
    System,
}

/// An opaque, immutable document key plus its namespace tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    namespace: DocNamespace,
    bytes: Bytes,
}

impl DocKey {
    pub fn new(namespace: DocNamespace, key: impl Into<Bytes>) -> Self {
        Self {
            namespace,
            bytes: key.into(),
        }
    }

    /// A key in the default namespace.
    pub fn from_bytes(key: impl Into<Bytes>) -> Self {
        Self::new(DocNamespace::Default, key)
    }

    pub fn namespace(&self) -> DocNamespace {
        self.namespace
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A document mutation (set or delete) to be persisted in a vBucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: DocKey,
    pub vbid: Vbid,
    pub by_seqno: i64,
    pub rev_seqno: u64,
    pub cas: u64,
    pub flags: u32,
    pub exptime: i64,
    pub datatype: u8,
    pub deleted: bool,
    pub body: Bytes,
}

impl Item {
    /// A live document carrying a body.
    pub fn new(key: DocKey, vbid: Vbid, by_seqno: i64, body: impl Into<Bytes>) -> Self {
        Self {
            key,
            vbid,
            by_seqno,
            rev_seqno: 0,
            cas: 0,
            flags: 0,
            exptime: 0,
            datatype: 0,
            deleted: false,
            body: body.into(),
        }
    }

    /// A deletion; the body is empty and the record persists as a tombstone.
    pub fn deletion(key: DocKey, vbid: Vbid, by_seqno: i64) -> Self {
        Self {
            deleted: true,
            ..Self::new(key, vbid, by_seqno, Bytes::new())
        }
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_rev_seqno(mut self, rev_seqno: u64) -> Self {
        self.rev_seqno = rev_seqno;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_exptime(mut self, exptime: i64) -> Self {
        self.exptime = exptime;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }
}

/// Result of a point read or a scan emission.
#[derive(Debug, Clone)]
pub struct GetValue {
    pub item: Item,
    /// True when the value filter suppressed the body.
    pub keys_only: bool,
}

/// One queued lookup of a multi-get; the result is filled in place.
#[derive(Debug)]
pub struct BgFetchItem {
    pub key: DocKey,
    pub meta_only: GetMetaOnly,
    pub result: Option<crate::error::Result<GetValue>>,
}

impl BgFetchItem {
    pub fn new(key: DocKey, meta_only: GetMetaOnly) -> Self {
        Self {
            key,
            meta_only,
            result: None,
        }
    }
}

/// Whether scans report deleted documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFilter {
    NoDeletes,
    IncludeDeletes,
}

/// Whether scans carry document bodies or keys/metadata only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFilter {
    KeysOnly,
    MetaAndValue,
}

/// Whether a point read should skip the body copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMetaOnly {
    Yes,
    No,
}

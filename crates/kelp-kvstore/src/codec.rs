//! On-disk codecs for document records and seqno index keys.
//!
//! Record format (default column family), little-endian fixed layout:
//! - flag byte: bit 0 = deleted, bits 1-7 = format version (currently 0)
//! - datatype: u8
//! - flags: u32
//! - value_size: u32
//! - exptime: i64
//! - cas: u64
//! - rev_seqno: u64
//! - by_seqno: i64
//! - body: bytes[value_size]
//!
//! The layout is byte-stable across platforms; `version` routes future
//! migrations on read.
//!
//! Seqno index keys (seqno column family) are the raw 8-byte representation
//! of an `i64`. The column family is opened with [`compare_seqno_keys`] as its
//! comparator, so ordering is numeric, never lexicographic.

use std::cmp::Ordering;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::item::Item;

/// Encoded size of [`MetaData`].
pub const META_SIZE: usize = 42;

/// Current metadata format version.
pub const META_VERSION: u8 = 0;

bitflags! {
    struct MetaByte: u8 {
        const DELETED = 0b0000_0001;
    }
}

/// Per-document metadata, persisted ahead of the body in every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaData {
    pub deleted: bool,
    pub version: u8,
    pub datatype: u8,
    pub flags: u32,
    pub value_size: u32,
    pub exptime: i64,
    pub cas: u64,
    pub rev_seqno: u64,
    pub by_seqno: i64,
}

impl MetaData {
    /// Metadata for a mutation request. `exptime` for deletions is the
    /// deletion wall-clock time, supplied by the caller.
    pub fn from_item(item: &Item, exptime: i64) -> Self {
        Self {
            deleted: item.deleted,
            version: META_VERSION,
            datatype: item.datatype,
            flags: item.flags,
            value_size: item.body.len() as u32,
            exptime,
            cas: item.cas,
            rev_seqno: item.rev_seqno,
            by_seqno: item.by_seqno,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut flag_byte = MetaByte::empty();
        if self.deleted {
            flag_byte |= MetaByte::DELETED;
        }
        buf.put_u8(flag_byte.bits() | (self.version << 1));
        buf.put_u8(self.datatype);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.value_size);
        buf.put_i64_le(self.exptime);
        buf.put_u64_le(self.cas);
        buf.put_u64_le(self.rev_seqno);
        buf.put_i64_le(self.by_seqno);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < META_SIZE {
            return Err(Error::Codec(format!(
                "record too short for metadata: {} < {}",
                data.len(),
                META_SIZE
            )));
        }
        let mut cursor = data;
        let flag_byte = cursor.get_u8();
        Ok(Self {
            deleted: MetaByte::from_bits_truncate(flag_byte).contains(MetaByte::DELETED),
            version: flag_byte >> 1,
            datatype: cursor.get_u8(),
            flags: cursor.get_u32_le(),
            value_size: cursor.get_u32_le(),
            exptime: cursor.get_i64_le(),
            cas: cursor.get_u64_le(),
            rev_seqno: cursor.get_u64_le(),
            by_seqno: cursor.get_i64_le(),
        })
    }
}

/// Encodes `metadata || body` as stored in the default column family.
pub fn encode_record(meta: &MetaData, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(META_SIZE + body.len());
    meta.encode_into(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

/// Splits a raw record into metadata and body. When `include_body` is false
/// the body copy is suppressed and empty bytes are returned in its place.
pub fn split_record(raw: &[u8], include_body: bool) -> Result<(MetaData, Bytes)> {
    let meta = MetaData::decode(raw)?;
    let body = &raw[META_SIZE..];
    if body.len() != meta.value_size as usize {
        return Err(Error::Codec(format!(
            "record body length {} does not match value_size {}",
            body.len(),
            meta.value_size
        )));
    }
    let body = if include_body && meta.value_size > 0 {
        Bytes::copy_from_slice(body)
    } else {
        Bytes::new()
    };
    Ok((meta, body))
}

/// The raw 8-byte key for the seqno column family.
pub fn seqno_slice(seqno: i64) -> [u8; 8] {
    seqno.to_ne_bytes()
}

/// Decodes a seqno column family key back to its numeric value.
pub fn numeric_seqno(slice: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = slice
        .try_into()
        .map_err(|_| Error::Codec(format!("seqno key has length {}, want 8", slice.len())))?;
    Ok(i64::from_ne_bytes(bytes))
}

/// Comparator installed on the seqno column family: reinterpret both slices
/// as `i64` and compare numerically. Malformed keys (never produced by this
/// crate) fall back to bytewise order to keep the comparator total.
pub fn compare_seqno_keys(a: &[u8], b: &[u8]) -> Ordering {
    match (
        <[u8; 8]>::try_from(a).map(i64::from_ne_bytes),
        <[u8; 8]>::try_from(b).map(i64::from_ne_bytes),
    ) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_meta_roundtrip(
            deleted in any::<bool>(),
            datatype in any::<u8>(),
            flags in any::<u32>(),
            value_size in any::<u32>(),
            exptime in any::<i64>(),
            cas in any::<u64>(),
            rev_seqno in any::<u64>(),
            by_seqno in any::<i64>(),
        ) {
            let meta = MetaData {
                deleted,
                version: META_VERSION,
                datatype,
                flags,
                value_size,
                exptime,
                cas,
                rev_seqno,
                by_seqno,
            };
            let mut buf = BytesMut::new();
            meta.encode_into(&mut buf);
            prop_assert_eq!(buf.len(), META_SIZE);
            prop_assert_eq!(MetaData::decode(&buf).unwrap(), meta);
        }

        #[test]
        fn prop_seqno_order_matches_numeric_order(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(
                compare_seqno_keys(&seqno_slice(a), &seqno_slice(b)),
                a.cmp(&b)
            );
        }
    }
}

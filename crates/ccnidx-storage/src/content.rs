//! Content-entry codec and interest matcher.
//!
//! Each leaf entry describes one stored content object. The key is the
//! object's full flatname, including the trailing digest component; the
//! payload is a fixed 64-byte [`ContentEntry`]. Matching an interest
//! against an entry uses only the key and this record, never the object.

use crate::btree::constants::{CONTENT_MAGIC, CONTENT_PAYLOAD_SIZE};
use crate::btree::Node;
use crate::exclude;
use crate::flatname::{self, FlatOrdering};
use ccnidx_common::{CcnxError, Result};
use std::ops::Range;

/// Size of a publisher key digest.
pub const PUBLISHER_DIGEST_SIZE: usize = 32;

/// Bytes of timestamp kept in an entry.
pub const TIMESTAMP_SIZE: usize = 6;

/// Entry flag: the object has been superseded and should not be served.
pub const STALE: u8 = 0x01;

/// Content type: data (0x0C04C0).
pub const CONTENT_TYPE_DATA: [u8; 3] = [0x0C, 0x04, 0xC0];
/// Content type: encrypted (0x10D091).
pub const CONTENT_TYPE_ENCR: [u8; 3] = [0x10, 0xD0, 0x91];
/// Content type: gone (0x18E344).
pub const CONTENT_TYPE_GONE: [u8; 3] = [0x18, 0xE3, 0x44];
/// Content type: key (0x28463F).
pub const CONTENT_TYPE_KEY: [u8; 3] = [0x28, 0x46, 0x3F];
/// Content type: link (0x2C834A).
pub const CONTENT_TYPE_LINK: [u8; 3] = [0x2C, 0x83, 0x4A];
/// Content type: nack (0x34008A).
pub const CONTENT_TYPE_NACK: [u8; 3] = [0x34, 0x00, 0x8A];

mod offsets {
    pub const CTYPE: usize = 1;
    pub const COBSZ: usize = 4;
    pub const NCOMP: usize = 8;
    pub const FLAGS: usize = 10;
    pub const TIMEX: usize = 12;
    pub const COBID: usize = 24;
    pub const DIGEST: usize = 32;
}

/// Leaf entry payload.
///
/// Layout (64 bytes):
/// - magic: 1 byte (0xC0)
/// - content_type: 3 bytes
/// - cobsz: 4 bytes (size of the object on the wire)
/// - ncomp: 2 bytes (name components, not counting the digest)
/// - flags: 1 byte
/// - reserved: 1 byte
/// - timestamp: 6 bytes (low-order bytes of the object's timestamp)
/// - reserved: 6 bytes
/// - cobid: 8 bytes
/// - publisher_digest: 32 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentEntry {
    pub content_type: [u8; 3],
    pub cobsz: u32,
    pub ncomp: u16,
    pub flags: u8,
    pub timestamp: [u8; TIMESTAMP_SIZE],
    pub cobid: u64,
    pub publisher_digest: [u8; PUBLISHER_DIGEST_SIZE],
}

impl ContentEntry {
    /// Size of the payload in bytes.
    pub const SIZE: usize = CONTENT_PAYLOAD_SIZE;

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = CONTENT_MAGIC;
        buf[offsets::CTYPE..offsets::CTYPE + 3].copy_from_slice(&self.content_type);
        buf[offsets::COBSZ..offsets::COBSZ + 4].copy_from_slice(&self.cobsz.to_le_bytes());
        buf[offsets::NCOMP..offsets::NCOMP + 2].copy_from_slice(&self.ncomp.to_le_bytes());
        buf[offsets::FLAGS] = self.flags;
        buf[offsets::TIMEX..offsets::TIMEX + TIMESTAMP_SIZE].copy_from_slice(&self.timestamp);
        buf[offsets::COBID..offsets::COBID + 8].copy_from_slice(&self.cobid.to_le_bytes());
        buf[offsets::DIGEST..].copy_from_slice(&self.publisher_digest);
        buf
    }

    /// Deserializes, returning None unless `buf` is a content payload.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE || buf[0] != CONTENT_MAGIC {
            return None;
        }
        let mut content_type = [0u8; 3];
        content_type.copy_from_slice(&buf[offsets::CTYPE..offsets::CTYPE + 3]);
        let mut timestamp = [0u8; TIMESTAMP_SIZE];
        timestamp.copy_from_slice(&buf[offsets::TIMEX..offsets::TIMEX + TIMESTAMP_SIZE]);
        let mut cobid = [0u8; 8];
        cobid.copy_from_slice(&buf[offsets::COBID..offsets::COBID + 8]);
        let mut publisher_digest = [0u8; PUBLISHER_DIGEST_SIZE];
        publisher_digest.copy_from_slice(&buf[offsets::DIGEST..offsets::DIGEST + 32]);
        Some(Self {
            content_type,
            cobsz: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ncomp: u16::from_le_bytes([buf[8], buf[9]]),
            flags: buf[offsets::FLAGS],
            timestamp,
            cobid: u64::from_le_bytes(cobid),
            publisher_digest,
        })
    }
}

/// Fields of a parsed content object, as byte ranges into its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedContentObject {
    /// Components in the object's name, not counting the digest.
    pub name_ncomps: usize,
    /// Content type code.
    pub content_type: [u8; 3],
    /// Timestamp bytes.
    pub timestamp: Range<usize>,
    /// Publisher public-key digest.
    pub publisher_digest: Range<usize>,
}

/// Fields of a parsed interest, as byte ranges into its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInterest {
    /// Number of leading name components that must match exactly.
    pub prefix_comps: usize,
    /// Minimum number of components beyond the prefix.
    pub min_suffix_comps: usize,
    /// Maximum number of components beyond the prefix.
    pub max_suffix_comps: usize,
    /// The `Name` element.
    pub name: Range<usize>,
    /// Required publisher key digest.
    pub publisher_digest: Option<Range<usize>>,
    /// The `Exclude` element.
    pub exclude: Option<Range<usize>>,
}

fn field<'a>(msg: &'a [u8], range: &Range<usize>, what: &str) -> Result<&'a [u8]> {
    msg.get(range.clone()).ok_or_else(|| {
        CcnxError::InvalidDescriptor(format!(
            "{} at {}..{} outside message of {} bytes",
            what,
            range.start,
            range.end,
            msg.len()
        ))
    })
}

fn digest_field<'a>(msg: &'a [u8], range: &Range<usize>) -> Result<&'a [u8]> {
    let digest = field(msg, range, "publisher digest")?;
    if digest.len() != PUBLISHER_DIGEST_SIZE {
        return Err(CcnxError::InvalidDescriptor(format!(
            "publisher digest of {} bytes",
            digest.len()
        )));
    }
    Ok(digest)
}

/// Builds the entry record for a content object.
pub fn build_entry(
    cobid: u64,
    cob: &[u8],
    parsed: &ParsedContentObject,
    flatname: &[u8],
) -> Result<ContentEntry> {
    let flat_comps = flatname::component_count(flatname)?;
    if flat_comps != parsed.name_ncomps + 1 {
        return Err(CcnxError::NameMismatch {
            flatname_comps: flat_comps,
            descriptor_comps: parsed.name_ncomps,
        });
    }
    let ncomp = u16::try_from(parsed.name_ncomps).map_err(|_| {
        CcnxError::InvalidDescriptor(format!("{} name components", parsed.name_ncomps))
    })?;
    let cobsz = u32::try_from(cob.len())
        .map_err(|_| CcnxError::InvalidDescriptor(format!("object of {} bytes", cob.len())))?;

    let ts = field(cob, &parsed.timestamp, "timestamp")?;
    let mut timestamp = [0u8; TIMESTAMP_SIZE];
    let keep = ts.len().min(TIMESTAMP_SIZE);
    timestamp[TIMESTAMP_SIZE - keep..].copy_from_slice(&ts[ts.len() - keep..]);

    let mut publisher_digest = [0u8; PUBLISHER_DIGEST_SIZE];
    publisher_digest.copy_from_slice(digest_field(cob, &parsed.publisher_digest)?);

    Ok(ContentEntry {
        content_type: parsed.content_type,
        cobsz,
        ncomp,
        flags: 0,
        timestamp,
        cobid,
        publisher_digest,
    })
}

/// Inserts a content entry at `index` of a leaf.
///
/// The flatname must have exactly one more component than the parsed name
/// (the digest).
pub fn insert_content(
    node: &mut Node,
    index: usize,
    cobid: u64,
    cob: &[u8],
    parsed: &ParsedContentObject,
    flatname: &[u8],
) -> Result<()> {
    let entry = build_entry(cobid, cob, parsed, flatname)?;
    node.insert_entry(index, flatname, &entry.to_bytes())
}

/// Decodes the entry record at `index`.
pub fn entry(node: &Node, index: usize) -> Result<ContentEntry> {
    let payload = node.payload(index)?;
    ContentEntry::from_bytes(payload).ok_or_else(|| CcnxError::NodeCorrupt {
        node_id: node.id().get(),
        reason: format!("entry {} is not a content record", index),
    })
}

/// Stored object id.
pub fn cobid(node: &Node, index: usize) -> Result<u64> {
    entry(node, index).map(|e| e.cobid)
}

/// Replaces the stored object id.
pub fn set_cobid(node: &mut Node, index: usize, cobid: u64) -> Result<()> {
    entry(node, index)?;
    node.update_payload(index, offsets::COBID, &cobid.to_le_bytes())
}

/// Stored object size.
pub fn cobsz(node: &Node, index: usize) -> Result<u32> {
    entry(node, index).map(|e| e.cobsz)
}

/// Entry flags.
pub fn flags(node: &Node, index: usize) -> Result<u8> {
    entry(node, index).map(|e| e.flags)
}

/// Replaces the entry flags.
pub fn set_flags(node: &mut Node, index: usize, flags: u8) -> Result<()> {
    entry(node, index)?;
    node.update_payload(index, offsets::FLAGS, &[flags])
}

/// Flattens the first `prefix_comps` components of an interest's name.
pub fn interest_prefix(
    dst: &mut Vec<u8>,
    interest: &[u8],
    parsed: &ParsedInterest,
) -> Result<()> {
    let name = field(interest, &parsed.name, "name")?;
    let got = flatname::from_wire_name(dst, name, 0, Some(parsed.prefix_comps))?;
    if got != parsed.prefix_comps {
        return Err(CcnxError::InvalidDescriptor(format!(
            "prefix of {} components but name has {}",
            parsed.prefix_comps, got
        )));
    }
    Ok(())
}

/// Tests entry `index` against an interest.
///
/// `scratch` is reused to hold the interest prefix and the entry key.
/// Checks run in order: name prefix, suffix component window, publisher
/// digest, exclusion of the component after the prefix.
pub fn match_interest(
    node: &Node,
    index: usize,
    interest: &[u8],
    parsed: &ParsedInterest,
    scratch: &mut Vec<u8>,
) -> Result<bool> {
    scratch.clear();
    interest_prefix(scratch, interest, parsed)?;
    let prefix_len = scratch.len();
    node.append_key(scratch, index)?;
    let (prefix, key) = scratch.split_at(prefix_len);
    if !flatname::compare(prefix, key).is_prefix() {
        return Ok(false);
    }

    let rec = entry(node, index)?;
    let ncomp = rec.ncomp as usize;
    let lo = parsed.prefix_comps.saturating_add(parsed.min_suffix_comps);
    let hi = parsed.prefix_comps.saturating_add(parsed.max_suffix_comps);
    if ncomp < lo || ncomp > hi {
        return Ok(false);
    }

    if let Some(range) = &parsed.publisher_digest {
        if digest_field(interest, range)? != rec.publisher_digest.as_slice() {
            return Ok(false);
        }
    }

    if let Some(range) = &parsed.exclude {
        let exclude_wire = field(interest, range, "exclude")?;
        if let Some(comp) = flatname::component_at(key, parsed.prefix_comps)? {
            if exclude::excluded(exclude_wire, comp)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Cheap check used while scanning: true once `key` no longer carries the
/// interest prefix.
pub fn past_prefix(prefix: &[u8], key: &[u8]) -> bool {
    !matches!(
        flatname::compare(prefix, key),
        FlatOrdering::Equal | FlatOrdering::StrictPrefix
    )
}

//! Fixed-size records of the node layout.
//!
//! Node buffer:
//! ```text
//! +---------------------------+ 0
//! | NodeHeader (8 bytes)      |
//! +---------------------------+ 8
//! | header extension          |  extsz * 8 bytes
//! +---------------------------+
//! | key region                |  grows forward, shared by all entries
//! +---------------------------+ len - n * E
//! | entry 0: payload, trailer |
//! | entry 1: payload, trailer |
//! | ...                       |
//! +---------------------------+ len
//! ```
//!
//! All entries of a node have the same size `E`, recorded in every trailer.
//! Multi-byte fields are little-endian.

use super::constants::{
    ENTRY_UNIT, INTERNAL_MAGIC, INTERNAL_PAYLOAD_SIZE, NODE_HEADER_SIZE, NODE_MAGIC,
    NODE_VERSION, TRAILER_SIZE,
};
use bytes::Bytes;
use ccnidx_common::{NodeId, NodeKind};

/// Node header.
///
/// Layout (8 bytes):
/// - magic: 4 bytes
/// - version: 1 byte
/// - kind: 1 byte (0, 'R' or 'S')
/// - level: 1 byte (0 = leaf)
/// - extsz: 1 byte (header extension in 8-byte units)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Format magic.
    pub magic: u32,
    /// Format version.
    pub version: u8,
    /// Raw node kind byte.
    pub kind: u8,
    /// Tree level.
    pub level: u8,
    /// Header extension size in units.
    pub extsz: u8,
}

impl NodeHeader {
    /// Size of the fixed header in bytes.
    pub const SIZE: usize = NODE_HEADER_SIZE;

    /// Creates a header for a fresh node.
    pub fn new(kind: NodeKind, level: u8, extsz: u8) -> Self {
        Self {
            magic: NODE_MAGIC,
            version: NODE_VERSION,
            kind: kind as u8,
            level,
            extsz,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4] = self.version;
        buf[5] = self.kind;
        buf[6] = self.level;
        buf[7] = self.extsz;
        buf
    }

    /// Deserializes from at least `SIZE` bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            magic: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            version: buf[4],
            kind: buf[5],
            level: buf[6],
            extsz: buf[7],
        }
    }

    /// Decoded node kind, if the byte is known.
    pub fn node_kind(&self) -> Option<NodeKind> {
        NodeKind::from_byte(self.kind)
    }

    /// Header size including the extension.
    pub fn total_size(&self) -> usize {
        Self::SIZE + self.extsz as usize * ENTRY_UNIT
    }

    /// Returns a description of the first problem found, if any.
    pub fn problem(&self) -> Option<String> {
        if self.magic != NODE_MAGIC {
            return Some(format!("bad magic {:#010x}", self.magic));
        }
        if self.version != NODE_VERSION {
            return Some(format!("unsupported version {}", self.version));
        }
        if self.node_kind().is_none() {
            return Some(format!("unknown node kind {:#04x}", self.kind));
        }
        None
    }
}

/// Per-entry trailer, stored at the end of each entry.
///
/// Layout (16 bytes):
/// - key_off0: 4 bytes, key_len0: 2 bytes (first key piece)
/// - key_off1: 4 bytes, key_len1: 2 bytes (second key piece)
/// - index: 2 bytes (entry index within the node)
/// - level: 1 byte
/// - units: 1 byte (entry size in 8-byte units)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryTrailer {
    pub key_off0: u32,
    pub key_len0: u16,
    pub key_off1: u32,
    pub key_len1: u16,
    pub index: u16,
    pub level: u8,
    pub units: u8,
}

impl EntryTrailer {
    /// Size of the trailer in bytes.
    pub const SIZE: usize = TRAILER_SIZE;

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.key_off0.to_le_bytes());
        buf[4..6].copy_from_slice(&self.key_len0.to_le_bytes());
        buf[6..10].copy_from_slice(&self.key_off1.to_le_bytes());
        buf[10..12].copy_from_slice(&self.key_len1.to_le_bytes());
        buf[12..14].copy_from_slice(&self.index.to_le_bytes());
        buf[14] = self.level;
        buf[15] = self.units;
        buf
    }

    /// Deserializes from at least `SIZE` bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            key_off0: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            key_len0: u16::from_le_bytes([buf[4], buf[5]]),
            key_off1: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            key_len1: u16::from_le_bytes([buf[10], buf[11]]),
            index: u16::from_le_bytes([buf[12], buf[13]]),
            level: buf[14],
            units: buf[15],
        }
    }

    /// Total entry size in bytes.
    #[inline]
    pub fn entry_size(&self) -> usize {
        self.units as usize * ENTRY_UNIT
    }

    /// Full key length.
    #[inline]
    pub fn key_len(&self) -> usize {
        self.key_len0 as usize + self.key_len1 as usize
    }

    /// True when piece 1 directly follows piece 0 in the key region.
    #[inline]
    pub fn contiguous(&self) -> bool {
        self.key_off1 as usize == self.key_off0 as usize + self.key_len0 as usize
    }
}

/// Payload of an internal-node entry.
///
/// Layout (8 bytes): magic 0xCC, 3 reserved bytes, child id (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalPayload {
    pub magic: u8,
    pub child: NodeId,
}

impl InternalPayload {
    /// Size of the payload in bytes.
    pub const SIZE: usize = INTERNAL_PAYLOAD_SIZE;

    /// Creates a payload pointing at `child`.
    pub fn new(child: NodeId) -> Self {
        Self {
            magic: INTERNAL_MAGIC,
            child,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.magic;
        buf[4..8].copy_from_slice(&self.child.get().to_le_bytes());
        buf
    }

    /// Deserializes from at least `SIZE` bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            magic: buf[0],
            child: NodeId(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]])),
        }
    }
}

/// An entry copied out of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// Full key.
    pub key: Bytes,
    /// Payload bytes (without the trailer).
    pub payload: Bytes,
}

impl NodeEntry {
    /// Bytes the entry occupies in a freshly built node.
    pub fn footprint(&self) -> usize {
        self.key.len() + self.payload.len() + TRAILER_SIZE
    }
}

/// Result of a key search within a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// Index of the matching entry, or of the first entry greater than the
    /// search key (equal to the entry count if none is greater).
    pub index: usize,
    /// True if the entry at `index` equals the search key.
    pub found: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_header_layout() {
        let header = NodeHeader::new(NodeKind::Root, 2, 1);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x78, 0xde, 0x3a, 0x05]);
        assert_eq!(bytes[4], NODE_VERSION);
        assert_eq!(bytes[5], b'R');
        assert_eq!(bytes[6], 2);
        assert_eq!(bytes[7], 1);
        assert_eq!(header.total_size(), 16);
        assert_eq!(NodeHeader::from_bytes(&bytes), header);
        assert!(header.problem().is_none());
    }

    #[test]
    fn test_node_header_problems() {
        let mut header = NodeHeader::new(NodeKind::Plain, 0, 0);
        header.magic = 0xdead_beef;
        assert!(header.problem().unwrap().contains("magic"));

        let mut header = NodeHeader::new(NodeKind::Plain, 0, 0);
        header.kind = b'X';
        assert!(header.problem().unwrap().contains("kind"));
    }

    #[test]
    fn test_entry_trailer_layout() {
        let trailer = EntryTrailer {
            key_off0: 8,
            key_len0: 5,
            key_off1: 40,
            key_len1: 3,
            index: 7,
            level: 1,
            units: 3,
        };
        let bytes = trailer.to_bytes();
        assert_eq!(&bytes[0..4], &8u32.to_le_bytes());
        assert_eq!(&bytes[12..14], &7u16.to_le_bytes());
        assert_eq!(bytes[15], 3);
        let decoded = EntryTrailer::from_bytes(&bytes);
        assert_eq!(decoded, trailer);
        assert_eq!(decoded.entry_size(), 24);
        assert_eq!(decoded.key_len(), 8);
        assert!(!decoded.contiguous());
    }

    #[test]
    fn test_internal_payload() {
        let payload = InternalPayload::new(NodeId(513));
        let bytes = payload.to_bytes();
        assert_eq!(bytes[0], INTERNAL_MAGIC);
        assert_eq!(&bytes[1..4], &[0, 0, 0]);
        assert_eq!(InternalPayload::from_bytes(&bytes).child, NodeId(513));
    }
}

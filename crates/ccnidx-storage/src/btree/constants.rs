//! Node layout constants.

/// Magic number at the start of every node header.
pub const NODE_MAGIC: u32 = 0x053a_de78;

/// Node format version.
pub const NODE_VERSION: u8 = 1;

/// Fixed node header size in bytes.
pub const NODE_HEADER_SIZE: usize = 8;

/// Per-entry trailer size in bytes.
pub const TRAILER_SIZE: usize = 16;

/// Entry sizes and header extensions are counted in units of this many bytes.
pub const ENTRY_UNIT: usize = 8;

/// Largest entry (payload plus trailer) a node can describe.
pub const MAX_ENTRY_SIZE: usize = u8::MAX as usize * ENTRY_UNIT;

/// Largest header extension.
pub const MAX_HEADER_EXT: usize = u8::MAX as usize * ENTRY_UNIT;

/// First payload byte of an internal-node entry.
pub const INTERNAL_MAGIC: u8 = 0xCC;

/// Payload size of an internal-node entry.
pub const INTERNAL_PAYLOAD_SIZE: usize = 8;

/// First payload byte of a leaf (content) entry.
pub const CONTENT_MAGIC: u8 = 0xC0;

/// Payload size of a leaf (content) entry.
pub const CONTENT_PAYLOAD_SIZE: usize = 64;

/// Byte usage below `threshold / UNDERFULL_DIVISOR` makes a node a spill
/// candidate.
pub const UNDERFULL_DIVISOR: usize = 4;

//! Node identity types for the ccnidx B-tree.

use serde::{Deserialize, Serialize};

/// Identifier of a B-tree node.
///
/// Ids start at 1 and increase monotonically; they are never reused while
/// the tree exists. Id 0 is reserved as "no node".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sentinel meaning "no node".
    pub const NONE: NodeId = NodeId(0);

    /// The root node always has id 1.
    pub const ROOT: NodeId = NodeId(1);

    /// Creates a new NodeId.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// Returns true unless this is the NONE sentinel.
    pub fn is_some(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Kind of node recorded in the node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeKind {
    /// Ordinary node.
    Plain = 0,
    /// The tree root.
    Root = b'R',
    /// Backup copy of the root.
    BackupRoot = b'S',
}

impl NodeKind {
    /// Decodes a header byte. Returns None for unknown kinds.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(NodeKind::Plain),
            b'R' => Some(NodeKind::Root),
            b'S' => Some(NodeKind::BackupRoot),
            _ => None,
        }
    }
}

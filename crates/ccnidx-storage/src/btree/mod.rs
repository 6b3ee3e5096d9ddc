//! B-tree over flatname keys.
//!
//! Nodes are variable-sized byte buffers:
//!
//! ```text
//! +--------------------+ 0
//! | header (8 bytes)   |
//! | header extension   |
//! +--------------------+
//! | key region         |  shared key bytes, append-only
//! +--------------------+
//! | entry 0            |  payload ++ 16-byte trailer
//! | entry 1            |
//! | ...                |
//! +--------------------+ end
//! ```
//!
//! Every entry in a node has the same size, so the entry count follows from
//! the last trailer. Leaves carry content entries; internal nodes carry child
//! pointers keyed by a lower bound of each child's keys.

pub mod constants;
mod node;
mod tree;
pub mod types;

pub use node::{IoHandle, Node};
pub use tree::{Lookup, MatchHit, Tree, TreeCheck, TreeStats};
pub use types::{EntryTrailer, InternalPayload, NodeEntry, NodeHeader, SearchResult};

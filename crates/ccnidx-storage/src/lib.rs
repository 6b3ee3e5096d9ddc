//! Storage engine for the ccnidx content index.
//!
//! This crate provides:
//! - Flatname key encoding and ccnb wire helpers for names and exclusions
//! - Bloom filters as carried in interest exclusions
//! - The node byte layout and a persistent B-tree over flatname keys
//! - Content entries and interest matching against them
//! - File-per-node storage guarded by a directory lock file

pub mod bloom;
pub mod btree;
pub mod content;
mod disk;
pub mod exclude;
pub mod flatname;
mod lock;
mod store;
pub mod wire;

pub use btree::{
    EntryTrailer, InternalPayload, IoHandle, Lookup, MatchHit, Node, NodeEntry, NodeHeader,
    SearchResult, Tree, TreeCheck, TreeStats,
};
pub use content::{ContentEntry, ParsedContentObject, ParsedInterest};
pub use disk::{FileNodeStore, MAX_NODE_ID_FILE};
pub use flatname::FlatOrdering;
pub use lock::{LOCK_FILE_NAME, LockFile, process_alive};
pub use store::{MemNodeStore, NodeStore};

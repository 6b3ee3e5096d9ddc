//! Residency management for ccnidx.
//!
//! This crate provides:
//! - A resident node table mapping node ids to live node records
//! - An activity-based replacement policy used to pick nodes to close
//!   under file-descriptor pressure and to evict under the resident budget

mod node_table;
mod replacer;

pub use node_table::NodeTable;
pub use replacer::{ActivityReplacer, Replacer};

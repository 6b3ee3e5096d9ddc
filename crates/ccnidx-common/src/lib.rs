//! ccnidx common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all ccnidx components.

pub mod config;
pub mod error;
pub mod node;

pub use config::{IndexConfig, StorageConfig, TreeConfig};
pub use error::{CcnxError, Result};
pub use node::{NodeId, NodeKind};

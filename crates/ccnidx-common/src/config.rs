//! Configuration structures for ccnidx.

use crate::error::{CcnxError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the node store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding node files, `maxnodeid` and the lock file.
    pub data_dir: PathBuf,
    /// Enable fsync after node writes.
    pub fsync_enabled: bool,
    /// Hard limit on simultaneously open node files.
    pub max_open_files: usize,
    /// Attempts made to acquire (or break a stale) lock file.
    pub lock_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
            max_open_files: 64,
            lock_attempts: 3,
        }
    }
}

/// Size tunables for the B-tree engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Maximum bytes in an internal node before a split is required.
    pub full: usize,
    /// Maximum bytes in a leaf node before a split is required.
    pub full0: usize,
    /// Hard cap on any node buffer.
    pub node_bytes_budget: usize,
    /// Number of nodes kept resident before idle eviction kicks in.
    pub resident_node_budget: usize,
    /// Open handle count above which least-active nodes are closed.
    pub idle_close_threshold: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            full: 4096,
            full0: 4096,
            node_bytes_budget: 16384,
            resident_node_budget: 4096,
            idle_close_threshold: 48,
        }
    }
}

impl TreeConfig {
    /// Returns the split threshold for a node at the given level.
    pub fn threshold(&self, level: u8) -> usize {
        if level == 0 { self.full0 } else { self.full }
    }
}

/// Top-level configuration combining storage and tree tunables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Storage layer settings.
    pub storage: StorageConfig,
    /// B-tree engine settings.
    pub tree: TreeConfig,
}

impl IndexConfig {
    /// Checks the tunables for consistency.
    pub fn validate(&self) -> Result<()> {
        let tree = &self.tree;
        if tree.full == 0 || tree.full0 == 0 {
            return Err(CcnxError::ConfigError(
                "split thresholds must be non-zero".to_string(),
            ));
        }
        if tree.full > tree.node_bytes_budget || tree.full0 > tree.node_bytes_budget {
            return Err(CcnxError::ConfigError(format!(
                "split thresholds ({}, {}) exceed node byte budget {}",
                tree.full, tree.full0, tree.node_bytes_budget
            )));
        }
        if tree.resident_node_budget == 0 {
            return Err(CcnxError::ConfigError(
                "resident node budget must be non-zero".to_string(),
            ));
        }
        if self.storage.max_open_files == 0 {
            return Err(CcnxError::ConfigError(
                "max_open_files must be non-zero".to_string(),
            ));
        }
        if tree.idle_close_threshold > self.storage.max_open_files {
            return Err(CcnxError::ConfigError(format!(
                "idle_close_threshold {} exceeds max_open_files {}",
                tree.idle_close_threshold, self.storage.max_open_files
            )));
        }
        if self.storage.lock_attempts == 0 {
            return Err(CcnxError::ConfigError(
                "lock_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert!(config.fsync_enabled);
        assert_eq!(config.max_open_files, 64);
        assert_eq!(config.lock_attempts, 3);
    }

    #[test]
    fn test_tree_config_defaults() {
        let config = TreeConfig::default();
        assert_eq!(config.full, 4096);
        assert_eq!(config.full0, 4096);
        assert_eq!(config.node_bytes_budget, 16384);
        assert_eq!(config.resident_node_budget, 4096);
        assert_eq!(config.idle_close_threshold, 48);
    }

    #[test]
    fn test_tree_config_threshold() {
        let config = TreeConfig {
            full: 2000,
            full0: 3000,
            ..Default::default()
        };
        assert_eq!(config.threshold(0), 3000);
        assert_eq!(config.threshold(1), 2000);
        assert_eq!(config.threshold(5), 2000);
    }

    #[test]
    fn test_default_config_validates() {
        IndexConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = IndexConfig::default();
        config.tree.full0 = 0;
        assert!(matches!(config.validate(), Err(CcnxError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_threshold_over_budget() {
        let mut config = IndexConfig::default();
        config.tree.full = config.tree.node_bytes_budget + 1;
        assert!(matches!(config.validate(), Err(CcnxError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_idle_threshold_over_limit() {
        let mut config = IndexConfig::default();
        config.tree.idle_close_threshold = config.storage.max_open_files + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("idle_close_threshold"));
    }

    #[test]
    fn test_index_config_serde_roundtrip() {
        let original = IndexConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: IndexConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.storage.data_dir, deserialized.storage.data_dir);
        assert_eq!(
            original.storage.max_open_files,
            deserialized.storage.max_open_files
        );
        assert_eq!(original.tree.full, deserialized.tree.full);
        assert_eq!(
            original.tree.resident_node_budget,
            deserialized.tree.resident_node_budget
        );
    }

    #[test]
    fn test_storage_config_custom() {
        let config = StorageConfig {
            data_dir: PathBuf::from("/var/lib/ccnidx"),
            fsync_enabled: false,
            ..Default::default()
        };
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/ccnidx"));
        assert!(!config.fsync_enabled);
        assert_eq!(config.max_open_files, 64);
    }
}

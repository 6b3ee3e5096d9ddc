//! Error types for ccnidx.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using CcnxError.
pub type Result<T> = std::result::Result<T, CcnxError>;

/// Errors that can occur in ccnidx operations.
#[derive(Debug, Error)]
pub enum CcnxError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Encoding errors
    #[error("Component too large: {size} bytes (max {max})")]
    ComponentTooLarge { size: usize, max: usize },

    #[error("Invalid length tag at offset {offset}")]
    InvalidLengthTag { offset: usize },

    #[error("Truncated flatname at offset {offset}")]
    TruncatedFlatname { offset: usize },

    #[error("Invalid wire name: {0}")]
    InvalidWireName(String),

    // Structural errors
    #[error("Node corrupted: {node_id}, reason: {reason}")]
    NodeCorrupt { node_id: u32, reason: String },

    #[error("Entry index {index} out of range for node {node_id} ({count} entries)")]
    IndexOutOfRange {
        node_id: u32,
        index: usize,
        count: usize,
    },

    #[error("Node {node_id} has no room for the entry")]
    NodeFull { node_id: u32 },

    // Resource errors
    #[error("Storage directory locked by process {pid}: {path}")]
    LockHeld { pid: u32, path: PathBuf },

    #[error("Unable to acquire lock {path} after {attempts} attempts")]
    LockUnavailable { path: PathBuf, attempts: u32 },

    #[error("Open node limit reached ({limit})")]
    TooManyOpenNodes { limit: usize },

    #[error("Allocation of {bytes} bytes failed")]
    AllocationFailed { bytes: usize },

    // Content errors
    #[error("Name mismatch: flatname has {flatname_comps} components, descriptor {descriptor_comps}")]
    NameMismatch {
        flatname_comps: usize,
        descriptor_comps: usize,
    },

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    // Contract violations
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl CcnxError {
    /// Returns true for errors that mark a node as structurally damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CcnxError::NodeCorrupt { .. } | CcnxError::IndexOutOfRange { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: CcnxError = io_err.into();
        assert!(matches!(err, CcnxError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_encoding_errors_display() {
        let err = CcnxError::ComponentTooLarge {
            size: 3_000_000,
            max: 2_097_151,
        };
        assert_eq!(
            err.to_string(),
            "Component too large: 3000000 bytes (max 2097151)"
        );

        let err = CcnxError::InvalidLengthTag { offset: 7 };
        assert_eq!(err.to_string(), "Invalid length tag at offset 7");

        let err = CcnxError::TruncatedFlatname { offset: 3 };
        assert_eq!(err.to_string(), "Truncated flatname at offset 3");
    }

    #[test]
    fn test_structural_errors_display() {
        let err = CcnxError::NodeCorrupt {
            node_id: 12,
            reason: "bad magic".to_string(),
        };
        assert_eq!(err.to_string(), "Node corrupted: 12, reason: bad magic");

        let err = CcnxError::IndexOutOfRange {
            node_id: 3,
            index: 9,
            count: 4,
        };
        assert_eq!(
            err.to_string(),
            "Entry index 9 out of range for node 3 (4 entries)"
        );
    }

    #[test]
    fn test_lock_errors_display() {
        let err = CcnxError::LockHeld {
            pid: 4242,
            path: PathBuf::from("/tmp/idx/.LCK"),
        };
        assert_eq!(
            err.to_string(),
            "Storage directory locked by process 4242: /tmp/idx/.LCK"
        );

        let err = CcnxError::LockUnavailable {
            path: PathBuf::from("/tmp/idx/.LCK"),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Unable to acquire lock /tmp/idx/.LCK after 3 attempts"
        );
    }

    #[test]
    fn test_is_corruption() {
        assert!(
            CcnxError::NodeCorrupt {
                node_id: 1,
                reason: String::new()
            }
            .is_corruption()
        );
        assert!(
            CcnxError::IndexOutOfRange {
                node_id: 1,
                index: 0,
                count: 0
            }
            .is_corruption()
        );
        assert!(!CcnxError::NodeFull { node_id: 1 }.is_corruption());
        assert!(!CcnxError::ContractViolation("x".to_string()).is_corruption());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CcnxError>();
    }
}

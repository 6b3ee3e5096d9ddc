//! File-backed node storage.
//!
//! Directory layout:
//! ```text
//! <data_dir>/
//!   1, 2, 3 ...   one file per node, named by decimal node id
//!   maxnodeid     decimal id of the highest node ever opened
//!   .LCK          decimal pid of the owning process
//! ```
//!
//! A node file holds exactly the node buffer. Writes start at the node's
//! clean offset and truncate the file to the buffer length. If a write
//! fails the clean offset is left where it was, so a retry rewrites the
//! same suffix. Opening a node that has no file creates nothing; the file
//! and the `maxnodeid` record appear with the first write.

use crate::btree::{IoHandle, Node};
use crate::lock::LockFile;
use crate::store::NodeStore;
use ccnidx_common::{CcnxError, NodeId, Result, StorageConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the file recording the highest allocated node id.
pub const MAX_NODE_ID_FILE: &str = "maxnodeid";

/// Handle for an open node file.
struct FileHandle {
    /// The file, once the node exists on disk.
    file: Option<File>,
    /// Node stored in the file.
    node_id: NodeId,
}

/// Mutable state behind the store's mutex.
struct DiskState {
    /// Open files keyed by handle.
    files: HashMap<IoHandle, FileHandle>,
    next_handle: u64,
    max_node_id: NodeId,
    destroyed: bool,
}

/// Stores each node in its own file under a locked directory.
pub struct FileNodeStore {
    /// Configuration.
    config: StorageConfig,
    state: Mutex<DiskState>,
    lock: Mutex<LockFile>,
}

impl FileNodeStore {
    /// Opens a storage directory, creating it if needed, and takes its lock.
    pub fn new(config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let lock = LockFile::acquire(&config.data_dir, config.lock_attempts)?;
        let max_node_id = match read_max_node_id(&config.data_dir) {
            Ok(id) => id,
            Err(e) => {
                let mut lock = lock;
                if let Err(cleanup) = lock.release() {
                    tracing::warn!(error = %cleanup, "lock release after failed open");
                }
                return Err(e);
            }
        };
        tracing::debug!(
            dir = %config.data_dir.display(),
            max_node_id = %max_node_id,
            "node store opened"
        );
        Ok(Self {
            config,
            state: Mutex::new(DiskState {
                files: HashMap::new(),
                next_handle: 1,
                max_node_id,
                destroyed: false,
            }),
            lock: Mutex::new(lock),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Number of node files currently open.
    pub fn open_files(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Generates the file path for a node.
    fn node_path(&self, node_id: NodeId) -> PathBuf {
        self.config.data_dir.join(node_id.to_string())
    }

    /// Records a new highest node id, via a temporary file and rename.
    fn persist_max_node_id(&self, node_id: NodeId) -> Result<()> {
        let tmp = self.config.data_dir.join(format!("{}.tmp", MAX_NODE_ID_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(node_id.to_string().as_bytes())?;
            if self.config.fsync_enabled {
                file.sync_all()?;
            }
        }
        std::fs::rename(&tmp, self.config.data_dir.join(MAX_NODE_ID_FILE))?;
        Ok(())
    }

    /// Raises the recorded high-water mark to `node_id` if needed.
    fn note_node_id(&self, state: &mut DiskState, node_id: NodeId) -> Result<()> {
        if node_id > state.max_node_id {
            self.persist_max_node_id(node_id)?;
            state.max_node_id = node_id;
        }
        Ok(())
    }

    fn not_open(node: &Node) -> CcnxError {
        CcnxError::ContractViolation(format!("node {} is not open", node.id()))
    }
}

fn read_max_node_id(dir: &Path) -> Result<NodeId> {
    match std::fs::read_to_string(dir.join(MAX_NODE_ID_FILE)) {
        Ok(text) => text.trim().parse::<u32>().map(NodeId).map_err(|_| {
            CcnxError::ConfigError(format!("unreadable {} file: {:?}", MAX_NODE_ID_FILE, text))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(NodeId::NONE),
        Err(e) => Err(e.into()),
    }
}

impl NodeStore for FileNodeStore {
    fn open(&self, node: &mut Node) -> Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(CcnxError::ContractViolation("node store destroyed".to_string()));
        }
        if let Some(io) = node.io() {
            if state.files.contains_key(&io) {
                return Ok(());
            }
        }
        if state.files.len() >= self.config.max_open_files {
            return Err(CcnxError::TooManyOpenNodes {
                limit: self.config.max_open_files,
            });
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.node_path(node.id()))
        {
            Ok(file) => {
                self.note_node_id(&mut state, node.id())?;
                Some(file)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let io = IoHandle(state.next_handle);
        state.next_handle += 1;
        state.files.insert(
            io,
            FileHandle {
                file,
                node_id: node.id(),
            },
        );
        node.set_io(Some(io));
        tracing::debug!(node = %node.id(), open = state.files.len(), "node file opened");
        Ok(())
    }

    fn read(&self, node: &mut Node, limit: usize) -> Result<()> {
        let mut state = self.state.lock();
        let io = node.io().ok_or_else(|| Self::not_open(node))?;
        let handle = state.files.get_mut(&io).ok_or_else(|| Self::not_open(node))?;
        if node.clean_offset() != node.len() {
            return Err(CcnxError::ContractViolation(format!(
                "read into node {} with unwritten changes",
                node.id()
            )));
        }

        let stored = match &handle.file {
            Some(file) => file.metadata()?.len() as usize,
            None => 0,
        };
        let from = node.clean_offset();
        let to = stored.min(limit);
        let mut data = Vec::new();
        if let (Some(file), true) = (handle.file.as_mut(), to > from) {
            data.try_reserve(to - from)
                .map_err(|_| CcnxError::AllocationFailed { bytes: to - from })?;
            data.resize(to - from, 0);
            file.seek(SeekFrom::Start(from as u64))?;
            file.read_exact(&mut data)?;
        }
        node.extend_from_storage(&data, stored)?;
        tracing::debug!(node = %node.id(), bytes = data.len(), stored, "node read");
        Ok(())
    }

    fn write(&self, node: &mut Node) -> Result<()> {
        let mut state = self.state.lock();
        let io = node.io().ok_or_else(|| Self::not_open(node))?;
        let exists = state
            .files
            .get(&io)
            .ok_or_else(|| Self::not_open(node))?
            .file
            .is_some();
        if !exists {
            if node.is_empty() {
                node.mark_persisted();
                return Ok(());
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.node_path(node.id()))?;
            self.note_node_id(&mut state, node.id())?;
            if let Some(handle) = state.files.get_mut(&io) {
                handle.file = Some(file);
            }
        }
        let handle = state.files.get_mut(&io).ok_or_else(|| Self::not_open(node))?;
        let file = handle.file.as_mut().ok_or_else(|| Self::not_open(node))?;

        let from = node.clean_offset().min(node.len());
        let data = node.unclean();
        file.seek(SeekFrom::Start(from as u64))?;
        file.write_all(data)?;
        file.set_len(node.len() as u64)?;
        if self.config.fsync_enabled {
            file.sync_data()?;
        }
        tracing::debug!(
            node = %handle.node_id,
            offset = from,
            bytes = data.len(),
            "node written"
        );
        node.mark_persisted();
        Ok(())
    }

    fn close(&self, node: &mut Node) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(io) = node.io() {
            if let Some(handle) = state.files.remove(&io) {
                if let (Some(file), true) = (&handle.file, self.config.fsync_enabled) {
                    file.sync_all()?;
                }
                tracing::debug!(node = %handle.node_id, open = state.files.len(), "node file closed");
            }
        }
        node.set_io(None);
        Ok(())
    }

    fn max_node_id(&self) -> NodeId {
        self.state.lock().max_node_id
    }

    fn open_count(&self) -> usize {
        self.open_files()
    }

    fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            for (_, handle) in state.files.drain() {
                if let (Some(file), true) = (&handle.file, self.config.fsync_enabled) {
                    file.sync_all()?;
                }
            }
            state.destroyed = true;
        }
        self.lock.lock().release()?;
        tracing::debug!(dir = %self.config.data_dir.display(), "node store destroyed");
        Ok(())
    }
}

impl Drop for FileNodeStore {
    fn drop(&mut self) {
        // The lock stays in place until destroy(); only handles are dropped.
        self.state.lock().files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccnidx_common::NodeKind;
    use tempfile::tempdir;

    fn create_test_store() -> (FileNodeStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            max_open_files: 4,
            lock_attempts: 2,
        };
        (FileNodeStore::new(config).unwrap(), dir)
    }

    fn reopen(dir: &tempfile::TempDir) -> FileNodeStore {
        FileNodeStore::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            max_open_files: 4,
            lock_attempts: 2,
        })
        .unwrap()
    }

    fn leaf(id: u32) -> Node {
        let mut node = Node::new(NodeId(id), 4096);
        node.init(0, NodeKind::Plain, &[0u8; 8]).unwrap();
        node
    }

    #[test]
    fn test_write_then_read() {
        let (store, dir) = create_test_store();
        let mut node = leaf(3);
        store.open(&mut node).unwrap();
        assert!(node.io().is_some());
        store.write(&mut node).unwrap();
        assert!(!node.is_dirty());
        store.close(&mut node).unwrap();
        assert!(node.io().is_none());

        let on_disk = std::fs::read(dir.path().join("3")).unwrap();
        assert_eq!(on_disk, node.bytes());

        let mut fresh = Node::new(NodeId(3), 4096);
        store.open(&mut fresh).unwrap();
        store.read(&mut fresh, usize::MAX).unwrap();
        assert_eq!(fresh.bytes(), node.bytes());
        assert!(!fresh.is_dirty());
        store.destroy().unwrap();
    }

    #[test]
    fn test_read_respects_limit() {
        let (store, _dir) = create_test_store();
        let mut node = leaf(2);
        store.open(&mut node).unwrap();
        store.write(&mut node).unwrap();

        let mut partial = Node::new(NodeId(2), 4096);
        store.open(&mut partial).unwrap();
        store.read(&mut partial, 8).unwrap();
        assert_eq!(partial.len(), 8);
        assert_eq!(partial.persisted_len(), 16);
        store.read(&mut partial, usize::MAX).unwrap();
        assert_eq!(partial.bytes(), node.bytes());
        store.destroy().unwrap();
    }

    #[test]
    fn test_write_truncates_file() {
        let (store, dir) = create_test_store();
        let mut node = leaf(5);
        store.open(&mut node).unwrap();
        store.write(&mut node).unwrap();

        node.init(0, NodeKind::Plain, &[]).unwrap();
        store.write(&mut node).unwrap();
        assert_eq!(std::fs::read(dir.path().join("5")).unwrap().len(), 8);
        store.destroy().unwrap();
    }

    #[test]
    fn test_open_limit() {
        let (store, _dir) = create_test_store();
        let mut nodes: Vec<Node> = (1..=5).map(leaf).collect();
        for node in nodes.iter_mut().take(4) {
            store.open(node).unwrap();
        }
        assert_eq!(store.open_files(), 4);
        assert!(matches!(
            store.open(&mut nodes[4]),
            Err(CcnxError::TooManyOpenNodes { limit: 4 })
        ));
        // Reopening an open node does not count twice
        store.open(&mut nodes[0]).unwrap();
        store.close(&mut nodes[1]).unwrap();
        store.open(&mut nodes[4]).unwrap();
        assert_eq!(store.open_files(), 4);
        store.destroy().unwrap();
    }

    #[test]
    fn test_max_node_id_persists() {
        let (store, dir) = create_test_store();
        assert_eq!(store.max_node_id(), NodeId::NONE);
        for id in [2, 9, 4] {
            let mut node = leaf(id);
            store.open(&mut node).unwrap();
            store.write(&mut node).unwrap();
            store.close(&mut node).unwrap();
        }
        assert_eq!(store.max_node_id(), NodeId(9));
        store.destroy().unwrap();

        let text = std::fs::read_to_string(dir.path().join(MAX_NODE_ID_FILE)).unwrap();
        assert_eq!(text, "9");
        let store = reopen(&dir);
        assert_eq!(store.max_node_id(), NodeId(9));
        store.destroy().unwrap();
    }

    #[test]
    fn test_open_without_write_leaves_no_trace() {
        let (store, dir) = create_test_store();
        let mut node = Node::new(NodeId(7), 4096);
        store.open(&mut node).unwrap();
        store.read(&mut node, usize::MAX).unwrap();
        assert!(node.is_empty());
        store.close(&mut node).unwrap();
        assert!(!dir.path().join("7").exists());
        assert!(!dir.path().join(MAX_NODE_ID_FILE).exists());
        assert_eq!(store.max_node_id(), NodeId::NONE);

        // An empty node that was never stored stays absent
        store.open(&mut node).unwrap();
        store.write(&mut node).unwrap();
        assert!(!dir.path().join("7").exists());

        let mut written = leaf(7);
        store.open(&mut written).unwrap();
        store.write(&mut written).unwrap();
        assert_eq!(std::fs::read(dir.path().join("7")).unwrap(), written.bytes());
        assert_eq!(store.max_node_id(), NodeId(7));
        store.destroy().unwrap();
    }

    #[test]
    fn test_bad_max_node_id_releases_lock() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MAX_NODE_ID_FILE), b"twelve").unwrap();
        let err = FileNodeStore::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        assert!(matches!(err, Err(CcnxError::ConfigError(_))));
        assert!(!dir.path().join(".LCK").exists());
    }

    #[test]
    fn test_lock_held_until_destroy() {
        let (store, dir) = create_test_store();
        let err = FileNodeStore::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        assert!(matches!(err, Err(CcnxError::LockHeld { .. })));
        store.destroy().unwrap();
        assert!(!dir.path().join(".LCK").exists());
        reopen(&dir).destroy().unwrap();
    }

    #[test]
    fn test_io_requires_open() {
        let (store, _dir) = create_test_store();
        let mut node = leaf(1);
        assert!(matches!(
            store.write(&mut node),
            Err(CcnxError::ContractViolation(_))
        ));
        store.destroy().unwrap();
        assert!(store.open(&mut node).is_err());
    }
}

//! Storage backend interface and in-memory implementation.

use crate::btree::{IoHandle, Node};
use ccnidx_common::{CcnxError, NodeId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Persistent home of node buffers.
///
/// The engine calls `open` before any other operation on a node; `open`
/// attaches an [`IoHandle`] to the node. `read` and `write` move only the
/// bytes beyond the node's clean offset.
pub trait NodeStore: Send + Sync {
    /// Prepares I/O for a node and attaches a handle to it.
    fn open(&self, node: &mut Node) -> Result<()>;

    /// Extends the node buffer from storage up to `limit` bytes in total.
    fn read(&self, node: &mut Node, limit: usize) -> Result<()>;

    /// Persists the unclean suffix of the buffer and truncates storage to
    /// the buffer length.
    fn write(&self, node: &mut Node) -> Result<()>;

    /// Releases the node's handle. The buffer is left untouched.
    fn close(&self, node: &mut Node) -> Result<()>;

    /// Highest node id ever written to this store.
    fn max_node_id(&self) -> NodeId;

    /// Number of nodes currently open.
    fn open_count(&self) -> usize;

    /// Releases the whole store.
    fn destroy(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemState {
    blobs: HashMap<NodeId, Vec<u8>>,
    open: HashMap<IoHandle, NodeId>,
    next_handle: u64,
    max_node_id: NodeId,
    destroyed: bool,
}

/// Keeps node buffers in memory.
///
/// Clones share the same contents, so a clone taken before a tree is closed
/// can be used to open the tree again.
#[derive(Debug, Clone, Default)]
pub struct MemNodeStore {
    state: Arc<Mutex<MemState>>,
    max_open: Option<usize>,
}

impl MemNodeStore {
    /// Creates an empty store with no open-node limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that refuses more than `limit` open nodes.
    pub fn with_open_limit(limit: usize) -> Self {
        Self {
            state: Arc::default(),
            max_open: Some(limit),
        }
    }

    /// A store sharing this one's contents, usable after `destroy`.
    pub fn reopen(&self) -> Self {
        let mut state = self.state.lock();
        state.destroyed = false;
        state.open.clear();
        Self {
            state: Arc::clone(&self.state),
            max_open: self.max_open,
        }
    }

    /// Persisted bytes of a node, if it was ever written.
    pub fn stored(&self, node_id: NodeId) -> Option<Vec<u8>> {
        self.state.lock().blobs.get(&node_id).cloned()
    }

    /// Replaces the persisted bytes of a node.
    pub fn put(&self, node_id: NodeId, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        if node_id > state.max_node_id {
            state.max_node_id = node_id;
        }
        state.blobs.insert(node_id, bytes);
    }

    fn not_open(node: &Node) -> CcnxError {
        CcnxError::ContractViolation(format!("node {} is not open", node.id()))
    }
}

impl NodeStore for MemNodeStore {
    fn open(&self, node: &mut Node) -> Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(CcnxError::ContractViolation("node store destroyed".to_string()));
        }
        if let Some(io) = node.io() {
            if state.open.contains_key(&io) {
                return Ok(());
            }
        }
        if let Some(limit) = self.max_open {
            if state.open.len() >= limit {
                return Err(CcnxError::TooManyOpenNodes { limit });
            }
        }
        state.next_handle += 1;
        let io = IoHandle(state.next_handle);
        state.open.insert(io, node.id());
        node.set_io(Some(io));
        Ok(())
    }

    fn read(&self, node: &mut Node, limit: usize) -> Result<()> {
        let state = self.state.lock();
        let io = node.io().ok_or_else(|| Self::not_open(node))?;
        if !state.open.contains_key(&io) {
            return Err(Self::not_open(node));
        }
        if node.clean_offset() != node.len() {
            return Err(CcnxError::ContractViolation(format!(
                "read into node {} with unwritten changes",
                node.id()
            )));
        }
        let blob = state.blobs.get(&node.id()).map(Vec::as_slice).unwrap_or(&[]);
        let from = node.clean_offset().min(blob.len());
        let to = blob.len().min(limit).max(from);
        node.extend_from_storage(&blob[from..to], blob.len())
    }

    fn write(&self, node: &mut Node) -> Result<()> {
        let mut state = self.state.lock();
        let io = node.io().ok_or_else(|| Self::not_open(node))?;
        if !state.open.contains_key(&io) {
            return Err(Self::not_open(node));
        }
        if node.is_empty() && !state.blobs.contains_key(&node.id()) {
            node.mark_persisted();
            return Ok(());
        }
        if node.id() > state.max_node_id {
            state.max_node_id = node.id();
        }
        let blob = state.blobs.entry(node.id()).or_default();
        let from = node.clean_offset().min(node.len());
        blob.resize(from.max(blob.len()), 0);
        blob.truncate(from);
        blob.extend_from_slice(node.unclean());
        node.mark_persisted();
        Ok(())
    }

    fn close(&self, node: &mut Node) -> Result<()> {
        if let Some(io) = node.io() {
            self.state.lock().open.remove(&io);
        }
        node.set_io(None);
        Ok(())
    }

    fn max_node_id(&self) -> NodeId {
        self.state.lock().max_node_id
    }

    fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.open.clear();
        state.destroyed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccnidx_common::NodeKind;

    fn leaf(id: u32) -> Node {
        let mut node = Node::new(NodeId(id), 4096);
        node.init(0, NodeKind::Plain, &[]).unwrap();
        node
    }

    #[test]
    fn test_mem_store_roundtrip() {
        let store = MemNodeStore::new();
        let mut node = leaf(2);
        store.open(&mut node).unwrap();
        store.write(&mut node).unwrap();
        assert_eq!(store.stored(NodeId(2)).unwrap(), node.bytes());

        let mut fresh = Node::new(NodeId(2), 4096);
        store.open(&mut fresh).unwrap();
        store.read(&mut fresh, usize::MAX).unwrap();
        assert_eq!(fresh.bytes(), node.bytes());
        assert_eq!(store.open_count(), 2);
        assert_eq!(store.max_node_id(), NodeId(2));
    }

    #[test]
    fn test_mem_store_partial_write() {
        let store = MemNodeStore::new();
        let mut node = Node::new(NodeId(1), 4096);
        node.init(0, NodeKind::Root, &[1u8; 8]).unwrap();
        store.open(&mut node).unwrap();
        store.write(&mut node).unwrap();

        node.init(0, NodeKind::Root, &[]).unwrap();
        store.write(&mut node).unwrap();
        assert_eq!(store.stored(NodeId(1)).unwrap().len(), 8);
    }

    #[test]
    fn test_mem_store_open_limit() {
        let store = MemNodeStore::with_open_limit(1);
        let mut a = leaf(1);
        let mut b = leaf(2);
        store.open(&mut a).unwrap();
        assert!(matches!(
            store.open(&mut b),
            Err(CcnxError::TooManyOpenNodes { limit: 1 })
        ));
        store.close(&mut a).unwrap();
        store.open(&mut b).unwrap();
    }

    #[test]
    fn test_mem_store_open_creates_nothing() {
        let store = MemNodeStore::new();
        let mut node = Node::new(NodeId(6), 4096);
        store.open(&mut node).unwrap();
        store.read(&mut node, usize::MAX).unwrap();
        store.write(&mut node).unwrap();
        assert!(store.stored(NodeId(6)).is_none());
        assert_eq!(store.max_node_id(), NodeId::NONE);
    }

    #[test]
    fn test_mem_store_reopen_after_destroy() {
        let store = MemNodeStore::new();
        let mut node = leaf(3);
        store.open(&mut node).unwrap();
        store.write(&mut node).unwrap();
        store.destroy().unwrap();
        assert!(store.open(&mut leaf(4)).is_err());

        let again = store.reopen();
        let mut fresh = Node::new(NodeId(3), 4096);
        again.open(&mut fresh).unwrap();
        again.read(&mut fresh, usize::MAX).unwrap();
        assert_eq!(fresh.bytes(), node.bytes());
    }
}

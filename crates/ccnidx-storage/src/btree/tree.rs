//! Persistent B-tree over flatname keys.
//!
//! The root always lives in node 1. Nodes are loaded on demand through a
//! [`NodeStore`], kept in a resident table, and written back lazily. Every
//! node carries a parent hint that is verified before use, so hints may go
//! stale after splits and merges without harm.

use super::constants::{CONTENT_PAYLOAD_SIZE, TRAILER_SIZE};
use super::types::{InternalPayload, NodeEntry, NodeHeader};
use super::Node;
use crate::content::{self, ParsedContentObject, ParsedInterest, STALE};
use crate::disk::FileNodeStore;
use crate::flatname;
use crate::store::NodeStore;
use bytes::Bytes;
use ccnidx_buffer::{ActivityReplacer, NodeTable, Replacer};
use ccnidx_common::{CcnxError, IndexConfig, NodeId, NodeKind, Result, TreeConfig};
use std::collections::HashSet;

/// Forced splits tried before an insert gives up with `NodeFull`.
const INSERT_SPLIT_ATTEMPTS: usize = 8;

/// Position of a key in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    /// Node where the search stopped.
    pub node: NodeId,
    /// Entry index of the key, or where it would be inserted.
    pub index: usize,
    /// True if the key is present.
    pub found: bool,
}

/// A content entry satisfying an interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchHit {
    pub node: NodeId,
    pub index: usize,
    pub cobid: u64,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub resident_nodes: usize,
    pub open_handles: usize,
    pub dirty_nodes: usize,
    /// Distinct nodes found corrupt since the tree was opened.
    pub errors: u64,
    pub next_node_id: NodeId,
    /// Node whose split was interrupted, if any.
    pub pending_split: NodeId,
    /// Node whose spill was interrupted, if any.
    pub pending_spill: NodeId,
}

/// Result of a full structural check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeCheck {
    pub nodes: usize,
    pub entries: usize,
    pub height: u8,
    /// Nodes above their split threshold.
    pub oversize: usize,
}

enum Scan {
    Past,
    Hit(u64),
    Miss,
}

/// Index of the entry that splits `entries` into two byte-balanced halves.
///
/// Ties go to the lower index. Requires at least two entries.
fn balance_point(entries: &[NodeEntry]) -> usize {
    let total: usize = entries.iter().map(NodeEntry::footprint).sum();
    let mut best = 1;
    let mut best_diff = usize::MAX;
    let mut cum = 0;
    for k in 1..entries.len() {
        cum += entries[k - 1].footprint();
        let diff = (2 * cum).abs_diff(total);
        if diff < best_diff {
            best = k;
            best_diff = diff;
        }
    }
    best
}

fn child_entry(child: NodeId) -> NodeEntry {
    NodeEntry {
        key: Bytes::new(),
        payload: Bytes::copy_from_slice(&InternalPayload::new(child).to_bytes()),
    }
}

fn not_resident(id: NodeId) -> CcnxError {
    CcnxError::ContractViolation(format!("node {} is not resident", id))
}

pub struct Tree {
    store: Box<dyn NodeStore>,
    nodes: NodeTable<Node>,
    replacer: ActivityReplacer,
    next_node_id: u32,
    pending_split: NodeId,
    pending_spill: NodeId,
    errors: u64,
    /// Nodes already counted in `errors`.
    corrupt_seen: HashSet<NodeId>,
    config: TreeConfig,
}

impl Tree {
    /// Opens a tree over `store`, creating an empty root if none exists.
    pub fn new(store: Box<dyn NodeStore>, config: TreeConfig) -> Result<Self> {
        let next_node_id = store
            .max_node_id()
            .get()
            .saturating_add(1)
            .max(NodeId::ROOT.get() + 1);
        let mut tree = Self {
            store,
            nodes: NodeTable::new(),
            replacer: ActivityReplacer::new(),
            next_node_id,
            pending_split: NodeId::NONE,
            pending_spill: NodeId::NONE,
            errors: 0,
            corrupt_seen: HashSet::new(),
            config,
        };
        if let Err(e) = tree.load_root() {
            tree.nodes.sweep(|_, _| false);
            if let Err(cleanup) = tree.store.destroy() {
                tracing::warn!(error = %cleanup, "store release after failed open");
            }
            return Err(e);
        }
        tracing::debug!(next_node_id, "tree opened");
        Ok(tree)
    }

    /// Opens the file-backed tree described by `config`.
    pub fn open(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let store = FileNodeStore::new(config.storage)?;
        Self::new(Box::new(store), config.tree)
    }

    fn load_root(&mut self) -> Result<()> {
        self.load(NodeId::ROOT, NodeId::NONE)?;
        self.replacer.set_evictable(NodeId::ROOT, false);
        let root = self.node_mut(NodeId::ROOT)?;
        if root.is_empty() {
            root.init(0, NodeKind::Root, &[])?;
            tracing::debug!("initialized empty root");
        }
        Ok(())
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Number of distinct nodes found corrupt.
    pub fn error_count(&self) -> u64 {
        self.errors
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats {
            resident_nodes: self.nodes.len(),
            open_handles: self.store.open_count(),
            dirty_nodes: self.nodes.iter().filter(|(_, n)| n.is_dirty()).count(),
            errors: self.errors,
            next_node_id: NodeId(self.next_node_id),
            pending_split: self.pending_split,
            pending_spill: self.pending_spill,
        }
    }

    // =========================================================================
    // Residency
    // =========================================================================

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id).ok_or_else(|| not_resident(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id).ok_or_else(|| not_resident(id))
    }

    /// Returns a resident node, reading it from storage if needed.
    ///
    /// A non-null `parent_hint` replaces the node's recorded parent.
    pub fn getnode(&mut self, id: NodeId, parent_hint: NodeId) -> Result<&Node> {
        self.load(id, parent_hint)?;
        self.node(id)
    }

    fn load(&mut self, id: NodeId, parent: NodeId) -> Result<()> {
        if !id.is_some() {
            return Err(CcnxError::ContractViolation("load of null node".to_string()));
        }
        if let Some(node) = self.nodes.get_mut(id) {
            if parent.is_some() {
                node.set_parent_hint(parent);
            }
            self.replacer.record_access(id);
            return Ok(());
        }

        self.make_room()?;
        let mut node = Node::new(id, self.config.node_bytes_budget);
        node.set_parent_hint(parent);
        self.open_io(&mut node)?;
        if let Err(e) = self.store.read(&mut node, self.config.node_bytes_budget) {
            if let Err(cleanup) = self.store.close(&mut node) {
                tracing::warn!(node = %id, error = %cleanup, "close after failed read");
            }
            return Err(e);
        }
        let problem = if node.is_empty() {
            (id != NodeId::ROOT).then(|| node.mark_corrupt("node has no content"))
        } else {
            node.check().err()
        };
        self.insert_resident(node);
        if let Some(e) = problem {
            if self.count_corrupt(id) {
                tracing::warn!(node = %id, error = %e, errors = self.errors, "corrupt node loaded");
            }
            return Err(e);
        }
        tracing::trace!(node = %id, "node loaded");
        self.trim_open_handles(id)
    }

    fn insert_resident(&mut self, node: Node) {
        let id = node.id();
        self.nodes.insert(id, node);
        self.replacer.record_access(id);
        self.replacer.set_evictable(id, id != NodeId::ROOT);
    }

    /// Makes a freshly built node resident and open.
    fn install_node(&mut self, mut node: Node) -> Result<()> {
        self.make_room()?;
        self.open_io(&mut node)?;
        let id = node.id();
        self.insert_resident(node);
        self.trim_open_handles(id)
    }

    fn replace_node(&mut self, id: NodeId, rebuilt: Node) -> Result<()> {
        self.load(id, NodeId::NONE)?;
        self.node_mut(id)?.replace_contents(rebuilt);
        Ok(())
    }

    fn allocate_id(&mut self) -> Result<NodeId> {
        let id = NodeId(self.next_node_id);
        self.next_node_id = self
            .next_node_id
            .checked_add(1)
            .ok_or_else(|| CcnxError::ContractViolation("node ids exhausted".to_string()))?;
        Ok(id)
    }

    fn open_io(&mut self, node: &mut Node) -> Result<()> {
        match self.store.open(node) {
            Err(CcnxError::TooManyOpenNodes { limit }) => {
                if !self.close_coldest(node.id())? {
                    return Err(CcnxError::TooManyOpenNodes { limit });
                }
                self.store.open(node)
            }
            other => other,
        }
    }

    /// Closes the least active open node other than `keep`.
    ///
    /// Returns false if there was nothing to close.
    fn close_coldest(&mut self, keep: NodeId) -> Result<bool> {
        let candidates: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, n)| *id != keep && n.io().is_some())
            .map(|(id, _)| id)
            .collect();
        match self.replacer.coldest(candidates) {
            Some(victim) => {
                self.close_node(victim)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn trim_open_handles(&mut self, keep: NodeId) -> Result<()> {
        while self.store.open_count() > self.config.idle_close_threshold {
            if !self.close_coldest(keep)? {
                break;
            }
        }
        Ok(())
    }

    fn make_room(&mut self) -> Result<()> {
        while self.nodes.len() >= self.config.resident_node_budget {
            match self.replacer.evict() {
                Some(victim) => self.evict_node(victim)?,
                None => break,
            }
        }
        Ok(())
    }

    fn evict_node(&mut self, id: NodeId) -> Result<()> {
        if self.nodes.contains(id) {
            if let Err(e) = self.close_node(id) {
                self.replacer.set_evictable(id, true);
                return Err(e);
            }
            self.nodes.remove(id);
        }
        self.replacer.remove(id);
        tracing::trace!(node = %id, "node evicted");
        Ok(())
    }

    /// Persists a dirty node, reopening it if its handle was closed.
    fn write_back(&mut self, id: NodeId) -> Result<()> {
        let (dirty, open) = match self.nodes.get(id) {
            Some(n) => (n.is_dirty(), n.io().is_some()),
            None => return Ok(()),
        };
        if !dirty {
            return Ok(());
        }
        if !open {
            let Some(mut node) = self.nodes.remove(id) else {
                return Ok(());
            };
            let res = self.open_io(&mut node);
            self.nodes.insert(id, node);
            res?;
        }
        let node = self.nodes.get_mut(id).ok_or_else(|| not_resident(id))?;
        self.store.write(node)
    }

    /// Writes the node back if needed and releases its handle.
    ///
    /// The node stays resident.
    pub fn close_node(&mut self, id: NodeId) -> Result<()> {
        self.write_back(id)?;
        match self.nodes.get_mut(id) {
            Some(node) => self.store.close(node),
            None => Ok(()),
        }
    }

    /// Empties a node that is no longer referenced and drops it.
    fn discard_node(&mut self, id: NodeId) -> Result<()> {
        self.load(id, NodeId::NONE)?;
        self.node_mut(id)?.discard();
        self.close_node(id)?;
        self.nodes.remove(id);
        self.replacer.remove(id);
        tracing::debug!(node = %id, "node discarded");
        Ok(())
    }

    /// Writes every dirty node. Returns the number written.
    pub fn flush(&mut self) -> Result<usize> {
        let mut written = 0;
        for id in self.nodes.ids() {
            if self.nodes.get(id).is_some_and(Node::is_dirty) {
                self.write_back(id)?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Periodic maintenance.
    ///
    /// Ages activity counters, closes nodes that went idle, closes the least
    /// active nodes while the handle count is above the idle threshold, and
    /// evicts nodes beyond the resident budget. Returns the number of nodes
    /// closed or evicted.
    pub fn idle(&mut self) -> Result<usize> {
        let mut closed = 0;
        for id in self.replacer.decay() {
            if self.nodes.get(id).is_some_and(|n| n.io().is_some() || n.is_dirty()) {
                self.close_node(id)?;
                closed += 1;
            }
        }
        while self.store.open_count() > self.config.idle_close_threshold {
            if !self.close_coldest(NodeId::NONE)? {
                break;
            }
            closed += 1;
        }
        while self.nodes.len() > self.config.resident_node_budget {
            match self.replacer.evict() {
                Some(victim) => {
                    self.evict_node(victim)?;
                    closed += 1;
                }
                None => break,
            }
        }
        if closed > 0 {
            tracing::debug!(closed, resident = self.nodes.len(), "idle pass");
        }
        Ok(closed)
    }

    /// Flushes and closes every node, then releases the store.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        let store = &self.store;
        let mut failure = None;
        let dropped = self.nodes.sweep(|_, node| {
            if let Err(e) = store.close(node) {
                failure.get_or_insert(e);
            }
            false
        });
        for (id, _) in &dropped {
            self.replacer.remove(*id);
        }
        if let Some(e) = failure {
            return Err(e);
        }
        tracing::debug!(nodes = dropped.len(), "tree closed");
        self.store.destroy()
    }

    // =========================================================================
    // Corruption bookkeeping
    // =========================================================================

    fn checked<T>(&mut self, id: NodeId, res: Result<T>) -> Result<T> {
        res.map_err(|e| self.note_error(id, e))
    }

    /// Marks the node corrupt for structural errors and bumps the counter.
    fn note_error(&mut self, id: NodeId, e: CcnxError) -> CcnxError {
        if !e.is_corruption() {
            return e;
        }
        let reason = match &e {
            CcnxError::NodeCorrupt { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        if let Some(node) = self.nodes.get_mut(id) {
            if !node.is_corrupt() {
                node.mark_corrupt(reason);
            }
        }
        if self.count_corrupt(id) {
            tracing::warn!(node = %id, error = %e, errors = self.errors, "node marked corrupt");
        }
        e
    }

    /// Bumps the error counter the first time a node is seen corrupt.
    fn count_corrupt(&mut self, id: NodeId) -> bool {
        let newly = self.corrupt_seen.insert(id);
        if newly {
            self.errors += 1;
        }
        newly
    }

    fn corrupt(&mut self, id: NodeId, reason: String) -> CcnxError {
        let err = CcnxError::NodeCorrupt {
            node_id: id.get(),
            reason,
        };
        self.note_error(id, err)
    }

    /// Loads a node for mutation, refusing nodes flagged corrupt.
    ///
    /// A non-root node also has its parent resolved, which repairs a stale
    /// parent hint before any split or spill relies on it.
    pub fn prepare_for_update(&mut self, id: NodeId) -> Result<()> {
        let parent = self.parent_of(id)?;
        self.load(id, parent)?;
        let node = self.node(id)?;
        if let Some(reason) = node.corrupt_reason() {
            return Err(CcnxError::NodeCorrupt {
                node_id: id.get(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Finds the leaf position of `key`.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Lookup> {
        self.lookup_internal(NodeId::ROOT, 0, key)
    }

    /// Descends from `root` until reaching a node at or below `stop_level`.
    pub fn lookup_internal(&mut self, root: NodeId, stop_level: u8, key: &[u8]) -> Result<Lookup> {
        let mut id = root;
        let mut parent = NodeId::NONE;
        loop {
            self.load(id, parent)?;
            let (level, res) = {
                let node = self.node(id)?;
                (node.level(), node.search(key))
            };
            let at = self.checked(id, res)?;
            if level <= stop_level {
                return Ok(Lookup {
                    node: id,
                    index: at.index,
                    found: at.found,
                });
            }
            let ci = if at.found {
                at.index
            } else {
                at.index.saturating_sub(1)
            };
            let res = self.node(id)?.child(ci);
            let child = self.checked(id, res)?;
            self.load(child, id)?;
            let child_level = self.node(child)?.level();
            if child_level + 1 != level {
                return Err(self.corrupt(
                    child,
                    format!("level {} below parent at level {}", child_level, level),
                ));
            }
            parent = id;
            id = child;
        }
    }

    /// Position of `child` among the entries of `parent`.
    fn child_index(&mut self, parent: NodeId, child: NodeId) -> Result<Option<usize>> {
        let children = self.children(parent)?;
        Ok(children.iter().position(|c| *c == child))
    }

    fn children(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        self.load(id, NodeId::NONE)?;
        let res = {
            let node = self.node(id)?;
            if node.level() == 0 {
                return Ok(Vec::new());
            }
            (0..node.entry_count())
                .map(|i| node.child(i))
                .collect::<Result<Vec<_>>>()
        };
        self.checked(id, res)
    }

    /// Finds the parent of a non-root node.
    ///
    /// The recorded hint is trusted only after the parent is seen to point
    /// back at the node. Otherwise the parent is found by descending with
    /// the node's first key, or by a full walk for an empty node.
    pub fn parent_of(&mut self, id: NodeId) -> Result<NodeId> {
        if id == NodeId::ROOT {
            return Ok(NodeId::NONE);
        }
        self.load(id, NodeId::NONE)?;
        let (hint, level, first) = {
            let node = self.node(id)?;
            let first = (node.entry_count() > 0).then(|| node.key(0));
            (node.parent_hint(), node.level(), first)
        };
        let first = first.map(|res| self.checked(id, res)).transpose()?;
        if hint.is_some() && self.nodes.contains(hint) && self.child_index(hint, id)?.is_some() {
            return Ok(hint);
        }

        if let Some(first) = first {
            let at = self.lookup_internal(NodeId::ROOT, level + 1, &first)?;
            if at.node != id && self.child_index(at.node, id)?.is_some() {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.set_parent_hint(at.node);
                }
                return Ok(at.node);
            }
        }

        let mut stack = vec![NodeId::ROOT];
        while let Some(pid) = stack.pop() {
            self.load(pid, NodeId::NONE)?;
            let plevel = self.node(pid)?.level();
            if plevel <= level {
                continue;
            }
            let children = self.children(pid)?;
            if plevel == level + 1 {
                if children.contains(&id) {
                    self.load(id, pid)?;
                    return Ok(pid);
                }
            } else {
                stack.extend(children);
            }
        }
        Err(self.corrupt(id, "node is not reachable from the root".to_string()))
    }

    /// The leaf after `id` in key order, if any.
    pub fn next_leaf(&mut self, id: NodeId) -> Result<Option<NodeId>> {
        self.adjacent_leaf(id, true)
    }

    /// The leaf before `id` in key order, if any.
    pub fn prev_leaf(&mut self, id: NodeId) -> Result<Option<NodeId>> {
        self.adjacent_leaf(id, false)
    }

    fn adjacent_leaf(&mut self, id: NodeId, forward: bool) -> Result<Option<NodeId>> {
        let mut cur = id;
        loop {
            if cur == NodeId::ROOT {
                return Ok(None);
            }
            let parent = self.parent_of(cur)?;
            let children = self.children(parent)?;
            let j = match children.iter().position(|c| *c == cur) {
                Some(j) => j,
                None => return Err(self.corrupt(cur, "parent lost its child".to_string())),
            };
            let sibling = if forward {
                children.get(j + 1)
            } else {
                j.checked_sub(1).and_then(|k| children.get(k))
            };
            if let Some(&sibling) = sibling {
                return self.edge_leaf(sibling, parent, forward).map(Some);
            }
            cur = parent;
        }
    }

    /// Descends to the leftmost (or rightmost) leaf under `id`.
    fn edge_leaf(&mut self, mut id: NodeId, mut parent: NodeId, leftmost: bool) -> Result<NodeId> {
        loop {
            self.load(id, parent)?;
            if self.node(id)?.level() == 0 {
                return Ok(id);
            }
            let children = self.children(id)?;
            let next = if leftmost {
                children.first()
            } else {
                children.last()
            };
            match next {
                Some(&child) => {
                    parent = id;
                    id = child;
                }
                None => return Err(self.corrupt(id, "internal node has no entries".to_string())),
            }
        }
    }

    // =========================================================================
    // Rebuilding
    // =========================================================================

    fn build_node(
        &self,
        id: NodeId,
        level: u8,
        kind: NodeKind,
        ext: &[u8],
        entries: &[NodeEntry],
    ) -> Result<Node> {
        let mut node = Node::new(id, self.config.node_bytes_budget);
        node.init(level, kind, ext)?;
        for (i, e) in entries.iter().enumerate() {
            node.insert_entry(i, &e.key, &e.payload)?;
        }
        Ok(node)
    }

    fn snapshot(&mut self, id: NodeId) -> Result<(u8, NodeKind, Vec<u8>, Vec<NodeEntry>)> {
        self.load(id, NodeId::NONE)?;
        let res = {
            let node = self.node(id)?;
            let kind = node.kind().unwrap_or(NodeKind::Plain);
            node.entries()
                .map(|e| (node.level(), kind, node.header_ext().to_vec(), e))
        };
        self.checked(id, res)
    }

    fn insert_separator(&mut self, parent: NodeId, key: &[u8], child: NodeId) -> Result<()> {
        self.load(parent, NodeId::NONE)?;
        let res = self.node(parent)?.search(key);
        let at = self.checked(parent, res)?;
        if at.found {
            return Err(self.corrupt(parent, "separator already present".to_string()));
        }
        let payload = InternalPayload::new(child).to_bytes();
        let res = self.node_mut(parent)?.insert_entry(at.index, key, &payload);
        self.checked(parent, res)
    }

    /// Splits `id` and any ancestors that become oversize.
    ///
    /// Each node is first compacted; a split happens only if compaction does
    /// not bring it under its threshold. A root that must split moves its
    /// entries into a new child and gains a level.
    pub fn split(&mut self, id: NodeId) -> Result<()> {
        self.split_from(id, false)
    }

    /// Splits `id` even if it is under its threshold, so that an entry too
    /// large for the remaining space can be retried in a half.
    fn force_split(&mut self, id: NodeId) -> Result<()> {
        self.split_from(id, true)
    }

    fn split_from(&mut self, id: NodeId, force: bool) -> Result<()> {
        let mut forced = force.then_some(id);
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            self.load(id, NodeId::NONE)?;
            let must = forced == Some(id) && self.node(id)?.entry_count() > 1;
            if !must && !self.node(id)?.oversize(&self.config) {
                continue;
            }
            self.pending_split = id;
            let before = self.node(id)?.len();
            let (level, kind, ext, entries) = self.snapshot(id)?;
            let rebuilt = self.build_node(id, level, kind, &ext, &entries)?;
            if !must && !rebuilt.oversize(&self.config) {
                tracing::debug!(node = %id, before, after = rebuilt.len(), "node compacted");
                self.replace_node(id, rebuilt)?;
                continue;
            }
            if id == NodeId::ROOT {
                // Pushing down two internal entries rebuilds the same root.
                if level > 0 && entries.len() <= 2 {
                    tracing::debug!(len = rebuilt.len(), "root separators exceed threshold");
                    continue;
                }
                let child = self.push_down_root(level, &ext, &entries)?;
                if must {
                    forced = Some(child);
                }
                work.push(child);
                continue;
            }
            if must {
                forced = None;
            }

            let parent = self.parent_of(id)?;
            let k = balance_point(&entries);
            let right_id = self.allocate_id()?;
            let left = self.build_node(id, level, kind, &ext, &entries[..k])?;
            let mut right = self.build_node(right_id, level, NodeKind::Plain, &[], &entries[k..])?;
            right.set_parent_hint(parent);
            self.install_node(right)?;
            // Until the separator is in place the left node keeps every entry.
            if let Err(e) = self.insert_separator(parent, &entries[k].key, right_id) {
                if let Err(cleanup) = self.discard_node(right_id) {
                    tracing::warn!(node = %right_id, error = %cleanup, "discard after failed split");
                }
                return Err(e);
            }
            self.replace_node(id, left)?;
            tracing::debug!(node = %id, right = %right_id, parent = %parent, level, at = k, "node split");

            work.push(parent);
            work.push(id);
            work.push(right_id);
        }
        self.pending_split = NodeId::NONE;
        Ok(())
    }

    fn push_down_root(&mut self, level: u8, ext: &[u8], entries: &[NodeEntry]) -> Result<NodeId> {
        let new_level = level
            .checked_add(1)
            .ok_or_else(|| CcnxError::ContractViolation("tree too deep".to_string()))?;
        let child_id = self.allocate_id()?;
        let mut child = self.build_node(child_id, level, NodeKind::Plain, &[], entries)?;
        child.set_parent_hint(NodeId::ROOT);
        let root = self.build_node(NodeId::ROOT, new_level, NodeKind::Root, ext, &[child_entry(child_id)])?;
        self.install_node(child)?;
        self.replace_node(NodeId::ROOT, root)?;
        tracing::debug!(child = %child_id, level = new_level, "root pushed down");
        Ok(child_id)
    }

    /// Rebalances an underfull node with a sibling.
    ///
    /// The pair is merged when the combined entries fit in one node, and the
    /// parent is then rebalanced in turn. Otherwise entries are redistributed
    /// and the parent separator replaced. A root left with a single child
    /// absorbs it.
    pub fn spill(&mut self, id: NodeId) -> Result<()> {
        let mut next = Some(id);
        while let Some(id) = next.take() {
            if id == NodeId::ROOT {
                self.collapse_root()?;
                self.split(NodeId::ROOT)?;
                break;
            }
            self.load(id, NodeId::NONE)?;
            if !self.node(id)?.unbalance(&self.config) {
                continue;
            }
            self.pending_spill = id;
            let parent = self.parent_of(id)?;
            let children = self.children(parent)?;
            let Some(j) = children.iter().position(|c| *c == id) else {
                return Err(self.corrupt(parent, format!("child {} missing", id)));
            };
            if children.len() < 2 {
                next = Some(parent);
                continue;
            }
            let (li, ri) = if j == 0 { (0, 1) } else { (j - 1, j) };
            let (left, right) = (children[li], children[ri]);

            let res = self.node(parent)?.key(ri);
            let separator = self.checked(parent, res)?;
            let (level, kind, ext, mut combined) = self.snapshot(left)?;
            let (rlevel, _, rext, mut right_entries) = self.snapshot(right)?;
            if rlevel != level {
                return Err(self.corrupt(
                    right,
                    format!("sibling levels {} and {}", level, rlevel),
                ));
            }
            // An internal node's first key stands for its parent separator.
            if level > 0 {
                if let Some(first) = right_entries.first_mut() {
                    first.key = Bytes::from(separator);
                }
            }
            combined.append(&mut right_entries);

            let total = NodeHeader::SIZE
                + ext.len()
                + combined.iter().map(NodeEntry::footprint).sum::<usize>();
            if total <= self.config.threshold(level) || combined.len() < 2 {
                let merged = self.build_node(left, level, kind, &ext, &combined)?;
                self.replace_node(left, merged)?;
                self.load(parent, NodeId::NONE)?;
                let res = self.node_mut(parent)?.delete_entry(ri);
                self.checked(parent, res)?;
                self.discard_node(right)?;
                tracing::debug!(left = %left, right = %right, parent = %parent, "siblings merged");
                next = Some(parent);
            } else {
                let k = balance_point(&combined);
                let l = self.build_node(left, level, kind, &ext, &combined[..k])?;
                let r = self.build_node(right, level, NodeKind::Plain, &rext, &combined[k..])?;
                // The parent is rebuilt before anything is replaced, so a
                // separator that no longer fits leaves all three untouched.
                let (plevel, pkind, pext, mut pentries) = self.snapshot(parent)?;
                let Some(sep) = pentries.get_mut(ri) else {
                    return Err(self.corrupt(parent, format!("separator {} missing", ri)));
                };
                sep.key = combined[k].key.clone();
                let p = self.build_node(parent, plevel, pkind, &pext, &pentries)?;
                self.replace_node(left, l)?;
                self.replace_node(right, r)?;
                self.replace_node(parent, p)?;
                tracing::debug!(left = %left, right = %right, at = k, "entries redistributed");
                self.split(left)?;
                self.split(right)?;
                self.split(parent)?;
            }
        }
        self.pending_spill = NodeId::NONE;
        Ok(())
    }

    /// Pulls the only child of an internal root up into the root.
    fn collapse_root(&mut self) -> Result<()> {
        loop {
            self.load(NodeId::ROOT, NodeId::NONE)?;
            let (level, count) = {
                let root = self.node(NodeId::ROOT)?;
                (root.level(), root.entry_count())
            };
            if level == 0 || count > 1 {
                return Ok(());
            }
            let ext = self.node(NodeId::ROOT)?.header_ext().to_vec();
            if count == 0 {
                let root = self.build_node(NodeId::ROOT, 0, NodeKind::Root, &ext, &[])?;
                self.replace_node(NodeId::ROOT, root)?;
                return Ok(());
            }
            let res = self.node(NodeId::ROOT)?.child(0);
            let child = self.checked(NodeId::ROOT, res)?;
            let (clevel, _, _, entries) = self.snapshot(child)?;
            let root = self.build_node(NodeId::ROOT, clevel, NodeKind::Root, &ext, &entries)?;
            self.replace_node(NodeId::ROOT, root)?;
            self.discard_node(child)?;
            tracing::debug!(child = %child, level = clevel, "root collapsed");
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Walks the whole tree verifying every node and the key ranges between
    /// parents and children.
    pub fn check(&mut self) -> Result<TreeCheck> {
        let mut report = TreeCheck::default();
        self.load(NodeId::ROOT, NodeId::NONE)?;
        report.height = self.node(NodeId::ROOT)?.level() + 1;

        let mut stack: Vec<(NodeId, NodeId, Option<u8>, Option<Vec<u8>>, Option<Vec<u8>>)> =
            vec![(NodeId::ROOT, NodeId::NONE, None, None, None)];
        while let Some((id, parent, want_level, lo, hi)) = stack.pop() {
            self.load(id, parent)?;
            let res = self.node_mut(id)?.check();
            if let Err(e) = res {
                if self.count_corrupt(id) {
                    tracing::warn!(node = %id, error = %e, errors = self.errors, "check failed");
                }
                return Err(e);
            }
            report.nodes += 1;
            if self.node(id)?.oversize(&self.config) {
                report.oversize += 1;
            }

            let (level, count) = {
                let node = self.node(id)?;
                (node.level(), node.entry_count())
            };
            if let Some(want) = want_level {
                if level != want {
                    return Err(self.corrupt(id, format!("level {} where {} expected", level, want)));
                }
            }
            let keys = {
                let node = self.node(id)?;
                (0..count).map(|i| node.key(i)).collect::<Result<Vec<_>>>()
            };
            let keys = self.checked(id, keys)?;
            if let (Some(lo), Some(first)) = (&lo, keys.first()) {
                if flatname::compare(lo, first).to_ordering().is_gt() {
                    return Err(self.corrupt(id, "first key below parent separator".to_string()));
                }
            }
            if let (Some(hi), Some(last)) = (&hi, keys.last()) {
                if flatname::compare(last, hi).to_ordering().is_ge() {
                    return Err(self.corrupt(id, "last key above next separator".to_string()));
                }
            }
            if level == 0 {
                report.entries += count;
                continue;
            }
            let children = self.children(id)?;
            for (i, child) in children.into_iter().enumerate() {
                let upper = keys.get(i + 1).cloned().or_else(|| hi.clone());
                stack.push((child, id, Some(level - 1), Some(keys[i].clone()), upper));
            }
        }
        Ok(report)
    }

    // =========================================================================
    // Content operations
    // =========================================================================

    /// Indexes a content object under `flatname`.
    ///
    /// Returns false if the name is already present.
    pub fn insert_content_object(
        &mut self,
        cobid: u64,
        cob: &[u8],
        parsed: &ParsedContentObject,
        flatname: &[u8],
    ) -> Result<bool> {
        let mut attempts = 0;
        loop {
            let at = self.lookup(flatname)?;
            if at.found {
                return Ok(false);
            }
            self.prepare_for_update(at.node)?;
            let res = {
                let node = self.node_mut(at.node)?;
                content::insert_content(node, at.index, cobid, cob, parsed, flatname)
            };
            match res {
                Ok(()) => {
                    self.split(at.node)?;
                    return Ok(true);
                }
                Err(CcnxError::NodeFull { .. })
                    if attempts < INSERT_SPLIT_ATTEMPTS && self.fits_alone(flatname) =>
                {
                    attempts += 1;
                    tracing::debug!(node = %at.node, attempts, "entry does not fit; splitting first");
                    self.force_split(at.node)?;
                }
                Err(e) => return Err(self.note_error(at.node, e)),
            }
        }
    }

    /// True if a content entry for `key` fits in an otherwise empty leaf.
    fn fits_alone(&self, key: &[u8]) -> bool {
        key.len() <= u16::MAX as usize
            && NodeHeader::SIZE + key.len() + CONTENT_PAYLOAD_SIZE + TRAILER_SIZE
                <= self.config.node_bytes_budget
    }

    /// Removes the entry for `flatname`. Returns false if it was absent.
    pub fn delete_key(&mut self, flatname: &[u8]) -> Result<bool> {
        let at = self.lookup(flatname)?;
        if !at.found {
            return Ok(false);
        }
        self.prepare_for_update(at.node)?;
        let res = self.node_mut(at.node)?.delete_entry(at.index);
        self.checked(at.node, res)?;
        if at.node != NodeId::ROOT {
            self.spill(at.node)?;
        }
        Ok(true)
    }

    /// Object id stored under `flatname`.
    pub fn cobid_of(&mut self, flatname: &[u8]) -> Result<Option<u64>> {
        let at = self.lookup(flatname)?;
        if !at.found {
            return Ok(None);
        }
        let res = content::cobid(self.node(at.node)?, at.index);
        self.checked(at.node, res).map(Some)
    }

    /// Flags the entry for `flatname` as stale so it no longer matches.
    pub fn mark_stale(&mut self, flatname: &[u8]) -> Result<bool> {
        let at = self.lookup(flatname)?;
        if !at.found {
            return Ok(false);
        }
        self.prepare_for_update(at.node)?;
        let res = {
            let node = self.node_mut(at.node)?;
            content::flags(node, at.index)
                .and_then(|f| content::set_flags(node, at.index, f | STALE))
        };
        self.checked(at.node, res)?;
        Ok(true)
    }

    /// Collects up to `limit` non-stale entries matching an interest, in
    /// key order.
    pub fn find_matches(
        &mut self,
        interest: &[u8],
        parsed: &ParsedInterest,
        limit: usize,
    ) -> Result<Vec<MatchHit>> {
        let mut prefix = Vec::new();
        content::interest_prefix(&mut prefix, interest, parsed)?;
        let start = self.lookup(&prefix)?;

        let mut hits = Vec::new();
        let mut key = Vec::new();
        let mut scratch = Vec::new();
        let (mut leaf, mut index) = (start.node, start.index);
        while hits.len() < limit {
            self.load(leaf, NodeId::NONE)?;
            let count = self.node(leaf)?.entry_count();
            while index < count && hits.len() < limit {
                let step = {
                    let node = self.node(leaf)?;
                    Self::scan_entry(node, index, &prefix, interest, parsed, &mut key, &mut scratch)
                };
                match self.checked(leaf, step)? {
                    Scan::Past => return Ok(hits),
                    Scan::Hit(cobid) => hits.push(MatchHit {
                        node: leaf,
                        index,
                        cobid,
                    }),
                    Scan::Miss => {}
                }
                index += 1;
            }
            match self.next_leaf(leaf)? {
                Some(next) => {
                    leaf = next;
                    index = 0;
                }
                None => break,
            }
        }
        Ok(hits)
    }

    fn scan_entry(
        node: &Node,
        index: usize,
        prefix: &[u8],
        interest: &[u8],
        parsed: &ParsedInterest,
        key: &mut Vec<u8>,
        scratch: &mut Vec<u8>,
    ) -> Result<Scan> {
        node.fetch_key(key, index)?;
        if content::past_prefix(prefix, key) {
            return Ok(Scan::Past);
        }
        let entry = content::entry(node, index)?;
        if entry.flags & STALE != 0 {
            return Ok(Scan::Miss);
        }
        if content::match_interest(node, index, interest, parsed, scratch)? {
            Ok(Scan::Hit(entry.cobid))
        } else {
            Ok(Scan::Miss)
        }
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "flush on drop failed");
        }
    }
}

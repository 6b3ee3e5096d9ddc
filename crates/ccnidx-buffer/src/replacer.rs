//! Node replacement policies.

use ccnidx_common::NodeId;
use std::collections::HashMap;

/// Trait for node replacement algorithms.
pub trait Replacer {
    /// Records that the given node was accessed.
    fn record_access(&mut self, node_id: NodeId);

    /// Marks a node as evictable or not.
    fn set_evictable(&mut self, node_id: NodeId, evictable: bool);

    /// Selects a victim for eviction.
    ///
    /// Returns None if no nodes are evictable.
    fn evict(&mut self) -> Option<NodeId>;

    /// Removes a node from the replacer.
    fn remove(&mut self, node_id: NodeId);

    /// Returns the number of evictable nodes.
    fn size(&self) -> usize;
}

/// Per-node bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    activity: u32,
    evictable: bool,
}

/// Least-recently-active replacement.
///
/// Every access bumps a node's activity counter; `decay` halves all
/// counters so that activity reflects recent use. The victim is the
/// evictable node with the lowest counter, ties broken by the lower id.
#[derive(Debug, Default)]
pub struct ActivityReplacer {
    slots: HashMap<NodeId, Slot>,
    evictable: usize,
}

impl ActivityReplacer {
    /// Creates an empty replacer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the activity counter of a node (0 if unknown).
    pub fn activity(&self, node_id: NodeId) -> u32 {
        self.slots.get(&node_id).map(|s| s.activity).unwrap_or(0)
    }

    /// Returns true if the node is currently evictable.
    pub fn is_evictable(&self, node_id: NodeId) -> bool {
        self.slots.get(&node_id).is_some_and(|s| s.evictable)
    }

    /// Halves every activity counter.
    ///
    /// Returns the evictable nodes whose activity reached zero, in id order.
    pub fn decay(&mut self) -> Vec<NodeId> {
        let mut idle = Vec::new();
        for (id, slot) in self.slots.iter_mut() {
            slot.activity /= 2;
            if slot.activity == 0 && slot.evictable {
                idle.push(*id);
            }
        }
        idle.sort();
        idle
    }

    /// Picks the lowest-activity node among `candidates` without removing it.
    pub fn coldest<I>(&self, candidates: I) -> Option<NodeId>
    where
        I: IntoIterator<Item = NodeId>,
    {
        candidates
            .into_iter()
            .min_by_key(|id| (self.activity(*id), *id))
    }
}

impl Replacer for ActivityReplacer {
    fn record_access(&mut self, node_id: NodeId) {
        let slot = self.slots.entry(node_id).or_default();
        slot.activity = slot.activity.saturating_add(1);
    }

    fn set_evictable(&mut self, node_id: NodeId, evictable: bool) {
        let slot = self.slots.entry(node_id).or_default();
        if slot.evictable != evictable {
            slot.evictable = evictable;
            if evictable {
                self.evictable += 1;
            } else {
                self.evictable -= 1;
            }
        }
    }

    fn evict(&mut self) -> Option<NodeId> {
        let victim = self
            .slots
            .iter()
            .filter(|(_, s)| s.evictable)
            .min_by_key(|(id, s)| (s.activity, **id))
            .map(|(id, _)| *id)?;

        if let Some(slot) = self.slots.get_mut(&victim) {
            slot.evictable = false;
            self.evictable -= 1;
        }
        tracing::trace!(node = %victim, "replacer selected victim");
        Some(victim)
    }

    fn remove(&mut self, node_id: NodeId) {
        if let Some(slot) = self.slots.remove(&node_id) {
            if slot.evictable {
                self.evictable -= 1;
            }
        }
    }

    fn size(&self) -> usize {
        self.evictable
    }
}

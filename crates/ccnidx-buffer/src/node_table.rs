//! Resident node table mapping node ids to live node records.

use ccnidx_common::NodeId;
use std::collections::HashMap;

/// Mapping from node id to a resident node record.
///
/// The table only provides lookup and enumeration; the owner decides when
/// records are created and evicted. Enumeration hands out a snapshot of ids
/// so callers may delete records while walking them.
#[derive(Debug)]
pub struct NodeTable<V> {
    entries: HashMap<NodeId, V>,
}

impl<V> Default for NodeTable<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V> NodeTable<V> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resident records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if the node is resident.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.entries.contains_key(&node_id)
    }

    /// Looks up a resident record.
    #[inline]
    pub fn get(&self, node_id: NodeId) -> Option<&V> {
        self.entries.get(&node_id)
    }

    /// Looks up a resident record mutably.
    #[inline]
    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut V> {
        self.entries.get_mut(&node_id)
    }

    /// Inserts a record, returning any record previously stored under the id.
    pub fn insert(&mut self, node_id: NodeId, value: V) -> Option<V> {
        self.entries.insert(node_id, value)
    }

    /// Removes a record.
    pub fn remove(&mut self, node_id: NodeId) -> Option<V> {
        self.entries.remove(&node_id)
    }

    /// Snapshot of the resident ids, sorted ascending.
    ///
    /// The snapshot stays valid while records are inserted or removed.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Iterates over resident records in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &V)> {
        self.entries.iter().map(|(id, v)| (*id, v))
    }

    /// Visits every record in id order, removing those for which `f`
    /// returns false. Removed records are handed back to the caller.
    pub fn sweep<F>(&mut self, mut f: F) -> Vec<(NodeId, V)>
    where
        F: FnMut(NodeId, &mut V) -> bool,
    {
        let mut removed = Vec::new();
        for id in self.ids() {
            let keep = match self.entries.get_mut(&id) {
                Some(v) => f(id, v),
                None => true,
            };
            if !keep {
                if let Some(v) = self.entries.remove(&id) {
                    removed.push((id, v));
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_table_insert_get() {
        let mut table = NodeTable::new();
        assert!(table.is_empty());

        assert!(table.insert(NodeId(1), "root").is_none());
        table.insert(NodeId(5), "leaf");

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(NodeId(1)), Some(&"root"));
        assert!(table.contains(NodeId(5)));
        assert!(!table.contains(NodeId(2)));
    }

    #[test]
    fn test_node_table_replace() {
        let mut table = NodeTable::new();
        table.insert(NodeId(3), 10);
        assert_eq!(table.insert(NodeId(3), 20), Some(10));
        assert_eq!(table.get(NodeId(3)), Some(&20));
    }

    #[test]
    fn test_node_table_get_mut_remove() {
        let mut table = NodeTable::new();
        table.insert(NodeId(2), vec![1u8]);

        table.get_mut(NodeId(2)).unwrap().push(2);
        assert_eq!(table.get(NodeId(2)).unwrap().len(), 2);

        assert_eq!(table.remove(NodeId(2)), Some(vec![1, 2]));
        assert!(table.remove(NodeId(2)).is_none());
    }

    #[test]
    fn test_node_table_ids_sorted() {
        let mut table = NodeTable::new();
        for id in [9, 3, 7, 1] {
            table.insert(NodeId(id), ());
        }
        assert_eq!(
            table.ids(),
            vec![NodeId(1), NodeId(3), NodeId(7), NodeId(9)]
        );
    }

    #[test]
    fn test_node_table_delete_during_enumeration() {
        let mut table = NodeTable::new();
        for id in 1..=6 {
            table.insert(NodeId(id), id * 10);
        }

        for id in table.ids() {
            if id.get() % 2 == 0 {
                table.remove(id);
            }
        }
        assert_eq!(table.ids(), vec![NodeId(1), NodeId(3), NodeId(5)]);
    }

    #[test]
    fn test_node_table_sweep() {
        let mut table = NodeTable::new();
        for id in 1..=5 {
            table.insert(NodeId(id), id);
        }

        let mut visited = Vec::new();
        let removed = table.sweep(|id, v| {
            visited.push(id);
            *v += 100;
            *v % 2 == 1
        });

        assert_eq!(visited.len(), 5);
        assert_eq!(removed, vec![(NodeId(2), 102), (NodeId(4), 104)]);
        assert_eq!(table.get(NodeId(3)), Some(&103));
        assert_eq!(table.len(), 3);
    }
}

//! Traversal bag: sorted, duplicate-free set of octree node ids, drained from the tail.
//! Popping the largest id favors recently created subtrees; sorted order keeps the duplicate check cheap.

use crate::octree::OctreeNodeId;

/// Capacity grows in steps of this many slots.
pub const GROW_BAG_BY: usize = 100;

#[derive(Debug, Default)]
pub struct TraversalBag {
    elements: Vec<OctreeNodeId>,
}

impl TraversalBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` keeping ascending order. Returns false if it was already present.
    pub fn insert(&mut self, id: OctreeNodeId) -> bool {
        let at = match self.elements.binary_search(&id) {
            Ok(_) => return false,
            Err(at) => at,
        };
        if self.elements.len() == self.elements.capacity() {
            self.elements.reserve_exact(GROW_BAG_BY);
        }
        self.elements.insert(at, id);
        true
    }

    /// Remove and return the tail (largest) id.
    pub fn extract(&mut self) -> Option<OctreeNodeId> {
        self.elements.pop()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, id: OctreeNodeId) -> bool {
        self.elements.binary_search(&id).is_ok()
    }

    pub fn capacity(&self) -> usize {
        self.elements.capacity()
    }

    /// Empty the bag and free its storage. Call before rebuilding the tree the ids point into.
    pub fn clear(&mut self) {
        self.elements = Vec::new();
    }
}

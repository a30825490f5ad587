//! Arena-backed octree. Nodes live in slots addressed by generational ids, so an id taken before a
//! subtree removal or a rebuild resolves to `None` instead of dangling.

/// Handle to an octree node. Ordered by slot index, then generation; deterministic across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OctreeNodeId {
    index: u32,
    generation: u32,
}

impl OctreeNodeId {
    pub(crate) const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Clone)]
pub struct OctreeNode {
    parent: Option<OctreeNodeId>,
    children: [Option<OctreeNodeId>; 8],
    depth: u8,
    color: Option<[u8; 3]>,
}

impl OctreeNode {
    fn new(parent: Option<OctreeNodeId>, depth: u8) -> Self {
        Self {
            parent,
            children: [None; 8],
            depth,
            color: None,
        }
    }

    pub fn parent(&self) -> Option<OctreeNodeId> {
        self.parent
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Leaf color; interior nodes have none.
    pub fn color(&self) -> Option<[u8; 3]> {
        self.color
    }

    pub fn child(&self, octant: usize) -> Option<OctreeNodeId> {
        self.children.get(octant).copied().flatten()
    }

    pub fn children(&self) -> impl Iterator<Item = OctreeNodeId> + '_ {
        self.children.iter().filter_map(|c| *c)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }
}

struct Slot {
    generation: u32,
    node: Option<OctreeNode>,
}

pub struct Octree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: OctreeNodeId,
    live: usize,
}

impl Octree {
    pub fn new() -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: OctreeNodeId::from_parts(0, 0),
            live: 0,
        };
        tree.root = tree.alloc(OctreeNode::new(None, 0));
        tree
    }

    pub fn root(&self) -> OctreeNodeId {
        self.root
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, id: OctreeNodeId) -> Option<&OctreeNode> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    fn get_mut(&mut self, id: OctreeNodeId) -> Option<&mut OctreeNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    pub fn is_live(&self, id: OctreeNodeId) -> bool {
        self.get(id).is_some()
    }

    /// Child of `parent` in `octant` (0..8), created if missing. `None` if `parent` is stale or octant out of range.
    pub fn add_child(&mut self, parent: OctreeNodeId, octant: usize) -> Option<OctreeNodeId> {
        if octant >= 8 {
            return None;
        }
        let node = self.get(parent)?;
        if let Some(existing) = node.child(octant) {
            return Some(existing);
        }
        let depth = node.depth.saturating_add(1);
        let child = self.alloc(OctreeNode::new(Some(parent), depth));
        if let Some(p) = self.get_mut(parent) {
            p.children[octant] = Some(child);
        }
        Some(child)
    }

    pub fn set_color(&mut self, id: OctreeNodeId, color: Option<[u8; 3]>) -> bool {
        match self.get_mut(id) {
            Some(node) => {
                node.color = color;
                true
            }
            None => false,
        }
    }

    /// Remove `id` and all its descendants. The root cannot be removed; use `clear`.
    pub fn remove_subtree(&mut self, id: OctreeNodeId) -> usize {
        if id == self.root {
            return 0;
        }
        let Some(parent) = self.get(id).map(|n| n.parent) else {
            return 0;
        };
        if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
            for slot in p.children.iter_mut() {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
        let mut removed = 0;
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.release(next) {
                stack.extend(node.children());
                removed += 1;
            }
        }
        removed
    }

    /// Drop every node and start over with a fresh root. All previous ids go stale.
    pub fn clear(&mut self) {
        let live: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_some())
            .map(|(i, _)| i as u32)
            .collect();
        for index in live {
            let generation = self.slots[index as usize].generation;
            self.release(OctreeNodeId { index, generation });
        }
        self.root = self.alloc(OctreeNode::new(None, 0));
    }

    fn alloc(&mut self, node: OctreeNode) -> OctreeNodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return OctreeNodeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        OctreeNodeId {
            index,
            generation: 0,
        }
    }

    fn release(&mut self, id: OctreeNodeId) -> Option<OctreeNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(node)
    }
}

impl Default for Octree {
    fn default() -> Self {
        Self::new()
    }
}

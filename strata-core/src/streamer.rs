//! Scene streamer: drains a traversal bag into `VoxelData` packets, one packet per call.

use crate::bag::TraversalBag;
use crate::node::NodeId;
use crate::octree::{Octree, OctreeNodeId};
use crate::packet::{self, PacketError, PacketKind, NODE_ID_LEN};

/// index(4) + generation(4) + depth(1) + has_color(1) + rgb(3).
pub const VOXEL_RECORD_LEN: usize = 13;

/// One serialized octree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelRecord {
    pub index: u32,
    pub generation: u32,
    pub depth: u8,
    pub color: Option<[u8; 3]>,
}

impl VoxelRecord {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.push(self.depth);
        match self.color {
            Some(rgb) => {
                out.push(1);
                out.extend_from_slice(&rgb);
            }
            None => out.extend_from_slice(&[0, 0, 0, 0]),
        }
    }

    fn read(b: &[u8]) -> Self {
        Self {
            index: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            generation: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            depth: b[8],
            color: (b[9] != 0).then(|| [b[10], b[11], b[12]]),
        }
    }
}

/// Decode the records of a `VoxelData` payload (kind byte stripped). Returns the sender and records.
pub fn decode_voxel_payload(payload: &[u8]) -> Result<(NodeId, Vec<VoxelRecord>), PacketError> {
    let (sender, n) = packet::unpack_node_id(payload)?;
    let body = &payload[n..];
    if body.len() % VOXEL_RECORD_LEN != 0 {
        return Err(PacketError::Truncated {
            what: "voxel record",
            need: VOXEL_RECORD_LEN,
            have: body.len() % VOXEL_RECORD_LEN,
        });
    }
    Ok((
        sender,
        body.chunks_exact(VOXEL_RECORD_LEN)
            .map(VoxelRecord::read)
            .collect(),
    ))
}

/// Owns the bag for one streaming session. Not shared across threads.
#[derive(Debug, Default)]
pub struct SceneStreamer {
    bag: TraversalBag,
    records_sent: u64,
}

impl SceneStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a changed node. Returns false if it was already queued.
    pub fn mark_dirty(&mut self, id: OctreeNodeId) -> bool {
        self.bag.insert(id)
    }

    pub fn pending(&self) -> usize {
        self.bag.len()
    }

    pub fn records_sent(&self) -> u64 {
        self.records_sent
    }

    /// Drop everything queued. Must be called before the tree is cleared or rebuilt.
    pub fn reset(&mut self) {
        self.bag.clear();
    }

    /// Build the next `[V][sender][records..]` packet of at most `max_len` bytes.
    /// Interior nodes without color queue their children. Stale ids are skipped.
    /// A `max_len` too small for one record is raised to fit exactly one, so `None` always means drained.
    pub fn next_packet(&mut self, tree: &Octree, sender: NodeId, max_len: usize) -> Option<Vec<u8>> {
        let header = 1 + NODE_ID_LEN;
        let max_len = max_len.max(header + VOXEL_RECORD_LEN);
        let mut out = Vec::with_capacity(max_len);
        out.push(PacketKind::VoxelData.as_byte());
        packet::pack_node_id(&mut out, sender);

        while out.len() + VOXEL_RECORD_LEN <= max_len {
            let Some(id) = self.bag.extract() else {
                break;
            };
            let Some(node) = tree.get(id) else {
                tracing::debug!(?id, "skipping stale octree id");
                continue;
            };
            VoxelRecord {
                index: id.index(),
                generation: id.generation(),
                depth: node.depth(),
                color: node.color(),
            }
            .write_to(&mut out);
            self.records_sent += 1;
            if node.color().is_none() {
                for child in node.children() {
                    self.bag.insert(child);
                }
            }
        }
        (out.len() > header).then_some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MAX_PACKET_SIZE;

    fn sample_tree() -> (Octree, OctreeNodeId, OctreeNodeId, OctreeNodeId) {
        let mut tree = Octree::new();
        let root = tree.root();
        let a = tree.add_child(root, 0).unwrap();
        let b = tree.add_child(root, 5).unwrap();
        tree.set_color(a, Some([10, 20, 30]));
        tree.set_color(b, Some([40, 50, 60]));
        (tree, root, a, b)
    }

    #[test]
    fn streams_root_then_children() {
        let (tree, root, a, b) = sample_tree();
        let mut streamer = SceneStreamer::new();
        streamer.mark_dirty(root);
        let packet = streamer
            .next_packet(&tree, NodeId(3), MAX_PACKET_SIZE)
            .unwrap();
        assert_eq!(packet[0], b'V');
        let (sender, records) = decode_voxel_payload(&packet[1..]).unwrap();
        assert_eq!(sender, NodeId(3));
        let indices: Vec<u32> = records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![root.index(), b.index(), a.index()]);
        assert_eq!(records[2].color, Some([10, 20, 30]));
        assert_eq!(records[0].color, None);
        assert_eq!(streamer.pending(), 0);
        assert!(streamer.next_packet(&tree, NodeId(3), MAX_PACKET_SIZE).is_none());
    }

    #[test]
    fn respects_max_len() {
        let (tree, root, _, _) = sample_tree();
        let mut streamer = SceneStreamer::new();
        streamer.mark_dirty(root);
        let max = 1 + NODE_ID_LEN + VOXEL_RECORD_LEN;
        let first = streamer.next_packet(&tree, NodeId(1), max).unwrap();
        assert_eq!(first.len(), max);
        assert_eq!(streamer.pending(), 2);
        assert!(streamer.next_packet(&tree, NodeId(1), max).is_some());
        assert!(streamer.next_packet(&tree, NodeId(1), max).is_some());
        assert!(streamer.next_packet(&tree, NodeId(1), max).is_none());
        assert_eq!(streamer.records_sent(), 3);
    }

    #[test]
    fn undersized_max_len_still_makes_progress() {
        let (tree, _, a, _) = sample_tree();
        let mut streamer = SceneStreamer::new();
        streamer.mark_dirty(a);
        let packet = streamer.next_packet(&tree, NodeId(1), 4).unwrap();
        assert_eq!(packet.len(), 1 + NODE_ID_LEN + VOXEL_RECORD_LEN);
        assert_eq!(streamer.pending(), 0);
        assert!(streamer.next_packet(&tree, NodeId(1), 4).is_none());
    }

    #[test]
    fn stale_ids_are_skipped() {
        let (mut tree, _, a, b) = sample_tree();
        let mut streamer = SceneStreamer::new();
        streamer.mark_dirty(a);
        streamer.mark_dirty(b);
        tree.remove_subtree(b);
        let packet = streamer
            .next_packet(&tree, NodeId(1), MAX_PACKET_SIZE)
            .unwrap();
        let (_, records) = decode_voxel_payload(&packet[1..]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].index, a.index());
    }

    #[test]
    fn reset_before_rebuild() {
        let (mut tree, root, _, _) = sample_tree();
        let mut streamer = SceneStreamer::new();
        streamer.mark_dirty(root);
        streamer.reset();
        tree.clear();
        assert_eq!(streamer.pending(), 0);
        assert!(streamer.next_packet(&tree, NodeId(1), MAX_PACKET_SIZE).is_none());
    }
}

//! Strata core: node directory, liveness protocol and octree traversal.
//! Host-driven: no sockets or timers; host passes datagrams and clock readings and receives actions.

pub mod bag;
pub mod endpoint;
pub mod node;
pub mod node_list;
pub mod octree;
pub mod packet;
pub mod streamer;

pub use bag::TraversalBag;
pub use endpoint::{local_outward_address, Endpoint, EndpointError};
pub use node::{Node, NodeId, NodeKind, NodeState};
pub use node_list::{DirectoryStats, NodeList, OutboundAction};
pub use octree::{Octree, OctreeNodeId};
pub use packet::{PacketError, PacketKind, PeerEntry, MAX_PACKET_SIZE};
pub use streamer::SceneStreamer;

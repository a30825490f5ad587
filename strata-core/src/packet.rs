//! Datagram layout: 1-byte kind + payload. Sender-addressed payloads start with the sender's node id.

use crate::endpoint::{Endpoint, EndpointError, ENCODED_LEN};
use crate::node::{NodeId, NodeKind};

/// Size of an encoded node id (little-endian u16).
pub const NODE_ID_LEN: usize = 2;

/// Size of one peer-list entry: kind + id + public + local.
pub const PEER_ENTRY_LEN: usize = 1 + NODE_ID_LEN + 2 * ENCODED_LEN;

/// Largest datagram we send or accept.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Leading discriminant of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Aggregated avatar state relayed by the avatar mixer.
    BulkAvatarData,
    /// One avatar's head/pose update. Sender-addressed.
    HeadData,
    /// Serialized octree nodes. Sender-addressed.
    VoxelData,
    Ping,
    Pong,
    /// Peer list from the domain authority, optionally followed by our assigned id.
    DomainList,
    /// Check-in sent to the domain authority.
    DomainReportForDuty,
    /// Generic application payload. Sender-addressed.
    AgentData,
}

impl PacketKind {
    pub fn as_byte(self) -> u8 {
        match self {
            PacketKind::BulkAvatarData => b'X',
            PacketKind::HeadData => b'H',
            PacketKind::VoxelData => b'V',
            PacketKind::Ping => b'P',
            PacketKind::Pong => b'R',
            PacketKind::DomainList => b'D',
            PacketKind::DomainReportForDuty => b'C',
            PacketKind::AgentData => b'A',
        }
    }

    /// Map a leading byte to its kind; `None` for anything outside the closed set.
    pub fn classify(b: u8) -> Option<Self> {
        Some(match b {
            b'X' => PacketKind::BulkAvatarData,
            b'H' => PacketKind::HeadData,
            b'V' => PacketKind::VoxelData,
            b'P' => PacketKind::Ping,
            b'R' => PacketKind::Pong,
            b'D' => PacketKind::DomainList,
            b'C' => PacketKind::DomainReportForDuty,
            b'A' => PacketKind::AgentData,
            _ => return None,
        })
    }

    pub fn is_sender_addressed(self) -> bool {
        matches!(
            self,
            PacketKind::HeadData | PacketKind::VoxelData | PacketKind::AgentData
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("empty datagram")]
    Empty,
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("unknown node kind byte {0:#04x}")]
    UnknownNodeKind(u8),
    #[error("peer list has {0} stray trailing bytes")]
    TrailingBytes(usize),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Split a datagram into its kind byte and payload.
pub fn split_packet(bytes: &[u8]) -> Result<(u8, &[u8]), PacketError> {
    match bytes.split_first() {
        Some((kind, payload)) => Ok((*kind, payload)),
        None => Err(PacketError::Empty),
    }
}

/// Append `id` to `out`. Returns bytes written.
pub fn pack_node_id(out: &mut Vec<u8>, id: NodeId) -> usize {
    out.extend_from_slice(&id.0.to_le_bytes());
    NODE_ID_LEN
}

/// Read a node id from the front of `bytes`. Returns the id and bytes consumed.
pub fn unpack_node_id(bytes: &[u8]) -> Result<(NodeId, usize), PacketError> {
    if bytes.len() < NODE_ID_LEN {
        return Err(PacketError::Truncated {
            what: "node id",
            need: NODE_ID_LEN,
            have: bytes.len(),
        });
    }
    Ok((NodeId(u16::from_le_bytes([bytes[0], bytes[1]])), NODE_ID_LEN))
}

/// `[kind][sender id][body]`.
pub fn build_sender_addressed(kind: PacketKind, sender: NodeId, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + NODE_ID_LEN + body.len());
    out.push(kind.as_byte());
    pack_node_id(&mut out, sender);
    out.extend_from_slice(body);
    out
}

/// One entry of the domain's peer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: NodeId,
    pub kind: NodeKind,
    pub public_endpoint: Endpoint,
    pub local_endpoint: Endpoint,
}

impl PeerEntry {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.kind.as_byte());
        pack_node_id(out, self.id);
        self.public_endpoint.write_to(out);
        self.local_endpoint.write_to(out);
    }

    fn read(bytes: &[u8]) -> Result<Self, PacketError> {
        let kind = NodeKind::from_byte(bytes[0]).ok_or(PacketError::UnknownNodeKind(bytes[0]))?;
        let (id, n) = unpack_node_id(&bytes[1..])?;
        let public_endpoint = Endpoint::decode(&bytes[1 + n..])?;
        let local_endpoint = Endpoint::decode(&bytes[1 + n + ENCODED_LEN..])?;
        Ok(Self {
            id,
            kind,
            public_endpoint,
            local_endpoint,
        })
    }
}

/// Decoded `DomainList` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerList {
    pub entries: Vec<PeerEntry>,
    /// Id the domain assigned to the receiver, if it sent one.
    pub owner_id: Option<NodeId>,
}

/// Build a full `DomainList` datagram.
pub fn encode_peer_list(entries: &[PeerEntry], owner_id: Option<NodeId>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + entries.len() * PEER_ENTRY_LEN + NODE_ID_LEN);
    out.push(PacketKind::DomainList.as_byte());
    for entry in entries {
        entry.write_to(&mut out);
    }
    if let Some(id) = owner_id {
        pack_node_id(&mut out, id);
    }
    out
}

/// Decode a `DomainList` payload (kind byte already stripped).
/// The trailing owner id is present exactly when `len % 15 == 2`.
pub fn decode_peer_list(payload: &[u8]) -> Result<PeerList, PacketError> {
    let trailing = payload.len() % PEER_ENTRY_LEN;
    let owner_id = match trailing {
        0 => None,
        NODE_ID_LEN => Some(unpack_node_id(&payload[payload.len() - NODE_ID_LEN..])?.0),
        n => return Err(PacketError::TrailingBytes(n)),
    };
    let entries = payload[..payload.len() - trailing]
        .chunks_exact(PEER_ENTRY_LEN)
        .map(PeerEntry::read)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PeerList { entries, owner_id })
}

//! Node identity, kinds and per-node liveness state.

use std::fmt;
use std::time::Instant;

use crate::endpoint::Endpoint;

/// Id assigned by the domain authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u16);

impl NodeId {
    /// This process has not been registered by the domain yet.
    pub const UNKNOWN: NodeId = NodeId(u16::MAX);

    pub fn is_known(&self) -> bool {
        *self != Self::UNKNOWN
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("unknown")
        }
    }
}

/// Closed set of node roles. One byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    Avatar,
    AvatarMixer,
    AudioMixer,
    VoxelServer,
    DomainServer,
    AudioInjector,
}

impl NodeKind {
    pub const ALL: [NodeKind; 6] = [
        NodeKind::Avatar,
        NodeKind::AvatarMixer,
        NodeKind::AudioMixer,
        NodeKind::VoxelServer,
        NodeKind::DomainServer,
        NodeKind::AudioInjector,
    ];

    pub fn as_byte(self) -> u8 {
        match self {
            NodeKind::Avatar => b'I',
            NodeKind::AvatarMixer => b'W',
            NodeKind::AudioMixer => b'M',
            NodeKind::VoxelServer => b'V',
            NodeKind::DomainServer => b'D',
            NodeKind::AudioInjector => b'A',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_byte() == b)
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Avatar => "avatar",
            NodeKind::AvatarMixer => "avatar-mixer",
            NodeKind::AudioMixer => "audio-mixer",
            NodeKind::VoxelServer => "voxel-server",
            NodeKind::DomainServer => "domain-server",
            NodeKind::AudioInjector => "audio-injector",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reachability state derived from the ping protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Known, never pinged.
    Unconfirmed,
    /// Pinged, no pong yet.
    Probing,
    /// A pong confirmed `active_endpoint`.
    Active,
}

/// A peer known to the directory.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    public_endpoint: Endpoint,
    local_endpoint: Endpoint,
    active_endpoint: Option<Endpoint>,
    last_heard: Instant,
    pinged: bool,
    ping_ms: Option<u32>,
    bytes_received: u64,
    /// Ping cycle in which `active_endpoint` was last set.
    activated_in_cycle: u64,
}

impl Node {
    pub fn new(
        id: NodeId,
        kind: NodeKind,
        public_endpoint: Endpoint,
        local_endpoint: Endpoint,
        now: Instant,
    ) -> Self {
        Self {
            id,
            kind,
            public_endpoint,
            local_endpoint,
            active_endpoint: None,
            last_heard: now,
            pinged: false,
            ping_ms: None,
            bytes_received: 0,
            activated_in_cycle: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn public_endpoint(&self) -> Endpoint {
        self.public_endpoint
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local_endpoint
    }

    pub fn active_endpoint(&self) -> Option<Endpoint> {
        self.active_endpoint
    }

    pub fn last_heard(&self) -> Instant {
        self.last_heard
    }

    /// Round-trip time of the last answered ping.
    pub fn ping_ms(&self) -> Option<u32> {
        self.ping_ms
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn state(&self) -> NodeState {
        match (self.active_endpoint, self.pinged) {
            (Some(_), _) => NodeState::Active,
            (None, true) => NodeState::Probing,
            (None, false) => NodeState::Unconfirmed,
        }
    }

    /// True if `e` is any address this node is known by.
    pub fn matches_endpoint(&self, e: &Endpoint) -> bool {
        self.public_endpoint == *e || self.local_endpoint == *e || self.active_endpoint == Some(*e)
    }

    pub fn touch(&mut self, now: Instant) {
        if now > self.last_heard {
            self.last_heard = now;
        }
    }

    pub(crate) fn record_bytes(&mut self, n: usize) {
        self.bytes_received = self.bytes_received.saturating_add(n as u64);
    }

    pub(crate) fn mark_pinged(&mut self) {
        self.pinged = true;
    }

    pub(crate) fn set_ping_ms(&mut self, ms: u32) {
        self.ping_ms = Some(ms);
    }

    pub(crate) fn activate(&mut self, endpoint: Endpoint, cycle: u64) {
        self.active_endpoint = Some(endpoint);
        self.activated_in_cycle = cycle;
    }

    pub(crate) fn activated_in_cycle(&self) -> u64 {
        self.activated_in_cycle
    }

    /// Drop the confirmed path; the ping protocol will probe again.
    pub fn clear_active(&mut self) {
        self.active_endpoint = None;
    }

    pub(crate) fn set_kind(&mut self, kind: NodeKind) {
        self.kind = kind;
    }

    /// Replace endpoints. Returns true if either changed, in which case the node goes back to `Unconfirmed`.
    pub(crate) fn update_endpoints(&mut self, public: Endpoint, local: Endpoint) -> bool {
        if self.public_endpoint == public && self.local_endpoint == local {
            return false;
        }
        self.public_endpoint = public;
        self.local_endpoint = local;
        self.active_endpoint = None;
        self.pinged = false;
        self.ping_ms = None;
        true
    }
}

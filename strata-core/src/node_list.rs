//! Node directory: the registry of known peers plus the pure halves of the check-in, ping and
//! silent-removal protocols. The host feeds datagrams and clock readings and sends the returned actions.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::node::{Node, NodeId, NodeKind, NodeState};
use crate::packet::{self, PacketKind, PeerEntry};

/// Ping payload: microseconds since the directory's epoch, little-endian.
const PING_STAMP_LEN: usize = 8;

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    Send(Endpoint, Vec<u8>),
}

/// Read-only counters for statistics displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub nodes: usize,
    pub unconfirmed: usize,
    pub probing: usize,
    pub active: usize,
    pub by_kind: BTreeMap<NodeKind, usize>,
    pub packets_dispatched: u64,
    pub silent_removals: u64,
}

pub struct NodeList {
    owner_kind: NodeKind,
    owner_id: NodeId,
    /// Kinds we ask the domain to tell us about.
    interests: Vec<NodeKind>,
    nodes: HashMap<NodeId, Node>,
    epoch: Instant,
    ping_cycle: u64,
    packets_dispatched: u64,
    silent_removals: u64,
}

impl NodeList {
    pub fn new(owner_kind: NodeKind) -> Self {
        Self {
            owner_kind,
            owner_id: NodeId::UNKNOWN,
            interests: Vec::new(),
            nodes: HashMap::new(),
            epoch: Instant::now(),
            ping_cycle: 0,
            packets_dispatched: 0,
            silent_removals: 0,
        }
    }

    pub fn with_interests(mut self, kinds: impl IntoIterator<Item = NodeKind>) -> Self {
        self.interests = kinds.into_iter().collect();
        self
    }

    pub fn owner_kind(&self) -> NodeKind {
        self.owner_kind
    }

    pub fn owner_id(&self) -> NodeId {
        self.owner_id
    }

    pub fn set_owner_id(&mut self, id: NodeId) {
        if self.owner_id != id {
            info!(owner_id = %id, "assigned node id");
            self.owner_id = id;
            // We may have been listed as a peer before the domain told us who we are.
            self.nodes.remove(&id);
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// The node of `kind`, assuming the deployment runs at most one. With several, any one of them.
    pub fn sole_of_kind(&self, kind: NodeKind) -> Option<&Node> {
        self.nodes.values().find(|n| n.kind() == kind)
    }

    /// Refresh liveness of a node. Returns false if unknown.
    pub fn touch(&mut self, id: NodeId, now: Instant) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.touch(now);
                true
            }
            None => false,
        }
    }

    /// Refresh liveness of the sole node of `kind`, if any.
    pub fn touch_sole_of_kind(&mut self, kind: NodeKind, now: Instant) -> bool {
        match self.nodes.values_mut().find(|n| n.kind() == kind) {
            Some(node) => {
                node.touch(now);
                true
            }
            None => false,
        }
    }

    /// Forget the confirmed path so the ping protocol probes the node again.
    pub fn clear_active(&mut self, id: NodeId) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.clear_active();
                true
            }
            None => false,
        }
    }

    /// Use the public endpoint without waiting for a pong (for peers that never answer pings).
    pub fn activate_public(&mut self, id: NodeId) -> Option<Endpoint> {
        let cycle = self.ping_cycle;
        let node = self.nodes.get_mut(&id)?;
        if node.active_endpoint().is_none() {
            node.activate(node.public_endpoint(), cycle);
        }
        node.active_endpoint()
    }

    /// Merge a batch from the domain. Existing nodes keep their active endpoint unless an endpoint changed.
    pub fn upsert_from_peer_list(&mut self, entries: &[PeerEntry], now: Instant) {
        for entry in entries {
            if entry.id == self.owner_id || !entry.id.is_known() {
                continue;
            }
            match self.nodes.entry(entry.id) {
                Entry::Occupied(mut o) => {
                    let node = o.get_mut();
                    node.set_kind(entry.kind);
                    if node.update_endpoints(entry.public_endpoint, entry.local_endpoint) {
                        info!(
                            id = %entry.id,
                            public = %entry.public_endpoint,
                            local = %entry.local_endpoint,
                            "node endpoints changed, re-probing"
                        );
                    }
                    // Mixers and servers never answer on the directory path; the domain vouches for them.
                    if matches!(entry.kind, NodeKind::AudioMixer | NodeKind::VoxelServer) {
                        node.touch(now);
                    }
                }
                Entry::Vacant(v) => {
                    info!(
                        id = %entry.id,
                        kind = %entry.kind,
                        public = %entry.public_endpoint,
                        local = %entry.local_endpoint,
                        "added node"
                    );
                    v.insert(Node::new(
                        entry.id,
                        entry.kind,
                        entry.public_endpoint,
                        entry.local_endpoint,
                        now,
                    ));
                }
            }
        }
    }

    /// `[C][own kind][public][local][interest count][interest kinds..]`.
    pub fn check_in_packet(&self, self_public: Endpoint, self_local: Endpoint) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.interests.len());
        out.push(PacketKind::DomainReportForDuty.as_byte());
        out.push(self.owner_kind.as_byte());
        self_public.write_to(&mut out);
        self_local.write_to(&mut out);
        out.push(self.interests.len() as u8);
        out.extend(self.interests.iter().map(|k| k.as_byte()));
        out
    }

    /// Remove every node silent for longer than `timeout`. Returns the evicted nodes.
    pub fn sweep_silent(&mut self, now: Instant, timeout: Duration) -> Vec<Node> {
        let mut removed = Vec::new();
        self.nodes.retain(|_, node| {
            if now.saturating_duration_since(node.last_heard()) > timeout {
                removed.push(node.clone());
                false
            } else {
                true
            }
        });
        self.silent_removals += removed.len() as u64;
        for node in &removed {
            info!(id = %node.id(), kind = %node.kind(), "removed silent node");
        }
        removed
    }

    /// Start a ping cycle: ping public and local endpoints of every node without an active endpoint.
    pub fn ping_unresolved(&mut self, now: Instant) -> Vec<OutboundAction> {
        self.ping_cycle += 1;
        let mut ping = Vec::with_capacity(1 + PING_STAMP_LEN);
        ping.push(PacketKind::Ping.as_byte());
        ping.extend_from_slice(&self.stamp(now).to_le_bytes());

        let mut actions = Vec::new();
        for node in self.nodes.values_mut() {
            if node.active_endpoint().is_some() {
                continue;
            }
            node.mark_pinged();
            actions.push(OutboundAction::Send(node.public_endpoint(), ping.clone()));
            if node.local_endpoint() != node.public_endpoint() {
                actions.push(OutboundAction::Send(node.local_endpoint(), ping.clone()));
            }
        }
        if !actions.is_empty() {
            debug!(cycle = self.ping_cycle, pings = actions.len(), "pinging unresolved nodes");
        }
        actions
    }

    /// Entry point for datagrams the host does not handle itself.
    pub fn dispatch(&mut self, sender: Endpoint, datagram: &[u8], now: Instant) -> Vec<OutboundAction> {
        let (byte, payload) = match packet::split_packet(datagram) {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };
        let Some(kind) = PacketKind::classify(byte) else {
            debug!(byte, %sender, "ignoring unknown packet kind");
            return Vec::new();
        };
        self.packets_dispatched += 1;
        let matched = self.refresh_sender(sender, datagram.len(), now);

        match kind {
            PacketKind::DomainList => match packet::decode_peer_list(payload) {
                Ok(list) => {
                    if let Some(id) = list.owner_id {
                        self.set_owner_id(id);
                    }
                    self.upsert_from_peer_list(&list.entries, now);
                }
                Err(e) => warn!(%sender, error = %e, "bad peer list"),
            },
            PacketKind::Ping => {
                let mut pong = Vec::with_capacity(datagram.len());
                pong.push(PacketKind::Pong.as_byte());
                pong.extend_from_slice(payload);
                return vec![OutboundAction::Send(sender, pong)];
            }
            PacketKind::Pong => self.handle_pong(sender, payload, now),
            k if k.is_sender_addressed() => {
                self.handle_sender_addressed(k, sender, payload, datagram.len(), matched, now)
            }
            _ => {}
        }
        Vec::new()
    }

    pub fn stats(&self) -> DirectoryStats {
        let mut stats = DirectoryStats {
            nodes: self.nodes.len(),
            packets_dispatched: self.packets_dispatched,
            silent_removals: self.silent_removals,
            ..Default::default()
        };
        for node in self.nodes.values() {
            match node.state() {
                NodeState::Unconfirmed => stats.unconfirmed += 1,
                NodeState::Probing => stats.probing += 1,
                NodeState::Active => stats.active += 1,
            }
            *stats.by_kind.entry(node.kind()).or_default() += 1;
        }
        stats
    }

    fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    fn refresh_sender(&mut self, sender: Endpoint, len: usize, now: Instant) -> bool {
        match self.nodes.values_mut().find(|n| n.matches_endpoint(&sender)) {
            Some(node) => {
                node.touch(now);
                node.record_bytes(len);
                true
            }
            None => false,
        }
    }

    fn handle_pong(&mut self, sender: Endpoint, payload: &[u8], now: Instant) {
        let cycle = self.ping_cycle;
        let rtt_ms = payload
            .get(..PING_STAMP_LEN)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .map(|sent| self.stamp(now).saturating_sub(sent) / 1000);
        let Some(node) = self
            .nodes
            .values_mut()
            .find(|n| n.public_endpoint() == sender || n.local_endpoint() == sender)
        else {
            debug!(%sender, "pong from unknown endpoint");
            return;
        };
        if let Some(ms) = rtt_ms {
            node.set_ping_ms(ms.min(u32::MAX as u64) as u32);
        }
        match node.active_endpoint() {
            None => {
                node.activate(sender, cycle);
                info!(id = %node.id(), active = %sender, "node reachable");
            }
            // Both paths answered within one cycle: prefer the intra-network one.
            Some(active)
                if active == node.public_endpoint()
                    && sender == node.local_endpoint()
                    && active != sender
                    && node.activated_in_cycle() == cycle =>
            {
                node.activate(sender, cycle);
                info!(id = %node.id(), active = %sender, "switched to local endpoint");
            }
            Some(_) => {}
        }
    }

    fn handle_sender_addressed(
        &mut self,
        kind: PacketKind,
        sender: Endpoint,
        payload: &[u8],
        len: usize,
        matched: bool,
        now: Instant,
    ) {
        let id = match packet::unpack_node_id(payload) {
            Ok((id, _)) => id,
            Err(e) => {
                debug!(%sender, error = %e, "sender-addressed packet without id");
                return;
            }
        };
        if id == self.owner_id || !id.is_known() {
            return;
        }
        match self.nodes.entry(id) {
            Entry::Occupied(mut o) => {
                if !matched {
                    let node = o.get_mut();
                    node.touch(now);
                    node.record_bytes(len);
                }
            }
            Entry::Vacant(v) => {
                // Only voxel servers stream voxel data; everything else comes from avatars.
                let node_kind = match kind {
                    PacketKind::VoxelData => NodeKind::VoxelServer,
                    _ => NodeKind::Avatar,
                };
                info!(%id, kind = %node_kind, %sender, "added node from first packet");
                let mut node = Node::new(id, node_kind, sender, sender, now);
                node.record_bytes(len);
                v.insert(node);
            }
        }
    }
}

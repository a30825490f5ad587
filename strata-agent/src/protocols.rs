//! Background protocols around the shared node list: domain check-in, silent node removal,
//! NAT punch pings, and datagram reception. Each runs as its own task until shutdown is signalled.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_core::{
    local_outward_address, Endpoint, NodeKind, NodeList, OutboundAction, PacketKind, MAX_PACKET_SIZE,
};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

pub type SharedNodeList = Arc<Mutex<NodeList>>;

/// How often silent nodes are looked for.
pub const SILENT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Sleep for `interval`. Returns false once shutdown is signalled (or its sender is gone).
async fn wait_or_shutdown(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

pub async fn send_all(socket: &UdpSocket, actions: Vec<OutboundAction>) {
    for OutboundAction::Send(to, bytes) in actions {
        if let Err(e) = socket.send_to(&bytes, SocketAddr::from(to)).await {
            warn!(%to, error = %e, "send failed");
        }
    }
}

/// Report to the domain authority every `interval`. Fire-and-forget; replies arrive via `recv_loop`.
/// `local_override` replaces the scanned local endpoint when set.
pub async fn check_in_loop(
    nodes: SharedNodeList,
    socket: Arc<UdpSocket>,
    domain: Endpoint,
    listen_port: u16,
    local_override: Option<Endpoint>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(%domain, "check-in task started");
    // The domain fills in our public address from the datagram source.
    let public = Endpoint::new(Ipv4Addr::UNSPECIFIED, listen_port);
    loop {
        let local = local_override.unwrap_or_else(|| {
            Endpoint::new(
                local_outward_address().unwrap_or(Ipv4Addr::LOCALHOST),
                listen_port,
            )
        });
        let packet = nodes.lock().await.check_in_packet(public, local);
        if let Err(e) = socket.send_to(&packet, SocketAddr::from(domain)).await {
            warn!(%domain, error = %e, "check-in send failed");
        }
        if !wait_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }
    info!("check-in task stopped");
}

/// Drop nodes not heard from within `timeout`, checking every `interval`.
pub async fn silent_sweep_loop(
    nodes: SharedNodeList,
    timeout: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(?timeout, "silent node removal task started");
    while wait_or_shutdown(interval, &mut shutdown).await {
        let removed = nodes.lock().await.sweep_silent(Instant::now(), timeout);
        if !removed.is_empty() {
            debug!(count = removed.len(), "swept silent nodes");
        }
    }
    info!("silent node removal task stopped");
}

/// Ping every node without an active endpoint on both of its addresses, every `interval`.
pub async fn ping_loop(
    nodes: SharedNodeList,
    socket: Arc<UdpSocket>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("ping task started");
    loop {
        let pings = nodes.lock().await.ping_unresolved(Instant::now());
        send_all(&socket, pings).await;
        if !wait_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }
    info!("ping task stopped");
}

/// Receive datagrams. Bulk avatar data only proves the avatar mixer is alive, so it is handled
/// inline; everything else goes through the node list's dispatch.
pub async fn recv_loop(
    nodes: SharedNodeList,
    socket: Arc<UdpSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, from) = tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let SocketAddr::V4(from) = from else {
            debug!(%from, "ignoring non-IPv4 sender");
            continue;
        };
        let datagram = &buf[..n];
        let now = Instant::now();
        let replies = {
            let mut nodes = nodes.lock().await;
            match datagram.first().copied().and_then(PacketKind::classify) {
                Some(PacketKind::BulkAvatarData) => {
                    nodes.touch_sole_of_kind(NodeKind::AvatarMixer, now);
                    Vec::new()
                }
                _ => nodes.dispatch(Endpoint::from(from), datagram, now),
            }
        };
        send_all(&socket, replies).await;
    }
    info!("receive task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::packet::{encode_peer_list, PeerEntry};
    use strata_core::{NodeId, NodeState};

    async fn loopback() -> (Arc<UdpSocket>, Endpoint) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
            panic!("expected IPv4");
        };
        (Arc::new(socket), Endpoint::from(addr))
    }

    fn shared(list: NodeList) -> SharedNodeList {
        Arc::new(Mutex::new(list))
    }

    /// Answer pings like a peer would, using its own node list.
    async fn run_peer(socket: Arc<UdpSocket>, shutdown: watch::Receiver<bool>) {
        let nodes = shared(NodeList::new(NodeKind::AvatarMixer));
        recv_loop(nodes, socket, shutdown).await;
    }

    #[tokio::test]
    async fn ping_activates_peer_over_loopback() {
        let (socket, _) = loopback().await;
        let (peer_socket, peer) = loopback().await;
        let nodes = shared(NodeList::new(NodeKind::Avatar));
        nodes.lock().await.upsert_from_peer_list(
            &[PeerEntry {
                id: NodeId(9),
                kind: NodeKind::AvatarMixer,
                public_endpoint: peer,
                local_endpoint: peer,
            }],
            Instant::now(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(run_peer(peer_socket, shutdown_rx.clone())),
            tokio::spawn(recv_loop(nodes.clone(), socket.clone(), shutdown_rx.clone())),
            tokio::spawn(ping_loop(
                nodes.clone(),
                socket.clone(),
                Duration::from_millis(50),
                shutdown_rx.clone(),
            )),
        ];

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let active = nodes
                .lock()
                .await
                .sole_of_kind(NodeKind::AvatarMixer)
                .and_then(|n| n.active_endpoint());
            if active.is_some() {
                assert_eq!(active, Some(peer));
                break;
            }
            assert!(Instant::now() < deadline, "peer never became active");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            nodes.lock().await.get(NodeId(9)).map(|n| n.state()),
            Some(NodeState::Active)
        );

        shutdown_tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn domain_list_reaches_node_list() {
        let (socket, me) = loopback().await;
        let (domain_socket, _) = loopback().await;
        let nodes = shared(NodeList::new(NodeKind::Avatar));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let recv = tokio::spawn(recv_loop(nodes.clone(), socket, shutdown_rx));

        let packet = encode_peer_list(
            &[PeerEntry {
                id: NodeId(7),
                kind: NodeKind::VoxelServer,
                public_endpoint: "1.2.3.4:100".parse().unwrap(),
                local_endpoint: "10.0.0.5:100".parse().unwrap(),
            }],
            Some(NodeId(2)),
        );
        domain_socket
            .send_to(&packet, SocketAddr::from(me))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while nodes.lock().await.get(NodeId(7)).is_none() {
            assert!(Instant::now() < deadline, "peer list never applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(nodes.lock().await.owner_id(), NodeId(2));

        shutdown_tx.send(true).unwrap();
        recv.await.unwrap();
    }

    #[tokio::test]
    async fn check_in_reaches_domain() {
        let (socket, _) = loopback().await;
        let (domain_socket, domain) = loopback().await;
        let nodes = shared(NodeList::new(NodeKind::Avatar).with_interests([NodeKind::AvatarMixer]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(check_in_loop(
            nodes,
            socket,
            domain,
            55441,
            Some("10.1.2.3:55441".parse().unwrap()),
            Duration::from_millis(20),
            shutdown_rx,
        ));

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), domain_socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf[0], PacketKind::DomainReportForDuty.as_byte());
        assert_eq!(buf[1], NodeKind::Avatar.as_byte());
        assert_eq!(
            Endpoint::decode(&buf[8..]).unwrap(),
            "10.1.2.3:55441".parse().unwrap()
        );
        assert_eq!(&buf[n - 2..n], &[1, NodeKind::AvatarMixer.as_byte()]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn sweep_task_drops_silent_nodes() {
        let nodes = shared(NodeList::new(NodeKind::Avatar));
        let (_, peer) = loopback().await;
        nodes.lock().await.upsert_from_peer_list(
            &[PeerEntry {
                id: NodeId(4),
                kind: NodeKind::Avatar,
                public_endpoint: peer,
                local_endpoint: peer,
            }],
            Instant::now(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(silent_sweep_loop(
            nodes.clone(),
            Duration::from_millis(30),
            Duration::from_millis(10),
            shutdown_rx,
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !nodes.lock().await.is_empty() {
            assert!(Instant::now() < deadline, "silent node never removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_idle_loops_promptly() {
        let (socket, _) = loopback().await;
        let nodes = shared(NodeList::new(NodeKind::Avatar));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(recv_loop(nodes.clone(), socket.clone(), shutdown_rx.clone())),
            tokio::spawn(ping_loop(
                nodes.clone(),
                socket,
                Duration::from_secs(3600),
                shutdown_rx.clone(),
            )),
            tokio::spawn(silent_sweep_loop(
                nodes,
                Duration::from_secs(10),
                Duration::from_secs(3600),
                shutdown_rx,
            )),
        ];
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(5), h)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

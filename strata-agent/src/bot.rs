//! Scripted avatar: stands at a random spot with a hand out and streams its state to the avatar mixer.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use strata_core::packet::build_sender_addressed;
use strata_core::{NodeId, NodeKind, PacketKind};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::protocols::SharedNodeList;

/// Side of the square area the bot spawns in.
pub const SPAWN_AREA: f32 = 10.0;
pub const PELVIS_HEIGHT: f32 = 0.5;

const TICKS_BEFORE_GRAB: u32 = 100;
const GRAB_TICKS: u32 = 50;
const REST_TICKS: u32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarState {
    pub position: [f32; 3],
    pub body_yaw: f32,
    pub hand_position: [f32; 3],
    /// 1 while grabbing.
    pub hand_state: u8,
}

impl AvatarState {
    /// Random spot in the spawn area, facing down z, hand held out.
    pub fn random_spawn<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let x = rng.gen_range(0.0..SPAWN_AREA);
        let z = rng.gen_range(0.0..SPAWN_AREA);
        Self {
            position: [x, PELVIS_HEIGHT, z],
            body_yaw: 0.0,
            hand_position: [x - 0.2, 0.5, z + 0.1],
            hand_state: 0,
        }
    }
}

/// Simulates pressing and releasing the grab button on a fixed schedule.
#[derive(Debug, Default)]
pub struct HandTimer {
    ticks: u32,
}

impl HandTimer {
    /// Advance one tick. Returns the new hand state when it changes.
    pub fn tick(&mut self) -> Option<u8> {
        self.ticks += 1;
        if self.ticks == TICKS_BEFORE_GRAB {
            Some(1)
        } else if self.ticks == TICKS_BEFORE_GRAB + GRAB_TICKS {
            Some(0)
        } else {
            if self.ticks >= TICKS_BEFORE_GRAB + GRAB_TICKS + REST_TICKS {
                self.ticks = 0;
            }
            None
        }
    }
}

/// `[H][owner id][bincode(state)]`.
pub fn head_packet(owner: NodeId, state: &AvatarState) -> Result<Vec<u8>, bincode::Error> {
    let body = bincode::serialize(state)?;
    Ok(build_sender_addressed(PacketKind::HeadData, owner, &body))
}

/// Time left in the tick, or `None` if the tick overran.
pub fn sleep_budget(interval: Duration, elapsed: Duration) -> Option<Duration> {
    interval.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Tick every `interval` until `stop` resolves.
pub async fn run(
    nodes: SharedNodeList,
    socket: Arc<UdpSocket>,
    interval: Duration,
    stop: impl Future<Output = ()>,
) {
    tokio::pin!(stop);
    let mut state = AvatarState::random_spawn(&mut rand::thread_rng());
    let mut hand = HandTimer::default();
    info!(position = ?state.position, "bot spawned");

    loop {
        let started = Instant::now();
        let target = {
            let nodes = nodes.lock().await;
            let owner = nodes.owner_id();
            nodes
                .sole_of_kind(NodeKind::AvatarMixer)
                .and_then(|mixer| mixer.active_endpoint())
                .filter(|_| owner.is_known())
                .map(|to| (owner, to))
        };
        if let Some((owner, to)) = target {
            match head_packet(owner, &state) {
                Ok(packet) => {
                    if let Err(e) = socket.send_to(&packet, SocketAddr::from(to)).await {
                        warn!(%to, error = %e, "avatar send failed");
                    }
                }
                Err(e) => warn!(error = %e, "avatar encode failed"),
            }
        }

        if let Some(s) = hand.tick() {
            debug!(hand_state = s, "hand state");
            state.hand_state = s;
        }

        let budget = sleep_budget(interval, started.elapsed()).unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(budget) => {}
        }
    }
    info!("bot stopped");
}

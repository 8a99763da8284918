//! Loopback simulation: simulated peers probe the responder over in-process
//! calls. Stands in for the radio and flood engine so the responder can be
//! exercised end-to-end without hardware; it is not a routing implementation.

use std::time::{Duration, Instant};

use meshling_core::protocol::PAYLOAD_TYPE_ANON_REQ;
use meshling_core::{
    decode_frame, open_datagram, open_path_return, Clock, FrameComposer, Keypair, OutboundAction,
    PingResponder, ResponderConfig, RouteKind, RoutingHooks,
};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Protocol-relative time: seconds since the node came up.
struct UptimeClock(Instant);

impl Clock for UptimeClock {
    fn now(&self) -> u32 {
        self.0.elapsed().as_secs() as u32
    }
}

struct SimPeer {
    keypair: Keypair,
    counter: u32,
    /// Path learned from a flood response; announced back to the node once.
    return_path: Option<Vec<u8>>,
    announced: bool,
}

impl SimPeer {
    fn new() -> Self {
        Self {
            keypair: Keypair::generate(),
            counter: 0,
            return_path: None,
            announced: false,
        }
    }
}

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let keypair = Keypair::generate();
    let mut node = PingResponder::new(
        keypair,
        FrameComposer::new(),
        UptimeClock(Instant::now()),
        ResponderConfig {
            max_clients: cfg.max_clients,
            eviction: cfg.eviction_policy(),
        },
    );
    let mut peers: Vec<SimPeer> = (0..cfg.sim_peers).map(|_| SimPeer::new()).collect();
    info!(
        max_clients = cfg.max_clients,
        sim_peers = peers.len(),
        "meshling responder up"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(cfg.probe_interval_ms));
    let mut turn = 0usize;
    loop {
        interval.tick().await;
        if peers.is_empty() {
            continue;
        }
        let i = turn % peers.len();
        turn += 1;

        announce_path(&mut node, &mut peers[i], i);
        probe(&mut node, &mut peers[i], i);
    }
}

/// Once a peer has learned its return path, it tells the node about a path
/// back to itself, the way a path-discovery response would arrive. The
/// engine resolves the short hash and tries cached secrets to find which
/// resolved peer is the sender.
fn announce_path<C, K>(node: &mut PingResponder<C, K>, peer: &mut SimPeer, i: usize)
where
    C: meshling_core::PacketComposer,
    K: Clock,
{
    if peer.announced {
        return;
    }
    let Some(path) = peer.return_path.clone() else {
        return;
    };
    let secret = peer.keypair.shared_secret(node.public_key());
    let index = node.resolve_peer_hash(peer.keypair.public_key().peer_hash());
    for idx in 0..index.len() {
        if node.peer_shared_secret(&index, idx).as_ref() == Some(&secret) {
            node.on_peer_path(&index, idx, &secret, &path);
            peer.announced = true;
            info!(peer = i, hops = path.len(), "peer announced return path");
            return;
        }
    }
    warn!(peer = i, "no resolved peer matched announcement secret");
}

fn probe<C, K>(node: &mut PingResponder<C, K>, peer: &mut SimPeer, i: usize)
where
    C: meshling_core::PacketComposer,
    K: Clock,
{
    peer.counter += 1;
    let payload = peer.counter.to_le_bytes();
    let route = if peer.announced {
        RouteKind::Direct
    } else {
        RouteKind::Flood
    };
    // Single simulated hop: the peer itself.
    let taken_path = [i as u8];

    let action = node.on_anon_datagram(
        peer.keypair.public_key(),
        PAYLOAD_TYPE_ANON_REQ,
        &payload,
        route,
        &taken_path,
    );
    let secret = peer.keypair.shared_secret(node.public_key());
    match action {
        Some(OutboundAction::SendFlood(frame)) => {
            let Ok((packet, _)) = decode_frame(&frame) else {
                warn!(peer = i, "undecodable flood frame");
                return;
            };
            if let Some((path, _payload)) = open_path_return(&secret, &packet) {
                peer.return_path = Some(path);
                info!(peer = i, "probe answered by flood; learned return path");
            } else if open_datagram(&secret, &packet).is_some() {
                info!(peer = i, "probe answered by flooded datagram");
            } else {
                warn!(peer = i, "flood response did not open");
            }
        }
        Some(OutboundAction::SendDirect { path, frame }) => {
            let Ok((packet, _)) = decode_frame(&frame) else {
                warn!(peer = i, "undecodable direct frame");
                return;
            };
            if open_datagram(&secret, &packet).is_some() {
                info!(peer = i, hops = path.len(), "probe answered along cached path");
            } else {
                warn!(peer = i, "direct response did not open");
            }
        }
        None => debug!(peer = i, "probe dropped"),
    }
}

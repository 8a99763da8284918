//! Host-driven responder: the routing engine passes decoded packets in and
//! receives transmit actions out.
//!
//! Dispatch is single-threaded and synchronous (the radio loop polls), so
//! the replay check-and-update inside one call never interleaves with
//! another dispatch for the same peer.

use tracing::{debug, trace, warn};

use crate::compose::PacketComposer;
use crate::identity::{Keypair, PeerHash, PublicKey, SharedSecret};
use crate::protocol::{self, PAYLOAD_TYPE_ANON_REQ, PAYLOAD_TYPE_RESPONSE};
use crate::registry::{ClientRegistry, EvictionPolicy, PeerIndex, RegistryError, MAX_CLIENTS};

/// Collaborator-provided protocol-relative time. Responses lead with this
/// value.
pub trait Clock {
    fn now(&self) -> u32;
}

/// How an inbound packet reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Broadcast hop-by-hop; the packet carries the path it took.
    Flood,
    /// Addressed delivery along an explicit source route.
    Direct,
}

/// Transmission for the host to perform.
#[derive(Debug)]
pub enum OutboundAction {
    SendFlood(Vec<u8>),
    SendDirect { path: Vec<u8>, frame: Vec<u8> },
}

/// Responder tuning. Defaults match a small always-on node.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub max_clients: usize,
    pub eviction: EvictionPolicy,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            max_clients: MAX_CLIENTS,
            eviction: EvictionPolicy::default(),
        }
    }
}

/// The four operations the outer routing engine drives. Implemented by
/// [`PingResponder`]; injected into the engine rather than overridden on it.
pub trait RoutingHooks {
    /// Handle an anonymous probe. Returns at most one transmission; `None`
    /// means the probe was dropped (malformed, stale, table full) or no
    /// packet could be composed.
    fn on_anon_datagram(
        &mut self,
        sender: &PublicKey,
        payload_type: u8,
        payload: &[u8],
        route: RouteKind,
        taken_path: &[u8],
    ) -> Option<OutboundAction>;

    /// Resolve a short wire hash to the peers it could denote. The returned
    /// index is only valid for the rest of this dispatch.
    fn resolve_peer_hash(&mut self, hash: PeerHash) -> PeerIndex;

    /// Copy out the cached secret for a resolved peer. Never recomputes or
    /// mutates; out-of-range indices are logged and yield `None`.
    fn peer_shared_secret(&self, index: &PeerIndex, idx: usize) -> Option<SharedSecret>;

    /// A return path to a resolved peer arrived out-of-band; cache it.
    /// Out-of-range indices and secret mismatches are logged and ignored.
    /// Deliberately sends nothing back: only the probing side learns a path
    /// in this flow.
    fn on_peer_path(
        &mut self,
        index: &PeerIndex,
        sender_idx: usize,
        secret: &SharedSecret,
        path: &[u8],
    );
}

/// Answers anonymous probes from unknown peers: derives and caches a
/// pairwise secret on first contact, rejects replays, and replies by flood
/// (teaching the prober a return path) or directly along a learned path.
pub struct PingResponder<C: PacketComposer, K: Clock> {
    keypair: Keypair,
    registry: ClientRegistry,
    composer: C,
    clock: K,
}

impl<C: PacketComposer, K: Clock> PingResponder<C, K> {
    pub fn new(keypair: Keypair, composer: C, clock: K, config: ResponderConfig) -> Self {
        Self {
            keypair,
            registry: ClientRegistry::new(config.max_clients, config.eviction),
            composer,
            clock,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }
}

impl<C: PacketComposer, K: Clock> RoutingHooks for PingResponder<C, K> {
    fn on_anon_datagram(
        &mut self,
        sender: &PublicKey,
        payload_type: u8,
        payload: &[u8],
        route: RouteKind,
        taken_path: &[u8],
    ) -> Option<OutboundAction> {
        if payload_type != PAYLOAD_TYPE_ANON_REQ {
            trace!(payload_type, "unexpected payload type; dropping");
            return None;
        }
        let Some(req) = protocol::parse_anon_request(payload) else {
            trace!(len = payload.len(), "malformed probe; dropping");
            return None;
        };
        let slot = match self.registry.find_or_create(sender, &self.keypair) {
            Ok(slot) => slot,
            Err(RegistryError::Full) => {
                debug!("client table full; dropping probe from new peer");
                return None;
            }
            Err(err) => {
                debug!(%err, "probe admission failed; dropping");
                return None;
            }
        };
        if !self.registry.accept_timestamp(slot, req.timestamp) {
            trace!(
                timestamp = req.timestamp,
                last = self.registry.entry(slot).last_timestamp(),
                "stale probe; dropping"
            );
            return None;
        }

        let secret = self.registry.entry(slot).shared_secret().clone();
        let reply = protocol::build_response_payload(self.clock.now(), &[]);

        match route {
            // A flooded probe means the peer has no path to us yet; answer by
            // flood and seal the taken path into the response so it learns one.
            RouteKind::Flood => {
                let frame = self.composer.path_return(
                    sender,
                    &secret,
                    taken_path,
                    PAYLOAD_TYPE_RESPONSE,
                    &reply,
                )?;
                Some(OutboundAction::SendFlood(frame))
            }
            // An addressed probe gets a plain datagram, routed along the
            // cached path when we have one.
            RouteKind::Direct => {
                let frame =
                    self.composer
                        .datagram(PAYLOAD_TYPE_RESPONSE, sender, &secret, &reply)?;
                match self.registry.entry(slot).out_path() {
                    Some(path) => Some(OutboundAction::SendDirect {
                        path: path.as_bytes().to_vec(),
                        frame,
                    }),
                    None => Some(OutboundAction::SendFlood(frame)),
                }
            }
        }
    }

    fn resolve_peer_hash(&mut self, hash: PeerHash) -> PeerIndex {
        self.registry.resolve_by_hash(hash)
    }

    fn peer_shared_secret(&self, index: &PeerIndex, idx: usize) -> Option<SharedSecret> {
        let Some(slot) = index.get(idx) else {
            warn!(idx, matches = index.len(), "peer index out of range");
            return None;
        };
        Some(self.registry.entry(slot).shared_secret().clone())
    }

    fn on_peer_path(
        &mut self,
        index: &PeerIndex,
        sender_idx: usize,
        secret: &SharedSecret,
        path: &[u8],
    ) {
        let Some(slot) = index.get(sender_idx) else {
            warn!(
                sender_idx,
                matches = index.len(),
                "peer index out of range; ignoring path"
            );
            return;
        };
        if self.registry.entry(slot).shared_secret() != secret {
            warn!("secret mismatch for path sender; ignoring path");
            return;
        }
        if let Err(err) = self.registry.update_path(slot, path) {
            warn!(%err, "rejecting learned path");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{decode_frame, open_datagram, open_path_return, FrameComposer, PacketBody};
    use crate::protocol::TIMESTAMP_LEN;

    struct FixedClock(u32);

    impl Clock for FixedClock {
        fn now(&self) -> u32 {
            self.0
        }
    }

    /// Composer standing in for a host with no free send buffers.
    struct NoBufferComposer;

    impl PacketComposer for NoBufferComposer {
        fn path_return(
            &mut self,
            _recipient: &PublicKey,
            _secret: &SharedSecret,
            _taken_path: &[u8],
            _payload_type: u8,
            _payload: &[u8],
        ) -> Option<Vec<u8>> {
            None
        }

        fn datagram(
            &mut self,
            _payload_type: u8,
            _recipient: &PublicKey,
            _secret: &SharedSecret,
            _payload: &[u8],
        ) -> Option<Vec<u8>> {
            None
        }
    }

    fn responder(config: ResponderConfig) -> PingResponder<FrameComposer, FixedClock> {
        PingResponder::new(
            Keypair::generate(),
            FrameComposer::new(),
            FixedClock(777),
            config,
        )
    }

    fn probe_payload(timestamp: u32) -> Vec<u8> {
        timestamp.to_le_bytes().to_vec()
    }

    #[test]
    fn first_flood_probe_gets_path_return_response() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        let taken_path = [10u8, 20, 30];

        let action = node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(100),
                RouteKind::Flood,
                &taken_path,
            )
            .expect("fresh probe must be answered");

        let OutboundAction::SendFlood(frame) = action else {
            panic!("flood probe must be answered by flood");
        };
        let (packet, _) = decode_frame(&frame).unwrap();
        assert!(matches!(packet.body, PacketBody::PathReturn { .. }));
        assert_eq!(packet.dest_hash, peer.public_key().peer_hash());

        // The peer can open it with its own side of the key agreement and
        // learns the path the probe took.
        let secret = peer.shared_secret(node.public_key());
        let (path, payload) = open_path_return(&secret, &packet).unwrap();
        assert_eq!(path, taken_path);
        assert_eq!(&payload[..TIMESTAMP_LEN], &777u32.to_le_bytes());

        let index = node.resolve_peer_hash(peer.public_key().peer_hash());
        let slot = index.get(0).unwrap();
        assert_eq!(node.registry().entry(slot).last_timestamp(), 100);
    }

    #[test]
    fn stale_probe_dropped_and_counter_kept() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(100),
                RouteKind::Flood,
                &[],
            )
            .is_some());

        for stale in [100, 50] {
            assert!(node
                .on_anon_datagram(
                    peer.public_key(),
                    PAYLOAD_TYPE_ANON_REQ,
                    &probe_payload(stale),
                    RouteKind::Flood,
                    &[],
                )
                .is_none());
        }
        let index = node.resolve_peer_hash(peer.public_key().peer_hash());
        let slot = index.get(0).unwrap();
        assert_eq!(node.registry().entry(slot).last_timestamp(), 100);

        // Strictly newer probes are accepted again.
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(101),
                RouteKind::Flood,
                &[],
            )
            .is_some());
    }

    #[test]
    fn malformed_probe_creates_no_entry() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &[1, 2],
                RouteKind::Flood,
                &[],
            )
            .is_none());
        assert!(node.registry().is_empty());
    }

    #[test]
    fn wrong_payload_type_dropped() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_RESPONSE,
                &probe_payload(1),
                RouteKind::Flood,
                &[],
            )
            .is_none());
        assert!(node.registry().is_empty());
    }

    #[test]
    fn full_table_drops_new_peer_silently() {
        let mut node = responder(ResponderConfig {
            max_clients: 2,
            eviction: EvictionPolicy::RejectNew,
        });
        for _ in 0..2 {
            let peer = Keypair::generate();
            assert!(node
                .on_anon_datagram(
                    peer.public_key(),
                    PAYLOAD_TYPE_ANON_REQ,
                    &probe_payload(1),
                    RouteKind::Flood,
                    &[],
                )
                .is_some());
        }
        let extra = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                extra.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(1),
                RouteKind::Flood,
                &[],
            )
            .is_none());
        assert_eq!(node.registry().len(), 2);
    }

    #[test]
    fn lrs_eviction_admits_probe_on_full_table() {
        let mut node = responder(ResponderConfig {
            max_clients: 2,
            eviction: EvictionPolicy::LeastRecentlySeen,
        });
        let stale = Keypair::generate();
        let fresh = Keypair::generate();
        for (peer, ts) in [(&stale, 5u32), (&fresh, 500)] {
            assert!(node
                .on_anon_datagram(
                    peer.public_key(),
                    PAYLOAD_TYPE_ANON_REQ,
                    &probe_payload(ts),
                    RouteKind::Flood,
                    &[],
                )
                .is_some());
        }
        let newcomer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                newcomer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(1),
                RouteKind::Flood,
                &[],
            )
            .is_some());
        assert_eq!(node.registry().len(), 2);
    }

    #[test]
    fn direct_probe_without_path_floods_datagram() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        let action = node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(1),
                RouteKind::Direct,
                &[],
            )
            .unwrap();
        let OutboundAction::SendFlood(frame) = action else {
            panic!("no cached path; datagram must be flooded");
        };
        let (packet, _) = decode_frame(&frame).unwrap();
        assert!(matches!(packet.body, PacketBody::Datagram { .. }));
    }

    #[test]
    fn learned_path_routes_direct_probe() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(1),
                RouteKind::Flood,
                &[],
            )
            .is_some());

        let index = node.resolve_peer_hash(peer.public_key().peer_hash());
        assert_eq!(index.len(), 1);
        let secret = node.peer_shared_secret(&index, 0).unwrap();
        node.on_peer_path(&index, 0, &secret, &[42, 43]);

        let action = node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(2),
                RouteKind::Direct,
                &[],
            )
            .unwrap();
        let OutboundAction::SendDirect { path, frame } = action else {
            panic!("cached path must be used for an addressed probe");
        };
        assert_eq!(path, vec![42, 43]);
        let (packet, _) = decode_frame(&frame).unwrap();
        let peer_secret = peer.shared_secret(node.public_key());
        assert!(open_datagram(&peer_secret, &packet).is_some());
    }

    #[test]
    fn shared_secret_lookup_copies_cached_value() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(1),
                RouteKind::Flood,
                &[],
            )
            .is_some());
        let index = node.resolve_peer_hash(peer.public_key().peer_hash());
        let secret = node.peer_shared_secret(&index, 0).unwrap();
        assert_eq!(secret, peer.shared_secret(node.public_key()));
    }

    #[test]
    fn out_of_range_index_is_a_noop() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(1),
                RouteKind::Flood,
                &[],
            )
            .is_some());
        let index = node.resolve_peer_hash(peer.public_key().peer_hash());
        let count = index.len();
        assert!(node.peer_shared_secret(&index, count).is_none());

        let secret = node.peer_shared_secret(&index, 0).unwrap();
        node.on_peer_path(&index, count, &secret, &[1, 2, 3]);
        let slot = index.get(0).unwrap();
        assert!(node.registry().entry(slot).out_path().is_none());
    }

    #[test]
    fn mismatched_secret_rejects_path() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(1),
                RouteKind::Flood,
                &[],
            )
            .is_some());
        let index = node.resolve_peer_hash(peer.public_key().peer_hash());
        let bogus = Keypair::generate().shared_secret(peer.public_key());
        node.on_peer_path(&index, 0, &bogus, &[1, 2, 3]);
        let slot = index.get(0).unwrap();
        assert!(node.registry().entry(slot).out_path().is_none());
    }

    #[test]
    fn composer_failure_yields_no_transmission() {
        let mut node = PingResponder::new(
            Keypair::generate(),
            NoBufferComposer,
            FixedClock(0),
            ResponderConfig::default(),
        );
        let peer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(1),
                RouteKind::Flood,
                &[],
            )
            .is_none());
        // The probe itself was admitted; only the send was skipped.
        assert_eq!(node.registry().len(), 1);
    }

    #[test]
    fn resolve_unknown_hash_yields_empty_index() {
        let mut node = responder(ResponderConfig::default());
        let peer = Keypair::generate();
        assert!(node
            .on_anon_datagram(
                peer.public_key(),
                PAYLOAD_TYPE_ANON_REQ,
                &probe_payload(1),
                RouteKind::Flood,
                &[],
            )
            .is_some());
        let absent = PeerHash(peer.public_key().peer_hash().0.wrapping_add(1));
        let index = node.resolve_peer_hash(absent);
        assert!(index.is_empty());
        assert!(node.peer_shared_secret(&index, 0).is_none());
    }
}

//! Mesh ping-responder protocol core.
//! Host-driven: no I/O; the outer routing engine passes decoded packets in
//! and receives transmit actions out.

pub mod compose;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod responder;

pub use compose::{
    decode_frame, encode_frame, open_datagram, open_path_return, FrameComposer, FrameDecodeError,
    FrameEncodeError, Packet, PacketBody, PacketComposer,
};
pub use identity::{Keypair, PeerHash, PublicKey, SharedSecret, SECRET_SIZE};
pub use registry::{
    ClientEntry, ClientRegistry, EvictionPolicy, PeerIndex, RegistryError, ReturnPath, Slot,
    MAX_CLIENTS, MAX_PATH_LEN,
};
pub use responder::{
    Clock, OutboundAction, PingResponder, ResponderConfig, RouteKind, RoutingHooks,
};

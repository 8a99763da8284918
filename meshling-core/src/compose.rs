//! Packet composition: sealed response bodies, length-prefix framing.
//!
//! The routing layer treats composed frames as opaque bytes; only the
//! recipient opens them. Framing is a 4-byte LE length + bincode payload.

use serde::{Deserialize, Serialize};

use crate::identity::{
    derive_packet_key, open_payload, seal_payload, PeerHash, PublicKey, SharedSecret,
};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 8 * 1024;

/// A composed outbound packet, before framing.
#[derive(Debug, Serialize, Deserialize)]
pub struct Packet {
    /// Truncated hash of the recipient identity; the routing layer matches
    /// on this, collisions and all.
    pub dest_hash: PeerHash,
    pub payload_type: u8,
    /// Nonce the body was sealed under.
    pub nonce: u64,
    pub body: PacketBody,
}

/// Sealed packet body. `PathReturn` carries the path the probe took sealed
/// together with the response, so the recipient both gets its answer and
/// learns a usable return path in one packet.
#[derive(Debug, Serialize, Deserialize)]
pub enum PacketBody {
    PathReturn { ciphertext: Vec<u8> },
    Datagram { ciphertext: Vec<u8> },
}

/// Plaintext of a `PathReturn` body before sealing.
#[derive(Debug, Serialize, Deserialize)]
struct PathReturnPlain {
    path: Vec<u8>,
    payload: Vec<u8>,
}

/// Encode a packet into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(packet).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a packet into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the packet and the
/// number of bytes consumed; `NeedMore` on a partial buffer.
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let packet: Packet =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((packet, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Builds outbound frames for the responder. Either method may fail to
/// produce a packet (no buffer, encode failure); the dispatch then simply
/// sends nothing.
pub trait PacketComposer {
    /// Compose a path-return response: the path the probe took and the
    /// response payload, sealed under the recipient's shared secret,
    /// delivered by flood.
    fn path_return(
        &mut self,
        recipient: &PublicKey,
        secret: &SharedSecret,
        taken_path: &[u8],
        payload_type: u8,
        payload: &[u8],
    ) -> Option<Vec<u8>>;

    /// Compose a plain authenticated datagram for a peer we already share a
    /// secret with.
    fn datagram(
        &mut self,
        payload_type: u8,
        recipient: &PublicKey,
        secret: &SharedSecret,
        payload: &[u8],
    ) -> Option<Vec<u8>>;
}

/// Default composer: seals under the pairwise packet key with a counter
/// nonce, then frames.
#[derive(Default)]
pub struct FrameComposer {
    nonce: u64,
}

impl FrameComposer {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_nonce(&mut self) -> u64 {
        let n = self.nonce;
        self.nonce = self.nonce.wrapping_add(1);
        n
    }
}

impl PacketComposer for FrameComposer {
    fn path_return(
        &mut self,
        recipient: &PublicKey,
        secret: &SharedSecret,
        taken_path: &[u8],
        payload_type: u8,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        let plain = bincode::serialize(&PathReturnPlain {
            path: taken_path.to_vec(),
            payload: payload.to_vec(),
        })
        .ok()?;
        let nonce = self.next_nonce();
        let ciphertext = seal_payload(&derive_packet_key(secret), nonce, &plain).ok()?;
        let packet = Packet {
            dest_hash: recipient.peer_hash(),
            payload_type,
            nonce,
            body: PacketBody::PathReturn { ciphertext },
        };
        encode_frame(&packet).ok()
    }

    fn datagram(
        &mut self,
        payload_type: u8,
        recipient: &PublicKey,
        secret: &SharedSecret,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        let nonce = self.next_nonce();
        let ciphertext = seal_payload(&derive_packet_key(secret), nonce, payload).ok()?;
        let packet = Packet {
            dest_hash: recipient.peer_hash(),
            payload_type,
            nonce,
            body: PacketBody::Datagram { ciphertext },
        };
        encode_frame(&packet).ok()
    }
}

/// Open a `PathReturn` body: returns the taken path and the response payload.
/// Used by the recipient side (hosts, tests).
pub fn open_path_return(secret: &SharedSecret, packet: &Packet) -> Option<(Vec<u8>, Vec<u8>)> {
    let PacketBody::PathReturn { ciphertext } = &packet.body else {
        return None;
    };
    let plain = open_payload(&derive_packet_key(secret), packet.nonce, ciphertext).ok()?;
    let decoded: PathReturnPlain = bincode::deserialize(&plain).ok()?;
    Some((decoded.path, decoded.payload))
}

/// Open a `Datagram` body: returns the response payload.
pub fn open_datagram(secret: &SharedSecret, packet: &Packet) -> Option<Vec<u8>> {
    let PacketBody::Datagram { ciphertext } = &packet.body else {
        return None;
    };
    open_payload(&derive_packet_key(secret), packet.nonce, ciphertext).ok()
}

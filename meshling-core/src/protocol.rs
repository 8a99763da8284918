//! Payload layout shared with the routing layer: type tags and the
//! replay-counter prefix.

/// Payload-type tag for an anonymous request (probe).
pub const PAYLOAD_TYPE_ANON_REQ: u8 = 0x07;

/// Payload-type tag for a responder reply.
pub const PAYLOAD_TYPE_RESPONSE: u8 = 0x02;

/// Length of the replay-protection counter prefix.
pub const TIMESTAMP_LEN: usize = 4;

/// Decoded anonymous request: the 4-byte LE replay counter plus whatever the
/// peer appended after it.
#[derive(Debug, PartialEq, Eq)]
pub struct AnonRequest<'a> {
    pub timestamp: u32,
    pub data: &'a [u8],
}

/// Parse an anonymous request payload. Anything shorter than the counter
/// prefix is malformed; the caller drops it without a reply.
pub fn parse_anon_request(payload: &[u8]) -> Option<AnonRequest<'_>> {
    if payload.len() < TIMESTAMP_LEN {
        return None;
    }
    let timestamp = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Some(AnonRequest {
        timestamp,
        data: &payload[TIMESTAMP_LEN..],
    })
}

/// Build a response payload. Responses always lead with the current
/// protocol-relative time, fixed at construction.
pub fn build_response_payload(now: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TIMESTAMP_LEN + data.len());
    out.extend_from_slice(&now.to_le_bytes());
    out.extend_from_slice(data);
    out
}

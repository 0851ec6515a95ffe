//! Wire framing for the Skinny Client Control Protocol (SCCP) and its SPCP
//! variant.
//!
//! A frame is `[u32 LE length][u32 LE protocol_version][u32 LE message_id][payload]`.
//! `length` counts the message id and payload (but not the protocol version
//! field), so the full frame on the wire is `length + 8` bytes, and the
//! payload is `length - 4` bytes. This differs from a naive reading of
//! "length counts everything after itself" — it does not count the
//! `protocol_version` field — confirmed against the upstream C dissector's
//! `SCCP_PACKET_HEADER` (12) / `payload_len = hdr_len + 8` arithmetic.

use thiserror::Error;

/// Fixed prefix: length(4) + protocol_version(4) + message_id(4).
pub const FRAME_HEADER_LEN: usize = 12;

/// Hard ceiling on a fully assembled frame, mirroring `SCCP_MAX_PACKET`.
pub const MAX_PACKET: u32 = 2000;

/// Smallest `length` field value that is accepted (an empty-payload message).
pub const MIN_LENGTH: u32 = 4;

/// Largest `length` field value that is accepted.
pub const MAX_LENGTH: u32 = MAX_PACKET - 8;

pub const SCCP_HIGH: u32 = 0x009F;
pub const SPCP_LOW: u32 = 0x8000;
pub const SPCP_HIGH: u32 = SPCP_LOW + 0x0020;
pub const SPCP_OFFSET: u32 = SPCP_LOW;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("length {0} out of bounds [{MIN_LENGTH}, {MAX_LENGTH}]")]
    BadLength(u32),
    #[error("message id {0:#06x} falls outside both the SCCP and SPCP ranges")]
    UnknownProtocol(u32),
}

/// Protocol flavor a session speaks, determined by which message-id range a
/// frame's id falls in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    Sccp,
    Spcp,
}

/// Outcome of peeking at a candidate frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderPeek {
    /// Fewer than [`FRAME_HEADER_LEN`] bytes are buffered; poll again.
    NeedMore,
    /// A parsed, in-range header. `canonical_size` is `None` when the
    /// message id falls in a valid range but has no table entry — the frame
    /// is still framed using the wire `length`, but the worker must discard
    /// it instead of dispatching.
    Frame(ParsedHeader),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub length: u32,
    pub protocol_version: u32,
    pub message_id: u32,
    pub protocol: Protocol,
    /// Canonical payload size for `message_id`, if the table has an entry.
    pub canonical_size: Option<usize>,
}

impl ParsedHeader {
    /// Total bytes this frame occupies on the wire, including the header.
    #[inline]
    pub fn full_frame_len(&self) -> usize {
        self.length as usize + 8
    }

    /// Bytes of payload as declared by the wire `length` field (may exceed
    /// or fall short of `canonical_size`).
    #[inline]
    pub fn wire_payload_len(&self) -> usize {
        (self.length - 4) as usize
    }
}

/// Peek at a buffer and classify the header at its front.
///
/// Returns `Err` for conditions that must close the session (bad length,
/// message id in neither range). Returns `Ok(NeedMore)` if fewer than
/// [`FRAME_HEADER_LEN`] bytes are available yet. Otherwise returns
/// `Ok(Frame(..))`, which the caller uses to decide whether the full frame
/// has arrived (`buf.len() >= full_frame_len()`).
pub fn peek_header(buf: &[u8]) -> Result<HeaderPeek, FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(HeaderPeek::NeedMore);
    }

    let length = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let protocol_version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let message_id = u32::from_le_bytes(buf[8..12].try_into().unwrap());

    if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
        return Err(FrameError::BadLength(length));
    }

    let (protocol, canonical_size) = resolve_message_size(message_id)
        .ok_or(FrameError::UnknownProtocol(message_id))?;

    Ok(HeaderPeek::Frame(ParsedHeader {
        length,
        protocol_version,
        message_id,
        protocol,
        canonical_size,
    }))
}

/// Resolve a message id's protocol flavor and canonical payload size.
///
/// Returns `None` if `message_id` is outside both the SCCP and SPCP ranges
/// entirely (an unrecoverable framing error). Returns `Some((protocol,
/// None))` when the id is in-range but the table has no entry for it (a
/// discardable, non-fatal message).
pub fn resolve_message_size(message_id: u32) -> Option<(Protocol, Option<usize>)> {
    if message_id <= SCCP_HIGH {
        let size = sccp_message_size(message_id);
        Some((Protocol::Sccp, size))
    } else if (SPCP_LOW..=SPCP_HIGH).contains(&message_id) {
        let size = spcp_message_size(message_id - SPCP_OFFSET);
        Some((Protocol::Spcp, size))
    } else {
        None
    }
}

/// Copies `src` into a canonically-sized payload buffer: truncates if `src`
/// is longer, zero-pads if shorter. Phones occasionally send slightly larger
/// frames than our table expects (firmware drift); padding/truncation keeps
/// downstream handlers from reading out of bounds while staying forward
/// compatible.
pub fn normalize_payload(src: &[u8], canonical_size: usize) -> Vec<u8> {
    let mut out = vec![0u8; canonical_size];
    let n = src.len().min(canonical_size);
    out[..n].copy_from_slice(&src[..n]);
    out
}

/// Encode a frame header + payload into a fresh buffer ready to write to the
/// wire.
pub fn encode_frame(protocol_version: u32, message_id: u32, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u32 + 4;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&protocol_version.to_le_bytes());
    out.extend_from_slice(&message_id.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

macro_rules! message_table {
    ($name:ident, $high:expr, [$($id:expr => $size:expr),* $(,)?]) => {
        fn $name(id: u32) -> Option<usize> {
            #[allow(clippy::match_single_binding)]
            match id {
                $($id => Some($size),)*
                _ if id <= $high => None,
                _ => None,
            }
        }
    };
}

// Representative subset of well-known SCCP message ids and their canonical
// payload sizes. A production table is exhaustive; this one carries exactly
// the ids this repository's own send path and test scenarios need plus a
// deliberate gap (`0x0050`) to exercise the discardable-unknown-message path.
pub mod message_id {
    pub const KEEP_ALIVE: u32 = 0x0000;
    pub const REGISTER: u32 = 0x0001;
    pub const UNREGISTER: u32 = 0x0025;
    pub const RESET: u32 = 0x002A;
    pub const KEEP_ALIVE_ACK: u32 = 0x0100;
    pub const REGISTER_ACK: u32 = 0x0081;
    pub const REGISTER_REJECT: u32 = 0x009A;
    pub const REGISTER_TOKEN_REQUEST: u32 = 0x0094;
    pub const REGISTER_TOKEN_ACK: u32 = 0x0095;
    pub const REGISTER_TOKEN_REJECT: u32 = 0x0096;
    pub const UNREGISTER_ACK: u32 = 0x0118;
    pub const FEATURE_STAT: u32 = 0x0108;

    pub const SPCP_REGISTER_TOKEN_ACK: u32 = super::SPCP_LOW;
    pub const SPCP_REGISTER_TOKEN_REJECT: u32 = super::SPCP_LOW + 1;
}

message_table!(sccp_message_size, SCCP_HIGH, [
    message_id::KEEP_ALIVE => 0,
    message_id::REGISTER => 44,
    message_id::UNREGISTER => 0,
    message_id::RESET => 4,
    message_id::KEEP_ALIVE_ACK => 0,
    message_id::REGISTER_ACK => 18,
    message_id::REGISTER_REJECT => 33,
    message_id::REGISTER_TOKEN_REQUEST => 32,
    message_id::REGISTER_TOKEN_ACK => 4,
    message_id::REGISTER_TOKEN_REJECT => 4,
    message_id::UNREGISTER_ACK => 4,
    message_id::FEATURE_STAT => 48,
]);

message_table!(spcp_message_size, SPCP_HIGH, [
    0 => 16,
    1 => 16,
]);

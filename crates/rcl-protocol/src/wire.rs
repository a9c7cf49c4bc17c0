//! Framing of [`Message`]s on an RCL connection.
//!
//! Each frame is a fixed header followed by an rkyv-archived message:
//!
//! ```text
//! offset 0   "RC"
//! offset 2   FrameFlags
//! offset 3   stream id        (u32 LE, always 0 today)
//! offset 7   payload length   (u32 LE)
//! offset 11  payload
//! ```
//!
//! Large payloads are LZ4-compressed when that makes them smaller; the
//! receiver learns this from [`FrameFlags::COMPRESSED`].

use std::borrow::Cow;

use crate::messages::Message;

pub const MAGIC: [u8; 2] = *b"RC";

/// Upper bound on a payload as it travels (after compression).
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

pub const HEADER_SIZE: usize = 11;

const FLAGS_AT: usize = 2;
const STREAM_AT: usize = 3;
const LENGTH_AT: usize = 7;

/// Buffer transfers are worth compressing; handshakes and small commands
/// are not.
const MIN_COMPRESSED_PAYLOAD: usize = 513;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Payload is LZ4 with the uncompressed size prepended.
        const COMPRESSED = 1 << 0;
        /// Sent in answer to a request.
        const RESPONSE = 1 << 2;
        /// Carries a `Message::Error`.
        const ERROR = 1 << 3;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame does not start with the RCL magic")]
    InvalidMagic,
    #[error("frame payload of {0} bytes exceeds the frame limit")]
    FrameTooLarge(u32),
    #[error("message (de)serialization failed: {0}")]
    Serialization(String),
    #[error("LZ4 payload is corrupt: {0}")]
    DecompressionError(String),
}

/// Archive `msg` and wrap it in a frame for `stream_id`.
pub fn encode_message(msg: &Message, stream_id: u32) -> Result<Vec<u8>, WireError> {
    let archived = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| WireError::Serialization(e.to_string()))?;
    let (payload, compression) = maybe_compress(&archived);

    let length = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(WireError::FrameTooLarge(payload.len().min(u32::MAX as usize) as u32))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.push((compression | direction(msg)).bits());
    frame.extend_from_slice(&stream_id.to_le_bytes());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Validate a header and return its flags, stream id and payload length.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(FrameFlags, u32, u32), WireError> {
    if header[..FLAGS_AT] != MAGIC {
        return Err(WireError::InvalidMagic);
    }
    let length = le_u32(header, LENGTH_AT);
    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(length));
    }
    Ok((
        FrameFlags::from_bits_truncate(header[FLAGS_AT]),
        le_u32(header, STREAM_AT),
        length,
    ))
}

/// Turn a frame payload back into a [`Message`].
pub fn decode_message(payload: &[u8], flags: FrameFlags) -> Result<Message, WireError> {
    let archived: Cow<'_, [u8]> = if flags.contains(FrameFlags::COMPRESSED) {
        lz4_flex::decompress_size_prepended(payload)
            .map(Cow::Owned)
            .map_err(|e| WireError::DecompressionError(e.to_string()))?
    } else {
        Cow::Borrowed(payload)
    };

    // rkyv reads in place and the payload slice may sit at any offset.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(archived.len());
    aligned.extend_from_slice(&archived);
    rkyv::from_bytes::<Message, rkyv::rancor::Error>(&aligned)
        .map_err(|e| WireError::Serialization(e.to_string()))
}

fn maybe_compress(archived: &[u8]) -> (Cow<'_, [u8]>, FrameFlags) {
    if archived.len() >= MIN_COMPRESSED_PAYLOAD {
        let compressed = lz4_flex::compress_prepend_size(archived);
        if compressed.len() < archived.len() {
            return (Cow::Owned(compressed), FrameFlags::COMPRESSED);
        }
    }
    (Cow::Borrowed(archived), FrameFlags::empty())
}

fn direction(msg: &Message) -> FrameFlags {
    match msg {
        Message::Error(_) => FrameFlags::ERROR,
        Message::AuthResult { .. }
        | Message::ClResponse { .. }
        | Message::DeviceList(_)
        | Message::MetricsData { .. }
        | Message::Pong => FrameFlags::RESPONSE,
        _ => FrameFlags::empty(),
    }
}

fn le_u32(header: &[u8; HEADER_SIZE], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&header[at..at + 4]);
    u32::from_le_bytes(bytes)
}

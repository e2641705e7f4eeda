//! Link wire framing.
//!
//! Wire format (all integer fields big-endian):
//!
//! ```text
//! +------------+--------------+-----------+-----------------+---------------+
//! | len (u32)  | sequence(u32)| kind (u8) | payload         | crc32 (u32)   |
//! +------------+--------------+-----------+-----------------+---------------+
//!              \______________________ len bytes _________________________/
//! ```
//!
//! The checksum is CRC-32 (IEEE) over sequence, kind and payload.

use crc32fast::Hasher;
use std::fmt;
use thiserror::Error;

pub const LENGTH_FIELD_LEN: usize = 4;
/// sequence + kind + checksum
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4;
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;
pub const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_PAYLOAD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    InputDelta,
    Heartbeat,
    Control,
}

impl FrameKind {
    pub const fn to_u8(self) -> u8 {
        match self {
            FrameKind::InputDelta => 0x01,
            FrameKind::Heartbeat => 0x02,
            FrameKind::Control => 0x03,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameKind::InputDelta),
            0x02 => Some(FrameKind::Heartbeat),
            0x03 => Some(FrameKind::Control),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::InputDelta => write!(f, "input-delta"),
            FrameKind::Heartbeat => write!(f, "heartbeat"),
            FrameKind::Control => write!(f, "control"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u32,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(sequence: u32, kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            kind,
            payload,
        }
    }

    pub fn heartbeat(sequence: u32) -> Self {
        Self::new(sequence, FrameKind::Heartbeat, Vec::new())
    }

    pub fn encoded_len(&self) -> usize {
        LENGTH_FIELD_LEN + FRAME_OVERHEAD + self.payload.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("declared frame length {len} is outside {min}..={max}")]
    InvalidLength { len: usize, min: usize, max: usize },

    #[error("checksum mismatch (expected {expected:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("out of sequence frame (expected {expected}, got {got})")]
    OutOfSequence { expected: u32, got: u32 },
}

/// Result of one successful [`decode`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A full frame, and how many input bytes it occupied.
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds only part of a frame; read more bytes.
    Incomplete,
}

fn checksum(sequence: &[u8], kind: u8, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(sequence);
    hasher.update(&[kind]);
    hasher.update(payload);
    hasher.finalize()
}

pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    if frame.payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge {
            len: frame.payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let len = (FRAME_OVERHEAD + frame.payload.len()) as u32;
    let sequence = frame.sequence.to_be_bytes();
    let kind = frame.kind.to_u8();

    let mut out = Vec::with_capacity(frame.encoded_len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&sequence);
    out.push(kind);
    out.extend_from_slice(&frame.payload);
    out.extend_from_slice(&checksum(&sequence, kind, &frame.payload).to_be_bytes());
    Ok(out)
}

/// Decodes the first frame in `buf`.
///
/// A bad length prefix is reported as soon as its four bytes are present, so a
/// garbage stream never parks the reader waiting for a huge frame.
pub fn decode(buf: &[u8]) -> Result<Decoded, CodecError> {
    if buf.len() < LENGTH_FIELD_LEN {
        return Ok(Decoded::Incomplete);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if !(FRAME_OVERHEAD..=MAX_FRAME_LEN).contains(&len) {
        return Err(CodecError::InvalidLength {
            len,
            min: FRAME_OVERHEAD,
            max: MAX_FRAME_LEN,
        });
    }

    let total = LENGTH_FIELD_LEN + len;
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }

    let body = &buf[LENGTH_FIELD_LEN..total];
    let (sequence_bytes, rest) = body.split_at(4);
    let kind_byte = rest[0];
    let (payload, checksum_bytes) = rest[1..].split_at(rest.len() - 1 - 4);

    let expected = u32::from_be_bytes([
        checksum_bytes[0],
        checksum_bytes[1],
        checksum_bytes[2],
        checksum_bytes[3],
    ]);
    let computed = checksum(sequence_bytes, kind_byte, payload);
    if expected != computed {
        return Err(CodecError::ChecksumMismatch { expected, computed });
    }

    let kind = FrameKind::from_u8(kind_byte).ok_or(CodecError::UnknownKind(kind_byte))?;
    let sequence = u32::from_be_bytes([
        sequence_bytes[0],
        sequence_bytes[1],
        sequence_bytes[2],
        sequence_bytes[3],
    ]);

    Ok(Decoded::Frame {
        frame: Frame::new(sequence, kind, payload.to_vec()),
        consumed: total,
    })
}

/// Accumulates stream bytes and yields whole frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        match decode(&self.buffer)? {
            Decoded::Frame { frame, consumed } => {
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            Decoded::Incomplete => Ok(None),
        }
    }
}

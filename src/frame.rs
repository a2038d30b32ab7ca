//! Byte level framing of LCP messages.
//!
//! ```text
//! byte 0      bits 7-5  message type: 001 All, 100 Recall, 111 Update
//!             bits 4-0  number of bytes following the header
//! byte 1..n             payload
//! byte n+1              checksum, the byte sum of the whole frame is 0 mod 256
//! ```
//!
//! The length field counts every byte after the header, checksum included,
//! so an `Update` frame always starts with `0xE2`.

use arrayvec::ArrayVec;
use snafu::{ensure, Snafu};

use crate::bits::BitVector;
use crate::nom_parser::{parse_frame, FrameToken};
use crate::types::{ExpansionUnits, MessageType, PointIndex};

/// Largest possible frame: header, 16 payload bytes, checksum.
pub const MAX_FRAME_LEN: usize = 18;

/// Encoded frame.
pub type FrameBytes = ArrayVec<u8, MAX_FRAME_LEN>;

/// Error returned by [`encode`].
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum EncodeError {
    /// The payload doesn't have the fixed size of its message type.
    #[snafu(display("{kind:?} payload must be {expected} bytes, got {actual}"))]
    InvalidPayloadLength {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },
}

/// Frame level faults. The offending frame is discarded.
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum DecodeError {
    /// The type bits don't name a defined message type.
    #[snafu(display("Invalid message type in header {header:#04x}"))]
    InvalidMessageType { header: u8 },
    /// The length field doesn't match the message type.
    #[snafu(display("Invalid message length {declared}, expected {expected}"))]
    InvalidMessageLength { declared: u8, expected: u8 },
    /// The frame bytes don't sum to zero.
    #[snafu(display("Checksum failure, frame sums to {sum:#04x}"))]
    ChecksumFailure { sum: u8 },
    /// The frame ended before all declared bytes arrived.
    #[snafu(display("Incomplete message"))]
    IncompleteMessage,
}

/// Single point change carried by an `Update` frame.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Update {
    pub index: PointIndex,
    pub state: bool,
}

impl Update {
    pub const fn new(index: PointIndex, state: bool) -> Self {
        Self { index, state }
    }

    /// Bits 0-6 hold the index, bit 7 the state.
    pub const fn to_byte(self) -> u8 {
        self.index.to_wire() | if self.state { 0x80 } else { 0 }
    }

    pub const fn from_byte(byte: u8) -> Self {
        Self {
            index: PointIndex::from_wire(byte),
            state: byte & 0x80 != 0,
        }
    }
}

/// One protocol message.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Frame {
    /// Ask the peer to report all of its points.
    Recall,
    /// The complete point vector of the sender.
    All(BitVector),
    /// A single point change.
    Update(Update),
}

impl Frame {
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Recall => MessageType::Recall,
            Self::All(_) => MessageType::All,
            Self::Update(_) => MessageType::Update,
        }
    }

    /// Encode the frame into its on-wire form.
    pub fn encode(&self) -> FrameBytes {
        let mut data = FrameBytes::new();
        let payload_len = match self {
            Self::Recall => 0,
            Self::All(bits) => bits.units().all_payload_len(),
            Self::Update(_) => 1,
        };
        data.push(self.message_type().header_bits() | (payload_len as u8 + 1));
        match self {
            Self::Recall => {}
            Self::All(bits) => data.extend(bits.to_bytes()),
            Self::Update(update) => data.push(update.to_byte()),
        }
        data.push(checksum(&data));
        data
    }

    /// Build a frame from an already length checked payload.
    pub(crate) fn from_parts(kind: MessageType, payload: &[u8], units: ExpansionUnits) -> Self {
        match kind {
            MessageType::Recall => Self::Recall,
            MessageType::Update => Self::Update(Update::from_byte(payload[0])),
            // payload length was verified by the caller
            MessageType::All => Self::All(
                BitVector::from_bytes(units, payload).unwrap_or_else(|_| BitVector::new(units)),
            ),
        }
    }
}

/// Checksum byte making the sum of `data` and the checksum zero mod 256.
pub fn checksum(data: &[u8]) -> u8 {
    byte_sum(data).wrapping_neg()
}

pub(crate) fn byte_sum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Encode a raw payload of the given message type.
/// # Errors
/// Returns [`EncodeError::InvalidPayloadLength`] if the payload size isn't
/// the fixed size of `kind` with `units` expansion units.
pub fn encode(
    kind: MessageType,
    payload: &[u8],
    units: ExpansionUnits,
) -> Result<FrameBytes, EncodeError> {
    let expected = kind.payload_len(units);
    ensure!(
        payload.len() == expected,
        InvalidPayloadLengthSnafu {
            kind,
            expected,
            actual: payload.len(),
        }
    );
    Ok(Frame::from_parts(kind, payload, units).encode())
}

/// Decode one complete frame.
///
/// The byte sum is checked before anything else, so a buffer that doesn't
/// sum to zero always fails with [`DecodeError::ChecksumFailure`].
/// # Errors
/// Returns the [`DecodeError`] describing why the frame was rejected.
pub fn decode(bytes: &[u8], units: ExpansionUnits) -> Result<Frame, DecodeError> {
    ensure!(!bytes.is_empty(), IncompleteMessageSnafu);
    let sum = byte_sum(bytes);
    ensure!(sum == 0, ChecksumFailureSnafu { sum });

    match parse_frame(bytes, units) {
        (consumed, FrameToken::Frame(frame)) if consumed == bytes.len() => Ok(frame),
        // trailing bytes after a well formed frame
        (_, FrameToken::Frame(_)) => InvalidMessageLengthSnafu {
            declared: bytes[0] & 0x1f,
            expected: (bytes.len() - 1).min(u8::MAX as usize) as u8,
        }
        .fail(),
        (_, FrameToken::Invalid(err)) => Err(err),
        (_, FrameToken::NeedData) => IncompleteMessageSnafu.fail(),
    }
}

use nom::bytes::streaming::take;
use nom::combinator::{consumed, map_res};
use nom::number::streaming::u8;
use nom::sequence::pair;
use nom::Err::Incomplete;
use nom::IResult;

use crate::frame::{byte_sum, DecodeError, Frame};
use crate::types::{ExpansionUnits, MessageType};

type Buf = [u8];

#[derive(PartialEq, Debug, Copy, Clone)]
pub(crate) enum FrameToken {
    Frame(Frame),
    Invalid(DecodeError),
    NeedData,
}

/// Parse one frame from the start of `buf`.
///
/// Returns the number of bytes to drop from the buffer together with the
/// token. Nothing is consumed while more data is needed. A bad header
/// consumes only the header byte, so that parsing can resynchronise on the
/// next byte, while a checksum failure consumes the whole declared frame.
pub(crate) fn parse_frame(buf: &Buf, units: ExpansionUnits) -> (usize, FrameToken) {
    let (rest, (kind, declared)) = match header(units)(buf) {
        Ok(ok) => ok,
        Err(Incomplete(_)) => return (0, FrameToken::NeedData),
        Err(_) => return (1, FrameToken::Invalid(classify_header(buf[0], units))),
    };

    match body(declared)(rest) {
        Ok((remaining, (raw, payload))) => {
            let frame_len = buf.len() - remaining.len();
            let sum = byte_sum(&buf[..frame_len]);
            if sum != 0 {
                return (frame_len, FrameToken::Invalid(DecodeError::ChecksumFailure { sum }));
            }
            debug_assert_eq!(raw.len(), declared);
            (frame_len, FrameToken::Frame(Frame::from_parts(kind, payload, units)))
        }
        Err(_) => (0, FrameToken::NeedData),
    }
}

/// Header byte, accepted only if both the type and the length are valid.
fn header<'a>(units: ExpansionUnits) -> impl Fn(&'a Buf) -> IResult<&'a Buf, (MessageType, usize)> {
    move |buf: &'a Buf| {
        map_res(u8, |header: u8| {
            let kind = MessageType::from_header(header).map_err(|_| ())?;
            let declared = (header & 0x1f) as usize;
            if declared == kind.payload_len(units) + 1 {
                Ok((kind, declared))
            } else {
                Err(())
            }
        })(buf)
    }
}

/// Payload and checksum. Returns the raw bytes and the payload slice.
fn body<'a>(declared: usize) -> impl Fn(&'a Buf) -> IResult<&'a Buf, (&'a Buf, &'a Buf)> {
    move |buf: &'a Buf| {
        let (rest, (raw, (payload, _checksum))) =
            consumed(pair(take(declared - 1), u8))(buf)?;
        Ok((rest, (raw, payload)))
    }
}

fn classify_header(header: u8, units: ExpansionUnits) -> DecodeError {
    match MessageType::from_header(header) {
        Err(_) => DecodeError::InvalidMessageType { header },
        Ok(kind) => DecodeError::InvalidMessageLength {
            declared: header & 0x1f,
            expected: kind.payload_len(units) as u8 + 1,
        },
    }
}

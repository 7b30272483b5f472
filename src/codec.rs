//! Frame codec for the Kilovault status protocol.
//!
//! Every received frame is untrusted: it may be truncated, duplicated or
//! corrupted on the air. Decoding validates length, start marker, hex
//! encoding and checksum, in that order, before a single field is read.

use std::time::Instant;

use crate::error::DecodeError;
use crate::message::status_message::CHECKSUM_OFFSET;
use crate::message::{
    PollRequest, StatusMessage, START_BYTE, STATUS_FRAME_LEN, STATUS_PAYLOAD_LEN,
};
use crate::telemetry::TelemetryRecord;

/// Build the request for a status frame.
pub fn encode_poll() -> PollRequest {
    PollRequest::status()
}

/// Decode a complete status frame, stamping the record with the current time.
pub fn decode(frame: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    decode_at(frame, Instant::now())
}

/// Decode a complete status frame into a record stamped with `timestamp`.
pub fn decode_at(frame: &[u8], timestamp: Instant) -> Result<TelemetryRecord, DecodeError> {
    let payload = unwrap_frame(frame)?;
    Ok(StatusMessage::from_payload(&payload).into_record(timestamp))
}

/// Build a valid status frame carrying `message`.
pub fn encode_status(message: &StatusMessage) -> Vec<u8> {
    let mut payload = message.to_payload();
    let [hi, lo] = checksum(&payload[..CHECKSUM_OFFSET]).to_be_bytes();
    payload[CHECKSUM_OFFSET] = hi;
    payload[CHECKSUM_OFFSET + 1] = lo;

    let mut frame = Vec::with_capacity(STATUS_FRAME_LEN);
    frame.push(START_BYTE);
    frame.extend_from_slice(hex::encode_upper(payload).as_bytes());
    frame
}

/// Validate the framing of `frame` and return its hex-decoded payload.
///
/// The frame format is:
///
/// Start Byte | End Byte | Meaning
/// 0          | 0        | The start marker 0xB0
/// 1          | 108      | 54 payload bytes as ASCII hex
/// 109        | 112      | Additive checksum over the payload bytes, big-endian
/// 113        | 120      | Unused, still hex
fn unwrap_frame(frame: &[u8]) -> Result<[u8; STATUS_PAYLOAD_LEN], DecodeError> {
    if frame.len() < STATUS_FRAME_LEN {
        return Err(DecodeError::TooShort {
            len: frame.len(),
            expected: STATUS_FRAME_LEN,
        });
    }
    if frame.len() > STATUS_FRAME_LEN {
        return Err(DecodeError::LengthMismatch {
            len: frame.len(),
            expected: STATUS_FRAME_LEN,
        });
    }
    if frame[0] != START_BYTE {
        return Err(DecodeError::UnknownFrameType(frame[0]));
    }

    let mut payload = [0u8; STATUS_PAYLOAD_LEN];
    hex::decode_to_slice(&frame[1..], &mut payload).map_err(|err| match err {
        hex::FromHexError::InvalidHexCharacter { index, .. } => DecodeError::InvalidEncoding {
            offset: index + 1,
            byte: frame[index + 1],
        },
        // Length was checked above, so only a bad digit can get here.
        _ => DecodeError::InvalidEncoding {
            offset: 1,
            byte: frame[1],
        },
    })?;

    let computed = checksum(&payload[..CHECKSUM_OFFSET]);
    let received = u16::from_be_bytes([payload[CHECKSUM_OFFSET], payload[CHECKSUM_OFFSET + 1]]);
    if computed != received {
        return Err(DecodeError::BadChecksum { computed, received });
    }

    Ok(payload)
}

/// 16 bit wrapping sum of the given bytes.
fn checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)))
}

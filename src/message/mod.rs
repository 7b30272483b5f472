//! Kilovault message types.
//!
//! The BMS speaks a small proprietary protocol on top of a pair of GATT
//! characteristics. Requests are short binary frames written to the control
//! characteristic. The device answers with a 121 byte status frame pushed as
//! one or more notifications: a `0xB0` start marker followed by 120 ASCII hex
//! digits which encode a 60 byte little-endian payload.

pub mod poll_request;
pub mod status_message;

pub use poll_request::PollRequest;
pub use status_message::StatusMessage;

/// Start marker of every frame, in both directions.
pub const START_BYTE: u8 = 0xB0;

/// Total length of a status frame on the wire (start byte + hex digits).
pub const STATUS_FRAME_LEN: usize = 121;

/// Length of the payload carried by a status frame once hex-decoded.
pub const STATUS_PAYLOAD_LEN: usize = (STATUS_FRAME_LEN - 1) / 2;

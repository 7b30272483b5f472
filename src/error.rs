use thiserror::Error;

/// Reasons a received frame could not be turned into a telemetry record.
///
/// Frames arrive over a wireless link, so every one of these is expected in
/// normal operation. They are logged and counted as a failed poll.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame too short: got {len} bytes, need {expected}")]
    TooShort { len: usize, expected: usize },

    #[error("frame length mismatch: got {len} bytes, expected {expected}")]
    LengthMismatch { len: usize, expected: usize },

    #[error("unknown frame type (start byte 0x{0:02X})")]
    UnknownFrameType(u8),

    #[error("invalid hex digit 0x{byte:02X} at offset {offset}")]
    InvalidEncoding { offset: usize, byte: u8 },

    #[error("checksum mismatch: computed 0x{computed:04X}, frame carries 0x{received:04X}")]
    BadChecksum { computed: u16, received: u16 },
}

/// Failures writing to the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Configuration could not be loaded or is not usable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

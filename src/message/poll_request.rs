use super::{START_BYTE, STATUS_FRAME_LEN};

/// Address the BMS answers on.
pub(crate) const DEVICE_ADDRESS: u8 = 0x16;
/// Command id requesting a status frame.
pub(crate) const CMD_READ_STATUS: u8 = 0x01;
/// Two byte end marker of a request.
pub(crate) const END_BYTES: [u8; 2] = [0x52, 0x52];

/// The verbatim request for a status frame.
pub(crate) const REQUEST: [u8; 6] = [
    START_BYTE,
    DEVICE_ADDRESS,
    CMD_READ_STATUS,
    DEVICE_ADDRESS.wrapping_add(CMD_READ_STATUS),
    END_BYTES[0],
    END_BYTES[1],
];

/// One poll of the device: the bytes to write and how long the answer should be.
///
/// Built by the scheduler each cycle and consumed once by the session adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    bytes: Vec<u8>,
    expected_response_len: usize,
}

impl PollRequest {
    pub(crate) fn status() -> Self {
        Self {
            bytes: REQUEST.to_vec(),
            expected_response_len: STATUS_FRAME_LEN,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn expected_response_len(&self) -> usize {
        self.expected_response_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_checksum_covers_address_and_command() {
        assert_eq!(REQUEST, [0xB0, 0x16, 0x01, 0x17, 0x52, 0x52]);
    }

    #[test]
    fn status_request_expects_a_full_status_frame() {
        let request = PollRequest::status();
        assert_eq!(request.bytes(), &REQUEST[..]);
        assert_eq!(request.expected_response_len(), 121);
    }
}

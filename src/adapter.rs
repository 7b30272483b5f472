//! Maps the codec's byte streams onto a connected BLE link.
//!
//! ## GATT layout
//!
//! | Characteristic | UUID (16 bit) | Use                       |
//! |----------------|---------------|---------------------------|
//! | Service        | `0xFFE0`      |                           |
//! | Notify         | `0xFFE4`      | status frames from the BMS |
//! | Control        | `0xFA02`      | poll requests to the BMS  |
//!
//! Status frames are longer than a notification, so they arrive in pieces.
//! A piece starting with the `0xB0` start marker begins a new frame; pieces
//! are appended until the frame reaches its full length.

use std::time::Instant;

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::codec;
use crate::error::{DecodeError, TransportError};
use crate::message::{PollRequest, START_BYTE, STATUS_FRAME_LEN};
use crate::telemetry::TelemetryRecord;

pub const SERVICE_UUID: Uuid = bluetooth_uuid(0xFFE0);
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = bluetooth_uuid(0xFFE4);
pub const CONTROL_CHARACTERISTIC_UUID: Uuid = bluetooth_uuid(0xFA02);

/// Expand a 16 bit assigned number onto the Bluetooth base UUID.
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Write side of the underlying BLE link.
///
/// Writes are fire-and-forget: an `Ok` only means the write was handed to the
/// link. A failure that shows up later is reported back to the session.
pub trait BleTransport {
    fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;
}

/// Accumulates notification pieces into whole frames.
#[derive(Debug)]
pub(crate) struct FrameAssembler {
    buffer: Vec<u8>,
    expected_len: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            expected_len: STATUS_FRAME_LEN,
        }
    }
}

impl FrameAssembler {
    /// Length of the frame answering the request just sent.
    pub(crate) fn expect(&mut self, len: usize) {
        self.expected_len = len;
    }

    /// Append a piece. Returns the frame once it is complete.
    pub(crate) fn push(&mut self, piece: &[u8]) -> Option<Vec<u8>> {
        if piece.first() == Some(&START_BYTE) {
            if !self.buffer.is_empty() {
                debug!(dropped = self.buffer.len(), "new frame started before the last completed");
            }
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(piece);

        let expected = self.expected_len;
        match self.buffer.len() {
            len if len < expected => None,
            len if len == expected => Some(std::mem::take(&mut self.buffer)),
            len => {
                warn!(len, expected, "maximum response size exceeded");
                self.buffer.clear();
                None
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
    }

    pub(crate) fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Owns the link's connection state and its reassembly buffer.
#[derive(Debug)]
pub struct SessionAdapter<T> {
    transport: T,
    state: ConnectionState,
    assembler: FrameAssembler,
}

impl<T: BleTransport> SessionAdapter<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            assembler: FrameAssembler::default(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns whether the state actually changed.
    pub fn set_connection_state(&mut self, state: ConnectionState) -> bool {
        if state == self.state {
            return false;
        }
        info!(from = ?self.state, to = ?state, "connection state changed");
        self.state = state;
        if state != ConnectionState::Connected {
            if self.assembler.pending() > 0 {
                debug!(dropped = self.assembler.pending(), "discarding partial frame");
            }
            self.assembler.clear();
        }
        true
    }

    /// Write `request` to the control characteristic.
    pub fn send(&mut self, request: &PollRequest) -> Result<(), TransportError> {
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        debug!(tx = %hex::encode(request.bytes()), "sending poll");
        self.assembler.expect(request.expected_response_len());
        self.transport
            .write(CONTROL_CHARACTERISTIC_UUID, request.bytes())
    }

    /// Handle a notification. Returns a decode result once a whole frame has
    /// been assembled.
    pub fn on_notify(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
        now: Instant,
    ) -> Option<Result<TelemetryRecord, DecodeError>> {
        if characteristic != NOTIFY_CHARACTERISTIC_UUID {
            trace!(%characteristic, "ignoring notification from another characteristic");
            return None;
        }
        if self.state != ConnectionState::Connected {
            debug!("ignoring notification while not connected");
            return None;
        }
        debug!(rx = %hex::encode(data), "notification");

        let frame = self.assembler.push(data)?;
        Some(codec::decode_at(&frame, now))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::message::StatusMessage;

    #[derive(Default, Clone)]
    struct RecordingTransport {
        writes: Arc<Mutex<Vec<(Uuid, Vec<u8>)>>>,
    }

    impl BleTransport for RecordingTransport {
        fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
            self.writes.lock().unwrap().push((characteristic, data.to_vec()));
            Ok(())
        }
    }

    fn connected() -> SessionAdapter<RecordingTransport> {
        let mut adapter = SessionAdapter::new(RecordingTransport::default());
        adapter.set_connection_state(ConnectionState::Connected);
        adapter
    }

    fn frame() -> Vec<u8> {
        codec::encode_status(&StatusMessage {
            voltage_mv: 13_300,
            status: 1,
            ..Default::default()
        })
    }

    #[test]
    fn uuids_expand_on_the_base_uuid() {
        assert_eq!(
            NOTIFY_CHARACTERISTIC_UUID.to_string(),
            "0000ffe4-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CONTROL_CHARACTERISTIC_UUID.to_string(),
            "0000fa02-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn send_requires_connection() {
        let mut adapter = SessionAdapter::new(RecordingTransport::default());
        assert_eq!(
            adapter.send(&codec::encode_poll()),
            Err(TransportError::NotConnected)
        );
        adapter.set_connection_state(ConnectionState::Connecting);
        assert_eq!(
            adapter.send(&codec::encode_poll()),
            Err(TransportError::NotConnected)
        );
        assert!(adapter.transport().writes.lock().unwrap().is_empty());
    }

    #[test]
    fn send_writes_to_the_control_characteristic() {
        let mut adapter = connected();
        adapter.send(&codec::encode_poll()).unwrap();
        let writes = adapter.transport().writes.lock().unwrap().clone();
        assert_eq!(
            writes,
            vec![(CONTROL_CHARACTERISTIC_UUID, codec::encode_poll().bytes().to_vec())]
        );
    }

    #[test]
    fn reassembles_fragments() {
        let mut adapter = connected();
        let frame = frame();
        let now = Instant::now();

        let mut results = Vec::new();
        for piece in frame.chunks(20) {
            if let Some(result) = adapter.on_notify(NOTIFY_CHARACTERISTIC_UUID, piece, now) {
                results.push(result);
            }
        }
        assert_eq!(results.len(), 1);
        assert!((results[0].as_ref().unwrap().pack_voltage() - 13.3).abs() < 1e-4);
    }

    #[test]
    fn start_marker_discards_a_partial_frame() {
        let mut assembler = FrameAssembler::default();
        let frame = frame();
        assert!(assembler.push(&frame[..40]).is_none());
        assert_eq!(assembler.pending(), 40);
        assert!(assembler.push(&frame[..60]).is_none());
        assert_eq!(assembler.pending(), 60);
        assert_eq!(assembler.push(&frame[60..]), Some(frame.clone()));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn oversized_buffer_is_dropped() {
        let mut assembler = FrameAssembler::default();
        let frame = frame();
        assert!(assembler.push(&frame[..100]).is_none());
        // Continuation without a start marker overshoots the frame length.
        assert!(assembler.push(&frame[1..]).is_none());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn empty_notification_is_harmless() {
        let mut adapter = connected();
        assert!(adapter
            .on_notify(NOTIFY_CHARACTERISTIC_UUID, &[], Instant::now())
            .is_none());
    }

    #[test]
    fn other_characteristics_are_ignored() {
        let mut adapter = connected();
        let frame = frame();
        assert!(adapter
            .on_notify(CONTROL_CHARACTERISTIC_UUID, &frame, Instant::now())
            .is_none());
    }

    #[test]
    fn disconnect_clears_partial_frame() {
        let mut adapter = connected();
        let frame = frame();
        let now = Instant::now();
        assert!(adapter
            .on_notify(NOTIFY_CHARACTERISTIC_UUID, &frame[..50], now)
            .is_none());

        adapter.set_connection_state(ConnectionState::Disconnected);
        assert_eq!(adapter.assembler.pending(), 0);
        assert!(adapter
            .on_notify(NOTIFY_CHARACTERISTIC_UUID, &frame[50..], now)
            .is_none());

        adapter.set_connection_state(ConnectionState::Connected);
        // The tail on its own is not a frame.
        assert!(adapter
            .on_notify(NOTIFY_CHARACTERISTIC_UUID, &frame[50..], now)
            .is_none());
        assert!(adapter
            .on_notify(NOTIFY_CHARACTERISTIC_UUID, &frame, now)
            .unwrap()
            .is_ok());
    }

    #[test]
    fn repeated_state_is_not_a_change() {
        let mut adapter = SessionAdapter::new(RecordingTransport::default());
        assert!(!adapter.set_connection_state(ConnectionState::Disconnected));
        assert!(adapter.set_connection_state(ConnectionState::Connected));
        assert!(!adapter.set_connection_state(ConnectionState::Connected));
    }

    #[test]
    fn frame_length_follows_the_request() {
        let mut assembler = FrameAssembler::default();
        assembler.expect(8);
        assert!(assembler.push(&[START_BYTE, 1, 2, 3]).is_none());
        assert_eq!(
            assembler.push(&[4, 5, 6, 7]),
            Some(vec![START_BYTE, 1, 2, 3, 4, 5, 6, 7])
        );

        let mut adapter = connected();
        adapter.assembler.expect(8);
        adapter.send(&codec::encode_poll()).unwrap();
        assert_eq!(adapter.assembler.expected_len, STATUS_FRAME_LEN);
    }
}

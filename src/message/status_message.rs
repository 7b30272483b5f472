use std::time::Instant;

use super::STATUS_PAYLOAD_LEN;
use crate::telemetry::{FaultCode, TelemetryRecord, CELL_COUNT};

/// Millivolts, milliamps and milliamp hours to base units.
const MILLI: f32 = 0.001;
/// Temperatures are reported in tenths of a kelvin.
const DECI_KELVIN: f32 = 0.1;
const KELVIN_OFFSET: f32 = 273.15;

/// Payload offsets. All values are little-endian.
const VOLTAGE_OFFSET: usize = 0;
const CURRENT_OFFSET: usize = 4;
const TOTAL_CAPACITY_OFFSET: usize = 8;
const CYCLES_OFFSET: usize = 12;
const SOC_OFFSET: usize = 14;
const TEMPERATURE_OFFSET: usize = 16;
const STATUS_OFFSET: usize = 18;
const AFE_STATUS_OFFSET: usize = 20;
const CELL_VOLTAGES_OFFSET: usize = 22;

/// Checksum is carried at `[54]` (high byte) and `[55]` (low byte) and covers
/// everything before it.
pub(crate) const CHECKSUM_OFFSET: usize = 54;

/// A message type which contains the pack status in raw protocol units.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusMessage {
    /// Pack voltage in mV
    pub voltage_mv: u16,
    /// Pack current in mA, positive while charging
    pub current_ma: i32,
    /// Full capacity in mAh
    pub total_capacity_mah: u32,
    pub cycles: u16,
    /// State of charge in %
    pub state_of_charge_pct: u16,
    /// Temperature in 0.1 K
    pub temperature_dk: u16,
    /// Status word. Zero while the BMS has nothing to report.
    pub status: u16,
    /// Analog front end status bits
    pub afe_status: u16,
    /// The voltage of each cell in mV
    pub cell_voltage_mv: [u16; CELL_COUNT],
}

impl StatusMessage {
    pub(crate) fn from_payload(payload: &[u8; STATUS_PAYLOAD_LEN]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([payload[i], payload[i + 1]]);
        let u32_at = |i: usize| {
            u32::from_le_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]])
        };

        let mut cell_voltage_mv = [0u16; CELL_COUNT];
        for (cell, mv) in cell_voltage_mv.iter_mut().enumerate() {
            *mv = u16_at(CELL_VOLTAGES_OFFSET + cell * 2);
        }

        Self {
            voltage_mv: u16_at(VOLTAGE_OFFSET),
            current_ma: u32_at(CURRENT_OFFSET) as i32,
            total_capacity_mah: u32_at(TOTAL_CAPACITY_OFFSET),
            cycles: u16_at(CYCLES_OFFSET),
            state_of_charge_pct: u16_at(SOC_OFFSET),
            temperature_dk: u16_at(TEMPERATURE_OFFSET),
            status: u16_at(STATUS_OFFSET),
            afe_status: u16_at(AFE_STATUS_OFFSET),
            cell_voltage_mv,
        }
    }

    /// The payload without checksum; bytes the protocol leaves unused are zero.
    pub(crate) fn to_payload(&self) -> [u8; STATUS_PAYLOAD_LEN] {
        let mut payload = [0u8; STATUS_PAYLOAD_LEN];
        let mut put = |i: usize, bytes: &[u8]| payload[i..i + bytes.len()].copy_from_slice(bytes);

        put(VOLTAGE_OFFSET, &self.voltage_mv.to_le_bytes());
        put(CURRENT_OFFSET, &self.current_ma.to_le_bytes());
        put(TOTAL_CAPACITY_OFFSET, &self.total_capacity_mah.to_le_bytes());
        put(CYCLES_OFFSET, &self.cycles.to_le_bytes());
        put(SOC_OFFSET, &self.state_of_charge_pct.to_le_bytes());
        put(TEMPERATURE_OFFSET, &self.temperature_dk.to_le_bytes());
        put(STATUS_OFFSET, &self.status.to_le_bytes());
        put(AFE_STATUS_OFFSET, &self.afe_status.to_le_bytes());
        for (cell, mv) in self.cell_voltage_mv.iter().enumerate() {
            put(CELL_VOLTAGES_OFFSET + cell * 2, &mv.to_le_bytes());
        }
        payload
    }

    /// Scale the raw values into a record stamped with `timestamp`.
    pub fn into_record(self, timestamp: Instant) -> TelemetryRecord {
        TelemetryRecord::new(
            f32::from(self.voltage_mv) * MILLI,
            self.current_ma as f32 * MILLI,
            self.cell_voltage_mv
                .iter()
                .map(|&mv| f32::from(mv) * MILLI)
                .collect(),
            vec![f32::from(self.temperature_dk) * DECI_KELVIN - KELVIN_OFFSET],
            f32::from(self.state_of_charge_pct),
            FaultCode::from_afe_status(self.afe_status),
            self.cycles,
            self.total_capacity_mah as f32 * MILLI,
            self.status,
            self.afe_status,
            timestamp,
        )
    }
}

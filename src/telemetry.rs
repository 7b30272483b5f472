use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use serde::{Serialize, Serializer};

/// Number of cells reported by the Kilovault pack.
pub const CELL_COUNT: usize = 4;
/// Number of temperature probes reported by the Kilovault pack.
pub const TEMPERATURE_COUNT: usize = 1;

/// Protection faults raised by the BMS analog front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    CellOverVoltage,
    CellUnderVoltage,
    ChargeOverCurrent,
    DischargeOverCurrent,
    OverTemperature,
    UnderTemperature,
    ShortCircuit,
}

impl FaultCode {
    /// Indexed by AFE status bit.
    const BY_BIT: [FaultCode; 7] = [
        FaultCode::CellOverVoltage,
        FaultCode::CellUnderVoltage,
        FaultCode::ChargeOverCurrent,
        FaultCode::DischargeOverCurrent,
        FaultCode::OverTemperature,
        FaultCode::UnderTemperature,
        FaultCode::ShortCircuit,
    ];

    pub fn from_afe_status(afe_status: u16) -> BTreeSet<FaultCode> {
        Self::BY_BIT
            .iter()
            .enumerate()
            .filter(|(bit, _)| afe_status & (1 << bit) != 0)
            .map(|(_, &code)| code)
            .collect()
    }
}

/// The reported state of the battery.
///
/// Created by the codec on a successful decode and never modified afterwards;
/// the next decode supersedes it.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pack_voltage: f32,
    pack_current: f32,
    cell_voltages: Vec<f32>,
    temperatures: Vec<f32>,
    state_of_charge: f32,
    faults: BTreeSet<FaultCode>,
    cycles: u16,
    total_capacity: f32,
    status: u16,
    afe_status: u16,
    timestamp: Instant,
}

impl TelemetryRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pack_voltage: f32,
        pack_current: f32,
        cell_voltages: Vec<f32>,
        temperatures: Vec<f32>,
        state_of_charge: f32,
        faults: BTreeSet<FaultCode>,
        cycles: u16,
        total_capacity: f32,
        status: u16,
        afe_status: u16,
        timestamp: Instant,
    ) -> Self {
        Self {
            pack_voltage,
            pack_current,
            cell_voltages,
            temperatures,
            state_of_charge,
            faults,
            cycles,
            total_capacity,
            status,
            afe_status,
            timestamp,
        }
    }

    /// Pack voltage in V
    pub fn pack_voltage(&self) -> f32 {
        self.pack_voltage
    }

    /// Pack current in A. Positive while charging.
    pub fn pack_current(&self) -> f32 {
        self.pack_current
    }

    /// Cell voltages in V, one per cell in pack order.
    pub fn cell_voltages(&self) -> &[f32] {
        &self.cell_voltages
    }

    /// Temperatures in °C
    pub fn temperatures(&self) -> &[f32] {
        &self.temperatures
    }

    /// State of charge in %
    pub fn state_of_charge(&self) -> f32 {
        self.state_of_charge
    }

    pub fn faults(&self) -> &BTreeSet<FaultCode> {
        &self.faults
    }

    /// Lifetime number of charge cycles
    pub fn cycles(&self) -> u16 {
        self.cycles
    }

    /// Full capacity in Ah
    pub fn total_capacity(&self) -> f32 {
        self.total_capacity
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn afe_status(&self) -> u16 {
        self.afe_status
    }

    /// When the frame this record was decoded from completed.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// A zero status word means the pack sent a frame without measurements.
    pub fn is_reporting(&self) -> bool {
        self.status != 0
    }

    /// Power in W. Positive while charging.
    pub fn power(&self) -> f32 {
        self.pack_voltage * self.pack_current
    }

    pub fn charging_power(&self) -> f32 {
        self.power().max(0.0)
    }

    pub fn discharging_power(&self) -> f32 {
        self.power().min(0.0).abs()
    }

    /// Remaining capacity in Ah
    pub fn current_capacity(&self) -> f32 {
        self.total_capacity * self.state_of_charge * 0.01
    }

    /// Lowest non-zero cell voltage and its 1-based cell number.
    pub fn min_cell_voltage(&self) -> Option<(usize, f32)> {
        self.cell_voltages
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > 0.0)
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, &v)| (i + 1, v))
    }

    /// Highest cell voltage and its 1-based cell number.
    pub fn max_cell_voltage(&self) -> Option<(usize, f32)> {
        self.cell_voltages
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, &v)| (i + 1, v))
    }

    pub fn delta_cell_voltage(&self) -> Option<f32> {
        match (self.min_cell_voltage(), self.max_cell_voltage()) {
            (Some((_, min)), Some((_, max))) => Some(max - min),
            _ => None,
        }
    }

    /// [`measurements`](Self::measurements) headed by the identifier of the
    /// battery that sent the record.
    pub fn measurements_for(&self, battery_id: &str) -> Vec<Measurement> {
        let mut out = vec![Measurement {
            channel: Channel::BatteryId,
            value: MeasurementValue::Text(battery_id.to_owned()),
        }];
        out.extend(self.measurements());
        out
    }

    /// Flatten the record into named channels for downstream publication.
    ///
    /// A record that is not reporting only carries its status words.
    pub fn measurements(&self) -> Vec<Measurement> {
        let mut out = vec![
            Measurement::number(Channel::Status, f32::from(self.status)),
            Measurement::number(Channel::AfeStatus, f32::from(self.afe_status)),
        ];
        if !self.is_reporting() {
            return out;
        }

        out.extend([
            Measurement::number(Channel::Voltage, self.pack_voltage),
            Measurement::number(Channel::Current, self.pack_current),
            Measurement::number(Channel::Power, self.power()),
            Measurement::number(Channel::ChargingPower, self.charging_power()),
            Measurement::number(Channel::DischargingPower, self.discharging_power()),
            Measurement::number(Channel::StateOfCharge, self.state_of_charge),
            Measurement::number(Channel::Cycles, f32::from(self.cycles)),
            Measurement::number(Channel::TotalCapacity, self.total_capacity),
            Measurement::number(Channel::CurrentCapacity, self.current_capacity()),
        ]);
        for (i, &t) in self.temperatures.iter().enumerate() {
            out.push(Measurement::number(Channel::Temperature(i + 1), t));
        }
        for (i, &v) in self.cell_voltages.iter().enumerate() {
            out.push(Measurement::number(Channel::CellVoltage(i + 1), v));
        }
        if let Some((cell, v)) = self.min_cell_voltage() {
            out.push(Measurement::number(Channel::MinCellVoltage, v));
            out.push(Measurement::number(Channel::MinVoltageCell, cell as f32));
        }
        if let Some((cell, v)) = self.max_cell_voltage() {
            out.push(Measurement::number(Channel::MaxCellVoltage, v));
            out.push(Measurement::number(Channel::MaxVoltageCell, cell as f32));
        }
        if let Some(delta) = self.delta_cell_voltage() {
            out.push(Measurement::number(Channel::DeltaCellVoltage, delta));
        }
        out.push(Measurement {
            channel: Channel::Faults,
            value: MeasurementValue::Faults(self.faults.iter().copied().collect()),
        });
        out
    }
}

/// A named sensor channel with a stable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Voltage,
    Current,
    Power,
    ChargingPower,
    DischargingPower,
    StateOfCharge,
    Cycles,
    TotalCapacity,
    CurrentCapacity,
    /// 1-based probe number
    Temperature(usize),
    Status,
    AfeStatus,
    MinCellVoltage,
    MaxCellVoltage,
    MinVoltageCell,
    MaxVoltageCell,
    DeltaCellVoltage,
    /// 1-based cell number
    CellVoltage(usize),
    Faults,
    BatteryId,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Voltage => f.write_str("voltage"),
            Channel::Current => f.write_str("current"),
            Channel::Power => f.write_str("power"),
            Channel::ChargingPower => f.write_str("charging_power"),
            Channel::DischargingPower => f.write_str("discharging_power"),
            Channel::StateOfCharge => f.write_str("state_of_charge"),
            Channel::Cycles => f.write_str("cycles"),
            Channel::TotalCapacity => f.write_str("total_capacity"),
            Channel::CurrentCapacity => f.write_str("current_capacity"),
            Channel::Temperature(n) => write!(f, "temperature_{n}"),
            Channel::Status => f.write_str("status"),
            Channel::AfeStatus => f.write_str("afe_status"),
            Channel::MinCellVoltage => f.write_str("min_cell_voltage"),
            Channel::MaxCellVoltage => f.write_str("max_cell_voltage"),
            Channel::MinVoltageCell => f.write_str("min_voltage_cell"),
            Channel::MaxVoltageCell => f.write_str("max_voltage_cell"),
            Channel::DeltaCellVoltage => f.write_str("delta_cell_voltage"),
            Channel::CellVoltage(n) => write!(f, "cell_voltage_{n}"),
            Channel::Faults => f.write_str("faults"),
            Channel::BatteryId => f.write_str("battery_id"),
        }
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Number(f32),
    Faults(Vec<FaultCode>),
    Text(String),
}

/// One channel's value out of a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    #[serde(rename = "id")]
    pub channel: Channel,
    pub value: MeasurementValue,
}

impl Measurement {
    fn number(channel: Channel, value: f32) -> Self {
        Self {
            channel,
            value: MeasurementValue::Number(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cells: Vec<f32>, current: f32, status: u16) -> TelemetryRecord {
        TelemetryRecord::new(
            13.2,
            current,
            cells,
            vec![25.0],
            80.0,
            BTreeSet::new(),
            7,
            100.0,
            status,
            0,
            Instant::now(),
        )
    }

    #[test]
    fn fault_bits_map_to_codes() {
        let faults = FaultCode::from_afe_status(0b0100_0101);
        assert_eq!(
            faults.into_iter().collect::<Vec<_>>(),
            vec![
                FaultCode::CellOverVoltage,
                FaultCode::ChargeOverCurrent,
                FaultCode::ShortCircuit
            ]
        );
        assert!(FaultCode::from_afe_status(0xFF80).is_empty());
    }

    #[test]
    fn power_splits_into_charge_and_discharge() {
        let charging = record(vec![3.3; 4], 10.0, 1);
        assert!(charging.charging_power() > 0.0);
        assert_eq!(charging.discharging_power(), 0.0);

        let discharging = record(vec![3.3; 4], -10.0, 1);
        assert_eq!(discharging.charging_power(), 0.0);
        assert!((discharging.discharging_power() - 132.0).abs() < 1e-3);
    }

    #[test]
    fn min_cell_ignores_empty_cells() {
        let r = record(vec![3.31, 0.0, 3.29, 3.35], 0.0, 1);
        assert_eq!(r.min_cell_voltage(), Some((3, 3.29)));
        assert_eq!(r.max_cell_voltage(), Some((4, 3.35)));
        assert!((r.delta_cell_voltage().unwrap() - 0.06).abs() < 1e-5);
    }

    #[test]
    fn current_capacity_follows_state_of_charge() {
        let r = record(vec![3.3; 4], 0.0, 1);
        assert!((r.current_capacity() - 80.0).abs() < 1e-4);
    }

    #[test]
    fn idle_record_only_publishes_status() {
        let r = record(vec![3.3; 4], 0.0, 0);
        let ids: Vec<String> = r.measurements().iter().map(|m| m.channel.to_string()).collect();
        assert_eq!(ids, vec!["status", "afe_status"]);
    }

    #[test]
    fn measurement_ids_are_stable() {
        let r = record(vec![3.3; 4], 1.0, 1);
        let ids: Vec<String> = r.measurements().iter().map(|m| m.channel.to_string()).collect();
        assert!(ids.contains(&"temperature_1".to_string()));
        assert!(ids.contains(&"cell_voltage_4".to_string()));
        assert!(ids.contains(&"delta_cell_voltage".to_string()));
        assert_eq!(ids.last().map(String::as_str), Some("faults"));
    }

    #[test]
    fn measurements_serialize_with_ids() {
        let m = Measurement::number(Channel::CellVoltage(2), 3.5);
        assert_eq!(
            serde_json::to_string(&m).unwrap(),
            r#"{"id":"cell_voltage_2","value":3.5}"#
        );
        let faults = Measurement {
            channel: Channel::Faults,
            value: MeasurementValue::Faults(vec![FaultCode::OverTemperature]),
        };
        assert_eq!(
            serde_json::to_string(&faults).unwrap(),
            r#"{"id":"faults","value":["over_temperature"]}"#
        );
    }

    #[test]
    fn battery_id_heads_the_measurements() {
        let r = record(vec![3.3; 4], 0.0, 0);
        let m = r.measurements_for("KV-12V-100");
        assert_eq!(m.len(), 3);
        assert_eq!(
            serde_json::to_string(&m[0]).unwrap(),
            r#"{"id":"battery_id","value":"KV-12V-100"}"#
        );
        assert_eq!(m[1..], r.measurements()[..]);
    }
}

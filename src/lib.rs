//! Poll Kilovault LiFePO4 Battery Management Systems over Bluetooth Low Energy
//!
//! The BMS exposes a GATT service with a control characteristic and a notify
//! characteristic. A short request written to the former makes the pack push
//! a status frame through the latter, split over several notifications.
//!
//! Each battery gets a [`BmsSession`]: a [`PollScheduler`] decides when to
//! poll, the [`SessionAdapter`] writes requests and reassembles responses, the
//! [`codec`] turns frames into [`TelemetryRecord`]s and the [`TelemetryStore`]
//! keeps the latest one and tells subscribers about it.
//!
//! Currently the following data can be accessed:
//!
//! - Pack voltage (V), current (A) and power (W)
//! - State of charge (%), cycles, total and remaining capacity (Ah)
//! - Cell voltages (V), temperature (°C)
//! - Status words and protection faults
//!
//! # Example
//!
//! ```rust
//! use std::time::Instant;
//! use kilovault_bms::{codec, BleTransport, BmsSession, ConnectionState, SchedulerConfig};
//! use kilovault_bms::{TransportError, NOTIFY_CHARACTERISTIC_UUID};
//!
//! struct Loopback;
//!
//! impl BleTransport for Loopback {
//!     fn write(&mut self, _: uuid::Uuid, _: &[u8]) -> Result<(), TransportError> {
//!         Ok(())
//!     }
//! }
//!
//! let mut session = BmsSession::new("house", SchedulerConfig::default(), Loopback);
//! session.on_connection_state(ConnectionState::Connected);
//! session.tick(Instant::now());
//!
//! let frame = codec::encode_status(&kilovault_bms::StatusMessage {
//!     voltage_mv: 13_250,
//!     status: 1,
//!     ..Default::default()
//! });
//! session.on_notify(NOTIFY_CHARACTERISTIC_UUID, &frame, Instant::now());
//! assert!((session.current().unwrap().pack_voltage() - 13.25).abs() < 1e-4);
//! ```

pub mod adapter;
pub mod codec;
pub mod config;
pub mod driver;
mod error;
pub mod message;
pub mod scheduler;
mod session;
pub mod store;
pub mod telemetry;

#[cfg(feature = "bluest")]
pub mod bluest_link;

pub use adapter::{
    BleTransport, ConnectionState, SessionAdapter, CONTROL_CHARACTERISTIC_UUID,
    NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID,
};
pub use config::{BmsConfig, DeviceConfig, DeviceDefaults};
pub use driver::{LinkEvent, QueuedTransport};
pub use error::{ConfigError, DecodeError, TransportError};
pub use message::{PollRequest, StatusMessage};
pub use scheduler::{PollScheduler, SchedulerConfig, SchedulerState};
pub use session::BmsSession;
pub use store::{SubscriptionId, TelemetryStore};
pub use telemetry::{Channel, FaultCode, Measurement, MeasurementValue, TelemetryRecord};

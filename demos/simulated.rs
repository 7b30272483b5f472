//! Run a session against a simulated pack that answers every poll, dropping
//! every fourth answer.

use std::time::Duration;

use kilovault_bms::{
    codec, driver, BmsSession, ConnectionState, LinkEvent, QueuedTransport, SchedulerConfig,
    StatusMessage, NOTIFY_CHARACTERISTIC_UUID,
};
use tokio::sync::mpsc;

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    let config = SchedulerConfig {
        update_interval: Duration::from_secs(1),
        response_timeout: Duration::from_millis(500),
        backoff_base: Duration::from_secs(1),
        backoff_cap: Duration::from_secs(5),
        accept_unsolicited: false,
    };
    let (transport, mut writes) = QueuedTransport::channel();
    let (events, rx) = mpsc::unbounded_channel();

    let mut session = BmsSession::new("simulated", config, transport);
    session.subscribe(|record| println!("{record:?}"));
    let session = tokio::spawn(driver::run(session, rx));

    events.send(LinkEvent::Connection(ConnectionState::Connected)).unwrap();
    let mut message = StatusMessage {
        voltage_mv: 13_200,
        current_ma: -1_500,
        total_capacity_mah: 100_000,
        state_of_charge_pct: 90,
        temperature_dk: 2_960,
        status: 1,
        cell_voltage_mv: [3_300, 3_301, 3_299, 3_300],
        ..Default::default()
    };
    for poll in 1..=10u32 {
        if writes.recv().await.is_none() {
            break;
        }
        if poll % 4 == 0 {
            continue;
        }
        message.state_of_charge_pct -= 1;
        for piece in codec::encode_status(&message).chunks(20) {
            let _ = events.send(LinkEvent::Notification {
                characteristic: NOTIFY_CHARACTERISTIC_UUID,
                value: piece.to_vec(),
            });
        }
    }

    drop(events);
    let session = session.await.unwrap();
    println!("final: {:?}", session.current());
}

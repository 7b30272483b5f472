//! Runs a session as a single tokio task.
//!
//! Timer expiries and link events are handled one at a time in one `select!`
//! loop, so the session never needs a lock. The link side talks to the task
//! only through channels: [`LinkEvent`]s in, [`Write`]s out.

use std::future::pending;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::{BleTransport, ConnectionState};
use crate::error::TransportError;
use crate::session::BmsSession;

/// Something the BLE link observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connection(ConnectionState),
    Notification { characteristic: Uuid, value: Vec<u8> },
    WriteFailed(TransportError),
}

/// A characteristic write queued for the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Hands writes to the link task without waiting for them.
#[derive(Debug, Clone)]
pub struct QueuedTransport {
    writes: mpsc::UnboundedSender<Write>,
}

impl QueuedTransport {
    pub fn new(writes: mpsc::UnboundedSender<Write>) -> Self {
        Self { writes }
    }

    /// A transport and the receiving end the link drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Write>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl BleTransport for QueuedTransport {
    fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        self.writes
            .send(Write {
                characteristic,
                value: data.to_vec(),
            })
            .map_err(|_| TransportError::WriteFailed("link task has stopped".into()))
    }
}

/// Drive `session` until the event channel closes, then tear it down and
/// hand it back.
pub async fn run<T: BleTransport>(
    mut session: BmsSession<T>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) -> BmsSession<T> {
    info!(id = session.id(), "session started");
    loop {
        let deadline = session
            .next_deadline(Instant::now().into_std())
            .map(Instant::from_std);
        let timer = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending().await,
            }
        };

        tokio::select! {
            event = events.recv() => {
                let now = Instant::now().into_std();
                match event {
                    Some(LinkEvent::Connection(state)) => session.on_connection_state(state),
                    Some(LinkEvent::Notification { characteristic, value }) => {
                        session.on_notify(characteristic, &value, now)
                    }
                    Some(LinkEvent::WriteFailed(err)) => session.on_write_failed(err, now),
                    None => {
                        debug!(id = session.id(), "link closed");
                        break;
                    }
                }
            }
            _ = timer => session.tick(Instant::now().into_std()),
        }
    }
    session.teardown();
    info!(id = session.id(), "session stopped");
    session
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapter::{CONTROL_CHARACTERISTIC_UUID, NOTIFY_CHARACTERISTIC_UUID};
    use crate::codec;
    use crate::message::StatusMessage;
    use crate::scheduler::{SchedulerConfig, SchedulerState};

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            update_interval: Duration::from_secs(10),
            response_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(50),
            accept_unsolicited: false,
        }
    }

    /// The paused clock jumps straight to the next timer, give or take the
    /// timer wheel's millisecond resolution.
    fn assert_elapsed(since: Instant, secs: u64) {
        let elapsed = since.elapsed();
        assert!(
            elapsed >= Duration::from_secs(secs) && elapsed < Duration::from_secs(secs) + Duration::from_millis(5),
            "expected ~{secs}s, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_connect_and_then_every_interval() {
        let (transport, mut writes) = QueuedTransport::channel();
        let (events, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(BmsSession::new("test", config(), transport), rx));

        events
            .send(LinkEvent::Connection(ConnectionState::Connected))
            .unwrap();
        let write = writes.recv().await.unwrap();
        assert_eq!(write.characteristic, CONTROL_CHARACTERISTIC_UUID);
        assert_eq!(write.value, codec::encode_poll().bytes());

        let started = Instant::now();
        let frame = codec::encode_status(&StatusMessage {
            voltage_mv: 13_100,
            status: 1,
            ..Default::default()
        });
        events
            .send(LinkEvent::Notification {
                characteristic: NOTIFY_CHARACTERISTIC_UUID,
                value: frame,
            })
            .unwrap();

        writes.recv().await.unwrap();
        assert_elapsed(started, 10);

        drop(events);
        let session = task.await.unwrap();
        assert!((session.current().unwrap().pack_voltage() - 13.1).abs() < 1e-4);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_backs_off() {
        let (transport, mut writes) = QueuedTransport::channel();
        let (events, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(BmsSession::new("test", config(), transport), rx));

        events
            .send(LinkEvent::Connection(ConnectionState::Connected))
            .unwrap();
        writes.recv().await.unwrap();
        let mut last = Instant::now();

        // timeout (2s) + backoff (10s, 20s, 40s)
        for expected in [12, 22, 42] {
            writes.recv().await.unwrap();
            assert_elapsed(last, expected);
            last = Instant::now();
        }

        drop(events);
        let session = task.await.unwrap();
        assert_eq!(session.scheduler_state(), SchedulerState::Idle);
        assert!(session.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_reported_later_counts() {
        let (transport, mut writes) = QueuedTransport::channel();
        let (events, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(BmsSession::new("test", config(), transport), rx));

        events
            .send(LinkEvent::Connection(ConnectionState::Connected))
            .unwrap();
        writes.recv().await.unwrap();
        let failed_at = Instant::now();
        events
            .send(LinkEvent::WriteFailed(TransportError::WriteFailed("gatt".into())))
            .unwrap();

        writes.recv().await.unwrap();
        assert_elapsed(failed_at, 10);

        drop(events);
        let session = task.await.unwrap();
        assert_eq!(session.scheduler().consecutive_failures(), 1);
    }

    #[test]
    fn queued_transport_fails_once_the_link_is_gone() {
        let (mut transport, writes) = QueuedTransport::channel();
        drop(writes);
        assert!(matches!(
            transport.write(CONTROL_CHARACTERISTIC_UUID, &[1]),
            Err(TransportError::WriteFailed(_))
        ));
    }
}

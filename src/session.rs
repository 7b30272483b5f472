use std::time::Instant;

use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::adapter::{BleTransport, ConnectionState, SessionAdapter};
use crate::error::TransportError;
use crate::scheduler::{PollScheduler, SchedulerConfig, SchedulerState};
use crate::store::{SubscriptionId, TelemetryStore};
use crate::telemetry::TelemetryRecord;

/// One battery: a scheduler, a store and an adapter wired together.
///
/// Sessions share nothing, so several batteries are simply several sessions.
/// All methods take `now` explicitly and none of them block.
pub struct BmsSession<T> {
    id: String,
    scheduler: PollScheduler,
    store: TelemetryStore,
    adapter: SessionAdapter<T>,
}

impl<T: BleTransport> BmsSession<T> {
    pub fn new(id: impl Into<String>, config: SchedulerConfig, transport: T) -> Self {
        Self {
            id: id.into(),
            scheduler: PollScheduler::new(config),
            store: TelemetryStore::new(),
            adapter: SessionAdapter::new(transport),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.adapter.connection_state()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TelemetryStore {
        &mut self.store
    }

    pub fn transport(&self) -> &T {
        self.adapter.transport()
    }

    /// Latest telemetry, `None` until the first successful poll.
    pub fn current(&self) -> Option<&TelemetryRecord> {
        self.store.current()
    }

    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&TelemetryRecord) + Send + 'static,
    {
        self.store.subscribe(observer)
    }

    /// When [`tick`](Self::tick) should next be called.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.scheduler.next_deadline(now, self.adapter.connection_state())
    }

    /// Timer expiry: time out the outstanding poll or send the next one.
    pub fn tick(&mut self, now: Instant) {
        let _span = info_span!("session", id = %self.id).entered();
        let connection = self.adapter.connection_state();
        let Some(request) = self.scheduler.tick(now, connection) else {
            return;
        };
        if let Err(err) = self.adapter.send(&request) {
            self.scheduler.on_send_failed(now, &err);
        }
    }

    pub fn on_connection_state(&mut self, state: ConnectionState) {
        let _span = info_span!("session", id = %self.id).entered();
        if self.adapter.set_connection_state(state) {
            self.scheduler.on_connection_changed(state);
        }
    }

    pub fn on_notify(&mut self, characteristic: Uuid, data: &[u8], now: Instant) {
        let _span = info_span!("session", id = %self.id).entered();
        let Some(result) = self.adapter.on_notify(characteristic, data, now) else {
            return;
        };
        let connection = self.adapter.connection_state();
        if let Some(record) = self.scheduler.on_response(now, connection, result) {
            info!(
                voltage = record.pack_voltage(),
                current = record.pack_current(),
                soc = record.state_of_charge(),
                "telemetry received"
            );
            self.store.update(record);
        }
    }

    /// A write accepted earlier failed on the link.
    pub fn on_write_failed(&mut self, err: TransportError, now: Instant) {
        let _span = info_span!("session", id = %self.id).entered();
        self.scheduler.on_send_failed(now, &err);
    }

    /// Force the session down. Nothing received afterwards reaches the store
    /// until the link reports `Connected` again.
    pub fn teardown(&mut self) {
        let _span = info_span!("session", id = %self.id).entered();
        if self.adapter.connection_state() != ConnectionState::Disconnected {
            warn!("session torn down while connected");
        }
        self.on_connection_state(ConnectionState::Disconnected);
    }
}

impl<T> std::fmt::Debug for BmsSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BmsSession")
            .field("id", &self.id)
            .field("scheduler", &self.scheduler)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

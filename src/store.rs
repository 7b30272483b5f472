use tracing::trace;

use crate::telemetry::TelemetryRecord;

/// Handle returned by [`TelemetryStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn FnMut(&TelemetryRecord) + Send>;

/// Holds the latest decoded record and fans every update out to observers.
///
/// Records are replaced whole, so readers never see a partially decoded one.
#[derive(Default)]
pub struct TelemetryStore {
    current: Option<TelemetryRecord>,
    dirty: bool,
    observers: Vec<(SubscriptionId, Observer)>,
    next_id: u64,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held record and notify every observer once, in
    /// subscription order.
    pub fn update(&mut self, record: TelemetryRecord) {
        self.dirty = true;
        let record = self.current.insert(record);
        trace!(observers = self.observers.len(), "telemetry updated");
        for (_, observer) in self.observers.iter_mut() {
            observer(record);
        }
    }

    /// The latest record, or `None` until the first successful poll.
    pub fn current(&self) -> Option<&TelemetryRecord> {
        self.current.as_ref()
    }

    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&TelemetryRecord) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(other, _)| *other != id);
        self.observers.len() != before
    }

    /// Whether an update happened since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl std::fmt::Debug for TelemetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStore")
            .field("current", &self.current)
            .field("dirty", &self.dirty)
            .field("observers", &self.observers.len())
            .finish()
    }
}

//! Poll scheduling.
//!
//! ```text
//!            tick, connected, interval elapsed
//!   ┌──────┐ ─────────────────────────────────▶ ┌──────────────────┐
//!   │ Idle │                                    │ AwaitingResponse │
//!   └──────┘ ◀───────────────────────────────── └──────────────────┘
//!      ▲          valid record (published)               │
//!      │                                                 │ timeout / decode error /
//!      │   backoff delay elapsed  ┌─────────┐            │ transport error
//!      └───────────────────────── │ Backoff │ ◀──────────┘
//!                                 └─────────┘
//! ```
//!
//! The scheduler never looks at a clock itself. Every event carries `now`, and
//! [`PollScheduler::next_deadline`] tells the caller when to tick again.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::adapter::ConnectionState;
use crate::codec;
use crate::error::{DecodeError, TransportError};
use crate::message::PollRequest;
use crate::telemetry::TelemetryRecord;

/// Longest delay the scheduler will arm. Longer configured delays are clamped.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    AwaitingResponse,
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between successful polls.
    pub update_interval: Duration,
    /// How long to wait for a response before counting the poll as failed.
    pub response_timeout: Duration,
    /// First backoff delay; doubles with each consecutive failure.
    pub backoff_base: Duration,
    /// Upper bound for the backoff delay.
    pub backoff_cap: Duration,
    /// Publish valid frames the device pushes while no poll is outstanding.
    pub accept_unsolicited: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let update_interval = Duration::from_secs(10);
        Self {
            update_interval,
            response_timeout: Duration::from_secs(5),
            backoff_base: update_interval,
            backoff_cap: update_interval * 5,
            accept_unsolicited: false,
        }
    }
}

/// Timer-driven poll state machine with at most one request in flight.
#[derive(Debug)]
pub struct PollScheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    consecutive_failures: u32,
    /// `None` means the next poll is due as soon as the link is connected.
    next_poll_at: Option<Instant>,
    response_deadline: Option<Instant>,
    backoff_until: Option<Instant>,
}

impl PollScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: SchedulerState::Idle,
            consecutive_failures: 0,
            next_poll_at: None,
            response_deadline: None,
            backoff_until: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Backoff delay after `failures` consecutive failed polls.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        self.config
            .backoff_base
            .saturating_mul(1u32 << doublings)
            .min(self.config.backoff_cap)
    }

    /// Advance timers and, if a poll is due, return the request to send.
    ///
    /// Returns `None` while a request is outstanding, whatever the interval.
    pub fn tick(&mut self, now: Instant, connection: ConnectionState) -> Option<PollRequest> {
        match self.state {
            SchedulerState::AwaitingResponse => {
                if self.response_deadline.is_some_and(|deadline| now >= deadline) {
                    warn!(failures = self.consecutive_failures + 1, "poll timed out");
                    self.fail(now);
                }
                return None;
            }
            SchedulerState::Backoff => {
                if self.backoff_until.is_some_and(|until| now < until) {
                    return None;
                }
                debug!("backoff elapsed, retrying");
                self.backoff_until = None;
                self.next_poll_at = None;
                self.state = SchedulerState::Idle;
            }
            SchedulerState::Idle => {}
        }

        if connection != ConnectionState::Connected {
            return None;
        }
        if self.next_poll_at.is_some_and(|at| now < at) {
            return None;
        }

        self.state = SchedulerState::AwaitingResponse;
        self.response_deadline = Some(after(now, self.config.response_timeout));
        Some(codec::encode_poll())
    }

    /// Feed the outcome of decoding a received frame.
    ///
    /// Returns the record to publish, if any.
    pub fn on_response(
        &mut self,
        now: Instant,
        connection: ConnectionState,
        result: Result<TelemetryRecord, DecodeError>,
    ) -> Option<TelemetryRecord> {
        match (self.state, result) {
            (SchedulerState::AwaitingResponse, Ok(record)) => {
                self.succeed(now);
                Some(record)
            }
            (SchedulerState::AwaitingResponse, Err(err)) => {
                warn!(error = %err, failures = self.consecutive_failures + 1, "bad response");
                self.fail(now);
                None
            }
            (SchedulerState::Idle, Ok(record))
                if self.config.accept_unsolicited && connection == ConnectionState::Connected =>
            {
                debug!("accepting unsolicited frame");
                self.next_poll_at = Some(after(now, self.config.update_interval));
                Some(record)
            }
            (state, Ok(_)) => {
                debug!(?state, "dropping frame with no poll outstanding");
                None
            }
            (state, Err(err)) => {
                debug!(?state, error = %err, "dropping bad frame with no poll outstanding");
                None
            }
        }
    }

    /// The request could not be written. Counts as a failed poll.
    pub fn on_send_failed(&mut self, now: Instant, err: &TransportError) {
        if self.state != SchedulerState::AwaitingResponse {
            debug!(error = %err, "ignoring write failure with no poll outstanding");
            return;
        }
        warn!(error = %err, failures = self.consecutive_failures + 1, "poll not sent");
        self.fail(now);
    }

    pub fn on_connection_changed(&mut self, connection: ConnectionState) {
        match connection {
            ConnectionState::Connected => {
                if self.consecutive_failures > 0 {
                    debug!(failures = self.consecutive_failures, "reconnected, failures cleared");
                }
                self.consecutive_failures = 0;
            }
            ConnectionState::Disconnected => {
                if self.state == SchedulerState::AwaitingResponse {
                    debug!("discarding outstanding poll");
                }
                self.state = SchedulerState::Idle;
                self.response_deadline = None;
                self.backoff_until = None;
                self.next_poll_at = None;
            }
            ConnectionState::Connecting => {}
        }
    }

    /// When the next call to [`tick`](Self::tick) can change anything.
    ///
    /// `None` means only an external event (connection, notification) can.
    pub fn next_deadline(&self, now: Instant, connection: ConnectionState) -> Option<Instant> {
        match self.state {
            SchedulerState::AwaitingResponse => self.response_deadline,
            SchedulerState::Backoff => self.backoff_until,
            SchedulerState::Idle if connection == ConnectionState::Connected => {
                Some(self.next_poll_at.map_or(now, |at| at.max(now)))
            }
            SchedulerState::Idle => None,
        }
    }

    fn succeed(&mut self, now: Instant) {
        self.state = SchedulerState::Idle;
        self.consecutive_failures = 0;
        self.response_deadline = None;
        self.next_poll_at = Some(after(now, self.config.update_interval));
    }

    fn fail(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.backoff_delay(self.consecutive_failures);
        debug!(?delay, "entering backoff");
        self.state = SchedulerState::Backoff;
        self.response_deadline = None;
        self.backoff_until = Some(after(now, delay));
    }
}

fn after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now)
}

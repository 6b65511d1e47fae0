//! Admission bookkeeping for a single API.
//!
//! Pure state: the async queue in the parent module owns the locking and the
//! timers and calls [`ApiState::drain`] whenever capacity or spacing may have
//! changed.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::config::ThrottleConfig;

/// Identifies one acquisition. Request ids come from callers and may repeat;
/// tickets never do.
pub(super) type Ticket = u64;

#[derive(Debug)]
pub(super) struct Waiter {
    ticket: Ticket,
    request_id: String,
    notify: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
pub(super) struct ApiState {
    /// When the most recent request was dispatched.
    last_request: Option<Instant>,
    /// Dispatched, not yet released.
    in_flight: HashMap<Ticket, String>,
    /// Strict FIFO of callers waiting for a slot.
    waiters: VecDeque<Waiter>,
    next_ticket: Ticket,
}

impl ApiState {
    fn issue_ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn has_capacity(&self, config: &ThrottleConfig) -> bool {
        self.in_flight.len() < config.max_parallel
    }

    fn interval_elapsed(&self, config: &ThrottleConfig, now: Instant) -> bool {
        self.last_request
            .map_or(true, |last| now.saturating_duration_since(last) >= config.min_interval)
    }

    pub(super) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub(super) fn queued(&self) -> usize {
        self.waiters.len()
    }

    /// Admit immediately if nobody is queued and both capacity and spacing
    /// allow it.
    pub(super) fn try_admit(
        &mut self,
        request_id: &str,
        config: &ThrottleConfig,
        now: Instant,
    ) -> Option<Ticket> {
        if !self.waiters.is_empty()
            || !self.has_capacity(config)
            || !self.interval_elapsed(config, now)
        {
            return None;
        }
        let ticket = self.issue_ticket();
        self.in_flight.insert(ticket, request_id.to_string());
        self.last_request = Some(now);
        Some(ticket)
    }

    /// Append a waiter. `notify` fires when it is dispatched.
    pub(super) fn enqueue(&mut self, request_id: &str, notify: oneshot::Sender<()>) -> Ticket {
        let ticket = self.issue_ticket();
        self.waiters.push_back(Waiter {
            ticket,
            request_id: request_id.to_string(),
            notify,
        });
        ticket
    }

    /// Dispatch waiters from the front of the queue while capacity and
    /// spacing allow. Returns the number dispatched.
    ///
    /// A waiter whose receiver is gone (its caller was dropped) is discarded
    /// without taking a slot.
    pub(super) fn drain(&mut self, config: &ThrottleConfig, now: Instant) -> usize {
        let mut dispatched = 0;
        while self.has_capacity(config) && self.interval_elapsed(config, now) {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.notify.send(()).is_ok() {
                self.in_flight.insert(waiter.ticket, waiter.request_id);
                self.last_request = Some(now);
                dispatched += 1;
            }
        }
        dispatched
    }

    /// When the head of the queue could next be dispatched, if only spacing
    /// is holding it back. `None` when the queue is empty or every slot is
    /// taken (a release will drain instead).
    pub(super) fn next_slot_at(&self, config: &ThrottleConfig, now: Instant) -> Option<Instant> {
        if self.waiters.is_empty() || !self.has_capacity(config) {
            return None;
        }
        Some(
            self.last_request
                .map_or(now, |last| (last + config.min_interval).max(now)),
        )
    }

    /// Remove a still-queued waiter. Returns false if it is no longer queued.
    pub(super) fn cancel(&mut self, ticket: Ticket) -> bool {
        match self.waiters.iter().position(|w| w.ticket == ticket) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Free the slot held by `ticket`. Returns false if it was already freed.
    pub(super) fn release(&mut self, ticket: Ticket) -> bool {
        self.in_flight.remove(&ticket).is_some()
    }

    /// Free one slot held under `request_id` (the oldest, if the id repeats).
    pub(super) fn release_request(&mut self, request_id: &str) -> Option<Ticket> {
        let ticket = self
            .in_flight
            .iter()
            .filter(|(_, id)| id.as_str() == request_id)
            .map(|(ticket, _)| *ticket)
            .min()?;
        self.in_flight.remove(&ticket);
        Some(ticket)
    }
}

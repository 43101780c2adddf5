//! Debounce persistence scheduler.
//!
//! Pure bookkeeping: the owning session reports edits and flush outcomes and
//! asks when the next flush is due. Two deadlines are kept:
//!
//! ```text
//! edit   edit   edit          edit ...
//!  │──────│──────│─────────────│
//!  ├─ debounce ──┤ (reset by every edit)
//!  ├──────────── max_debounce ──────────┤ (fixed at the first edit)
//! ```
//!
//! A flush is due at whichever deadline comes first. While a flush is in
//! flight no deadline fires; edits that arrive meanwhile start a new streak.
//! A failed flush is either retried one debounce window later or, when
//! retrying cannot help, left stalled until the next edit.
//! Time comes from `tokio::time`, so paused-clock tests drive it exactly.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct DebounceScheduler {
    debounce: Duration,
    max_debounce: Duration,
    debounce_deadline: Option<Instant>,
    max_deadline: Option<Instant>,
    in_flight: bool,
    stalled: bool,
}

impl DebounceScheduler {
    pub fn new(debounce: Duration, max_debounce: Duration) -> Self {
        Self {
            debounce,
            max_debounce: max_debounce.max(debounce),
            debounce_deadline: None,
            max_deadline: None,
            in_flight: false,
            stalled: false,
        }
    }

    /// Record an edit at `now`.
    pub fn on_edit(&mut self, now: Instant) {
        self.debounce_deadline = Some(now + self.debounce);
        if self.max_deadline.is_none() {
            self.max_deadline = Some(now + self.max_debounce);
        }
    }

    /// When the next flush should fire, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.in_flight {
            return None;
        }
        match (self.debounce_deadline, self.max_deadline) {
            (Some(d), Some(m)) => Some(d.min(m)),
            (d, m) => d.or(m),
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Unsaved edits exist (pending, being saved, or stalled).
    pub fn is_dirty(&self) -> bool {
        self.has_pending() || self.in_flight || self.stalled
    }

    /// No deadline is armed and no flush is in flight. Stalled edits do not
    /// count: nothing will save them before another edit arrives.
    pub fn is_settled(&self) -> bool {
        !self.has_pending() && !self.in_flight
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Edits not yet handed to a flush.
    pub fn has_pending(&self) -> bool {
        self.debounce_deadline.is_some() || self.max_deadline.is_some()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// A flush starts; edits merged from here on belong to the next streak.
    pub fn begin_flush(&mut self) {
        self.debounce_deadline = None;
        self.max_deadline = None;
        self.in_flight = true;
        self.stalled = false;
    }

    pub fn flush_succeeded(&mut self) {
        self.in_flight = false;
    }

    /// The flush failed: the change is still unsaved, retry one debounce
    /// window from `now`.
    pub fn flush_failed(&mut self, now: Instant) {
        self.in_flight = false;
        self.on_edit(now);
    }

    /// The flush failed and retrying would fail the same way: keep the
    /// change marked unsaved but arm nothing. The next edit starts a new
    /// streak whose flush covers it.
    pub fn flush_abandoned(&mut self) {
        self.in_flight = false;
        self.stalled = true;
    }
}

//! Deterministic event queue for simulation.
//!
//! Events are processed in order of:
//! 1. Event timestamp (earlier first)
//! 2. Event ID, i.e. insertion order (for same timestamp)
//!
//! Nothing else takes part in ordering, so two runs that schedule the same
//! events in the same order replay identically.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    fmt,
    rc::Weak,
    time::Duration,
};

use super::{
    future::Resolvable,
    time::{duration_to_nanos, VirtualTime},
};
use crate::transport::{ConnKey, Packet};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

/// What happens when an event fires.
pub(crate) enum EventKind {
    /// Deadline of a suspended future (also drives sleeps).
    Deadline(Weak<dyn Resolvable>),
    /// A packet reaching its destination machine.
    Deliver(Packet),
    /// Handshake wait of a connection elapsed.
    Handshake(ConnKey),
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Deadline(_) => f.write_str("Deadline"),
            EventKind::Deliver(packet) => write!(f, "Deliver({})", packet.summary()),
            EventKind::Handshake(key) => write!(f, "Handshake({key})"),
        }
    }
}

/// A scheduled event in the simulation.
#[derive(Debug)]
pub(crate) struct Event {
    /// When this event should be processed (virtual nanos)
    pub timestamp: u64,
    /// Unique identifier for ordering ties
    pub id: EventId,
    pub kind: EventKind,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse ordering so smallest timestamp comes first,
        // ties broken by registration order
        match other.timestamp.cmp(&self.timestamp) {
            Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

/// One line of the run's observable history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Virtual time the entry was recorded at.
    pub at: Duration,
    /// Who produced it: a script name, or `net` for the router.
    pub source: String,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>10.3}ms] {:<20} {}",
            self.at.as_secs_f64() * 1000.0,
            self.source,
            self.message
        )
    }
}

/// Deterministic event scheduler for simulation.
///
/// Owns the virtual clock: time only moves when an event is popped.
pub(crate) struct Scheduler {
    time: VirtualTime,
    pending_events: BinaryHeap<Event>,
    next_event_id: u64,
    /// History of the run (for replay verification and reports)
    event_log: Vec<LogEntry>,
    events_processed: u64,
}

impl Scheduler {
    pub fn new(time: VirtualTime) -> Self {
        Self {
            time,
            pending_events: BinaryHeap::new(),
            next_event_id: 0,
            event_log: Vec::new(),
            events_processed: 0,
        }
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.time.now_nanos()
    }

    /// Returns the number of pending events, stale ones included.
    pub fn pending_count(&self) -> usize {
        self.pending_events.len()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Schedules an event at the given absolute timestamp.
    ///
    /// Timestamps in the past are clamped to now.
    pub fn schedule_at(&mut self, timestamp: u64, kind: EventKind) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;

        self.pending_events.push(Event {
            timestamp: timestamp.max(self.now()),
            id,
            kind,
        });
        id
    }

    /// Schedules an event after the given delay from now.
    pub fn schedule_after(&mut self, delay: Duration, kind: EventKind) -> EventId {
        let timestamp = self.now().saturating_add(duration_to_nanos(delay));
        self.schedule_at(timestamp, kind)
    }

    /// Returns the timestamp of the next pending event, if any.
    pub fn next_event_time(&self) -> Option<u64> {
        self.pending_events.peek().map(|e| e.timestamp)
    }

    pub fn peek(&self) -> Option<&Event> {
        self.pending_events.peek()
    }

    /// Removes the next event without running it or moving the clock.
    pub fn discard_next(&mut self) -> Option<Event> {
        self.pending_events.pop()
    }

    /// Pops the next pending event, advancing time to its timestamp.
    pub fn step(&mut self) -> Option<Event> {
        let event = self.pending_events.pop()?;
        if event.timestamp > self.now() {
            self.time.advance_to(event.timestamp);
        }
        self.events_processed += 1;
        tracing::trace!(
            timestamp = event.timestamp,
            id = event.id.0,
            kind = ?event.kind,
            "Processing event"
        );
        Some(event)
    }

    /// Appends an entry to the run history at the current time.
    pub fn record(&mut self, source: &str, message: impl Into<String>) {
        self.event_log.push(LogEntry {
            at: self.time.now(),
            source: source.to_owned(),
            message: message.into(),
        });
    }

    #[cfg(test)]
    pub fn event_log(&self) -> &[LogEntry] {
        &self.event_log
    }

    pub fn take_event_log(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.event_log)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now())
            .field("pending_count", &self.pending_count())
            .field("event_log_len", &self.event_log.len())
            .finish()
    }
}

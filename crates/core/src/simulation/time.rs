//! Virtual clock for deterministic simulation.
//!
//! Time is a plain nanosecond counter that only the scheduler moves forward.
//! Nothing in this crate reads the wall clock.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};

/// Converts a duration to virtual nanoseconds, saturating at `u64::MAX`.
pub fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Virtual time shared between the scheduler and every simulated process.
///
/// Clones observe the same clock. Only [`VirtualTime::advance_to`] moves it,
/// and it never moves backwards.
#[derive(Clone, Default)]
pub struct VirtualTime {
    current_nanos: Arc<AtomicU64>,
}

impl VirtualTime {
    /// Creates a new virtual time starting at 0.
    pub fn new() -> Self {
        Self::with_initial_time(0)
    }

    /// Creates a new virtual time starting at the given nanoseconds.
    pub fn with_initial_time(initial_nanos: u64) -> Self {
        Self {
            current_nanos: Arc::new(AtomicU64::new(initial_nanos)),
        }
    }

    /// Current virtual time in nanoseconds since the start of the run.
    pub fn now_nanos(&self) -> u64 {
        self.current_nanos.load(AtomicOrdering::SeqCst)
    }

    /// Current virtual time as a duration since the start of the run.
    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.now_nanos())
    }

    /// Absolute deadline `after` from now.
    pub fn deadline_after(&self, after: Duration) -> u64 {
        self.now_nanos().saturating_add(duration_to_nanos(after))
    }

    /// Moves the clock to `target_nanos`.
    ///
    /// Returns `false` and leaves the clock untouched if the target lies in
    /// the past.
    pub fn advance_to(&self, target_nanos: u64) -> bool {
        let current = self.now_nanos();
        if target_nanos < current {
            return false;
        }
        self.current_nanos
            .store(target_nanos, AtomicOrdering::SeqCst);
        true
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let target = self.deadline_after(duration);
        self.advance_to(target);
    }
}

impl fmt::Debug for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTime")
            .field("now", &self.now())
            .finish()
    }
}

//! Seeded random number generator for deterministic simulation.
//!
//! Every random decision the engine makes (latency draws, loss, duplication)
//! goes through one [`SimulationRng`] owned by the run, so the same seed
//! replays the same faults.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::time::duration_to_nanos;

/// A seeded random number generator for simulation.
///
/// Clones share the same underlying generator, so the order of calls across
/// all clones defines the sequence. The scheduler is single-threaded, which
/// makes that order deterministic.
#[derive(Clone)]
pub struct SimulationRng {
    inner: Arc<Mutex<SmallRng>>,
    seed: u64,
}

impl SimulationRng {
    /// Creates a new simulation RNG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SmallRng::seed_from_u64(seed))),
            seed,
        }
    }

    /// Returns the seed used to create this RNG.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generates a random boolean with the given probability of being true.
    pub fn gen_bool(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.lock().random_bool(probability)
    }

    /// Generates a random u64.
    pub fn gen_u64(&self) -> u64 {
        self.lock().random()
    }

    /// Generates a random usize in the given range.
    pub fn gen_range(&self, range: Range<usize>) -> usize {
        self.lock().random_range(range)
    }

    /// Generates a random Duration within the given range.
    ///
    /// An empty range yields its start.
    pub fn gen_duration(&self, range: Range<Duration>) -> Duration {
        let start_nanos = duration_to_nanos(range.start);
        let end_nanos = duration_to_nanos(range.end);
        if end_nanos <= start_nanos {
            return range.start;
        }
        let nanos = self.lock().random_range(start_nanos..end_nanos);
        Duration::from_nanos(nanos)
    }

    /// Creates a child RNG with a specific derived seed based on an index.
    ///
    /// Children are independent of how many values the parent has produced,
    /// so a process gets the same stream no matter when it starts.
    pub fn child_with_index(&self, index: u64) -> Self {
        let derived_seed = self
            .seed
            .wrapping_mul(0x517cc1b727220a95)
            .wrapping_add(index);
        Self::new(derived_seed)
    }

    /// Access the inner RNG for operations that need direct `Rng` trait access.
    ///
    /// Do not hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, SmallRng> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SimulationRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRng")
            .field("seed", &self.seed)
            .finish()
    }
}

//! Fault injection configuration for simulation testing.
//!
//! This module provides configuration for injecting various faults:
//! - Packet loss and duplication
//! - Latency shapes, including deliberate reordering
//! - Per-flag drop filters (lost handshake segments)
//! - Machine outages

use std::{collections::BTreeSet, ops::Range, sync::Arc, time::Duration};

use super::{rng::SimulationRng, time::duration_to_nanos};
use crate::transport::Flag;

/// Latency shape applied to each packet on a link.
#[derive(Debug, Clone, PartialEq)]
pub enum Latency {
    /// The run's configured default latency.
    Default,
    Fixed(Duration),
    /// Drawn uniformly from the range with the seeded RNG.
    Uniform(Range<Duration>),
    /// Each successive packet in a direction gets `step` less latency than
    /// the previous one, restarting from `max` every `window` packets.
    Reverse {
        max: Duration,
        step: Duration,
        window: u64,
    },
}

impl Latency {
    /// Latency of the `index`-th packet sent in one direction of a link.
    pub fn sample(&self, index: u64, default: Duration, rng: &SimulationRng) -> Duration {
        match self {
            Latency::Default => default,
            Latency::Fixed(latency) => *latency,
            Latency::Uniform(range) => rng.gen_duration(range.clone()),
            Latency::Reverse { max, step, window } => {
                let position = index % (*window).max(1);
                let reduction = duration_to_nanos(*step).saturating_mul(position);
                Duration::from_nanos(duration_to_nanos(*max).saturating_sub(reduction))
            }
        }
    }
}

/// Fault behavior of one link.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkProfile {
    pub latency: Latency,
    /// Probability of dropping a packet (0.0 to 1.0)
    pub loss_rate: f64,
    /// Probability of delivering a packet twice (0.0 to 1.0)
    pub duplicate_rate: f64,
    /// Packets carrying one of these flags are always dropped
    pub drop_flags: BTreeSet<Flag>,
    /// Record every packet on this link in the event log
    pub log_packets: bool,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self {
            latency: Latency::Default,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            drop_flags: BTreeSet::new(),
            log_packets: false,
        }
    }
}

impl NetworkProfile {
    /// Creates a profile with no faults and the default latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for fluent configuration.
    pub fn builder() -> NetworkProfileBuilder {
        NetworkProfileBuilder::new()
    }

    /// Profile that delivers every packet of a burst in reverse order:
    /// latency starts at 100ms and shrinks by 10ms per packet.
    pub fn reversing() -> Self {
        Self::builder()
            .reverse_latency(Duration::from_millis(100), Duration::from_millis(10), 10)
            .build()
    }

    /// Returns true if the packet must be dropped by the flag filter.
    pub fn filters(&self, flag: Flag) -> bool {
        self.drop_flags.contains(&flag)
    }

    /// Returns true if a packet should be lost.
    pub fn should_drop(&self, rng: &SimulationRng) -> bool {
        self.loss_rate > 0.0 && rng.gen_bool(self.loss_rate)
    }

    /// Returns true if a packet should be delivered a second time.
    pub fn should_duplicate(&self, rng: &SimulationRng) -> bool {
        self.duplicate_rate > 0.0 && rng.gen_bool(self.duplicate_rate)
    }
}

/// Builder for creating a NetworkProfile with fluent API.
#[derive(Debug, Default)]
pub struct NetworkProfileBuilder {
    profile: NetworkProfile,
}

impl NetworkProfileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets fixed latency for packet delivery.
    pub fn fixed_latency(mut self, latency: Duration) -> Self {
        self.profile.latency = Latency::Fixed(latency);
        self
    }

    /// Sets the latency range for packet delivery.
    pub fn latency_range(mut self, range: Range<Duration>) -> Self {
        self.profile.latency = Latency::Uniform(range);
        self
    }

    /// Makes every packet in a window overtake the ones sent before it.
    pub fn reverse_latency(mut self, max: Duration, step: Duration, window: u64) -> Self {
        self.profile.latency = Latency::Reverse {
            max,
            step,
            window: window.max(1),
        };
        self
    }

    /// Sets the packet loss rate (0.0 to 1.0).
    pub fn loss_rate(mut self, rate: f64) -> Self {
        self.profile.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the packet duplication rate (0.0 to 1.0).
    pub fn duplicate_rate(mut self, rate: f64) -> Self {
        self.profile.duplicate_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Drops every packet carrying `flag`.
    pub fn drop_flag(mut self, flag: Flag) -> Self {
        self.profile.drop_flags.insert(flag);
        self
    }

    pub fn log_packets(mut self, enabled: bool) -> Self {
        self.profile.log_packets = enabled;
        self
    }

    pub fn build(self) -> NetworkProfile {
        self.profile
    }
}

/// A window during which a machine receives nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outage {
    pub machine: Arc<str>,
    /// When the outage started (virtual nanos)
    pub start_time: u64,
    /// When the machine is reachable again (virtual nanos), None for permanent
    pub end_time: Option<u64>,
}

impl Outage {
    /// Creates a permanent outage starting at time zero.
    pub fn new(machine: impl Into<Arc<str>>) -> Self {
        Self {
            machine: machine.into(),
            start_time: 0,
            end_time: None,
        }
    }

    /// Creates an outage that ends after the given duration.
    pub fn with_duration(mut self, start_time: u64, duration: Duration) -> Self {
        self.start_time = start_time;
        self.end_time = Some(start_time.saturating_add(duration_to_nanos(duration)));
        self
    }

    /// Creates a permanent outage.
    pub fn permanent(mut self, start_time: u64) -> Self {
        self.start_time = start_time;
        self.end_time = None;
        self
    }

    /// Checks if this outage blocks traffic to `machine` at the given time.
    pub fn blocks(&self, machine: &str, current_time: u64) -> bool {
        if &*self.machine != machine || current_time < self.start_time {
            return false;
        }
        self.end_time.map_or(true, |end| current_time < end)
    }

    /// Returns true if this outage is over by the given time.
    pub fn has_ended(&self, current_time: u64) -> bool {
        self.end_time.is_some_and(|end| current_time >= end)
    }
}

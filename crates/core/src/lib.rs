//! Deterministic discrete-event simulation of networked machines.
//!
//! Scripts are plain `async` blocks running on named machines. They talk
//! over a simulated stream transport whose packets are delayed, reordered,
//! duplicated or dropped by per-link profiles, all on a virtual clock. The
//! same seed and scenario always replay the same way.

/// Run configuration and logger setup.
pub mod config;

/// Operations available to scripts.
pub mod env;

/// Scenario builder and run reports.
pub mod harness;

/// Built-in demo scenarios.
pub mod scenarios;

/// Scheduler, executor, virtual time and the simulated network.
pub mod simulation;

/// Tracing subscriber setup.
#[cfg_attr(test, allow(dead_code))]
pub mod tracing;

/// Simulated sockets, connections and packets.
pub mod transport;

pub use config::SimConfig;
pub use env::{CancelToken, Env};
pub use harness::{ExitReason, Plan, SimReport, Simulation};
pub use simulation::{Latency, LogEntry, NetworkProfile, NetworkStats, Outage, ProcessId};
pub use transport::{Connection, Endpoint, Flag, SimError, Socket};

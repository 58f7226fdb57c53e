//! Deterministic discrete-event simulation engine.
//!
//! # Architecture
//!
//! - **VirtualTime**: nanosecond clock that only advances when an event fires
//! - **Scheduler**: queue of timed events ordered by (time, insertion order)
//! - **Executor**: single-threaded task runner, FIFO over woken tasks
//! - **Cluster**: machines, links, outages and the packet router
//! - **SimulationRng**: the one seeded source of randomness for a run
//!
//! A run alternates between two phases: poll every ready task until none is
//! left, then pop the next event (and every other event due at the same
//! instant). Nothing runs in parallel and nothing reads the wall clock, so a
//! given seed and scenario always produce the same event log.

pub(crate) mod executor;
pub(crate) mod fault;
pub(crate) mod future;
pub(crate) mod network;
pub(crate) mod process;
pub(crate) mod rng;
pub(crate) mod scheduler;
pub(crate) mod time;
pub(crate) mod world;

pub use fault::{Latency, NetworkProfile, NetworkProfileBuilder, Outage};
pub use future::SimFuture;
pub use network::NetworkStats;
pub use process::ProcessId;
pub use rng::SimulationRng;
pub use scheduler::LogEntry;
pub use time::VirtualTime;

pub(crate) use world::World;

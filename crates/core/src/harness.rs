//! Building and running scenarios.

use std::{fmt, future::Future, rc::Rc, time::Duration};

use futures::FutureExt;

use crate::{
    config::SimConfig,
    env::Env,
    simulation::{LogEntry, NetworkProfile, NetworkStats, ProcessId, World},
};

/// Service name used when a script is registered with a bare machine name.
pub const DEFAULT_SERVICE: &str = "main";

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Nothing was runnable and no event was pending.
    Idle,
    /// Every process finished or halted.
    AllHalted,
    /// The next event lay beyond the configured maximum virtual time.
    MaxTimeExceeded,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::Idle => "idle",
            ExitReason::AllHalted => "all halted",
            ExitReason::MaxTimeExceeded => "max time exceeded",
        };
        f.write_str(s)
    }
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct SimReport {
    pub seed: u64,
    /// Virtual time when the run stopped.
    pub finished_at: Duration,
    pub exit: ExitReason,
    pub events_processed: u64,
    /// Everything scripts and the router recorded, in order.
    pub events: Vec<LogEntry>,
    pub network: NetworkStats,
}

impl SimReport {
    /// Messages recorded by `source` (a `machine:service` name or `net`).
    pub fn messages_from(&self, source: &str) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| e.source == source)
            .map(|e| e.message.as_str())
            .collect()
    }

    /// True if any entry's message contains `needle`.
    pub fn logged(&self, needle: &str) -> bool {
        self.events.iter().any(|e| e.message.contains(needle))
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "seed:       {}", self.seed)?;
        writeln!(f, "exit:       {}", self.exit)?;
        writeln!(f, "virtual:    {:?}", self.finished_at)?;
        writeln!(f, "events:     {}", self.events_processed)?;
        writeln!(f, "network:    {}", self.network)?;
        writeln!(f)?;
        for entry in &self.events {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

/// A scenario: machines, links and the scripts that run on them.
///
/// ```ignore
/// let mut sim = Simulation::new(SimConfig::default());
/// sim.link("local", "server", NetworkProfile::default());
/// sim.add_script("server:api", |env| async move { /* ... */ });
/// let report = sim.run();
/// ```
pub struct Simulation {
    world: Rc<World>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Self {
        tracing::debug!(seed = config.seed, "creating simulation");
        Self {
            world: World::new(config),
        }
    }

    pub fn config(&self) -> &SimConfig {
        self.world.config()
    }

    /// Declares a machine without scripts.
    pub fn add_machine(&mut self, name: &str) -> &mut Self {
        self.world.add_machine(name);
        self
    }

    /// Connects `a` and `b` in both directions.
    pub fn link(&mut self, a: &str, b: &str, profile: NetworkProfile) -> &mut Self {
        self.world.link(a, b, profile);
        self
    }

    /// Registers a script under `machine` or `machine:service`.
    ///
    /// The factory is called again every time the service is (re)started.
    pub fn add_script<F, Fut>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(Env) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let (machine, service) = name.split_once(':').unwrap_or((name, DEFAULT_SERVICE));
        self.world.add_script(
            machine,
            service,
            Rc::new(move |env: Env| factory(env).boxed_local()),
        );
        self
    }

    /// Starts every script and runs until the run ends.
    pub fn run(self) -> SimReport {
        self.world.start_matching("*");
        self.world.run()
    }

    /// Runs `plan`, which decides when services start and stop. Scripts
    /// only run once the plan starts them.
    pub fn run_with_plan<F, Fut>(self, plan: F) -> SimReport
    where
        F: FnOnce(Plan) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let process = self.world.plan_process();
        let plan = plan(Plan {
            world: self.world.clone(),
            process,
        });
        self.world.spawn(process, plan.boxed_local());
        self.world.run()
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("world", &self.world)
            .finish()
    }
}

/// Handle used by a plan to drive a scenario over time.
#[derive(Clone)]
pub struct Plan {
    world: Rc<World>,
    process: ProcessId,
}

impl Plan {
    pub fn now(&self) -> Duration {
        self.world.now()
    }

    /// Starts every registered script matching `selector` (`*`, `machine`
    /// or `machine:service`) that is not already running.
    pub fn start_services(&self, selector: &str) -> Vec<ProcessId> {
        let started = self.world.start_matching(selector);
        tracing::debug!(selector, count = started.len(), "services started");
        started
    }

    /// Cancels matching services, waits the shutdown grace period, then
    /// force-stops whatever is still running. Machines left without a
    /// running service go down.
    pub async fn stop_services(&self, selector: &str) {
        let cancelled = self.world.cancel_matching(selector);
        if cancelled.is_empty() {
            return;
        }
        let grace = self.world.config().shutdown_grace;
        // a cancelled plan still force-stops
        let _ = self.world.sleep(self.process, grace).await;
        self.world.kill(&cancelled);
    }

    pub async fn delay(&self, duration: Duration) {
        let _ = self.world.sleep(self.process, duration).await;
    }

    /// Makes `machine` unreachable for `duration`, starting now.
    pub fn outage(&self, machine: &str, duration: Duration) {
        self.world.declare_outage(machine, duration);
    }

    /// Replaces the profile of a link mid-run.
    pub fn link(&self, a: &str, b: &str, profile: NetworkProfile) {
        self.world.link(a, b, profile);
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(machine = "sim", service = "plan", "{message}");
        self.world.record("sim:plan", message);
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan").field("process", &self.process).finish()
    }
}

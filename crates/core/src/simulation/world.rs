//! The simulation world: one scheduler, one executor, one cluster.
//!
//! All mutable state sits behind `RefCell`s owned by [`World`]. Protocol
//! handlers run while the cluster is borrowed and only collect
//! [`Effects`]; those are routed and scheduled after the borrow ends, so no
//! borrow is ever held while a script runs.

use std::{
    cell::RefCell,
    collections::BTreeSet,
    fmt,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::LocalBoxFuture;

use super::{
    executor::Executor,
    fault::{NetworkProfile, Outage},
    future::{self, Promise, SimFuture},
    network::Cluster,
    process::{ProcessId, ProcessTable},
    rng::SimulationRng,
    scheduler::{Event, EventKind, Scheduler},
    time::{duration_to_nanos, VirtualTime},
};
use crate::{
    config::SimConfig,
    env::Env,
    harness::{ExitReason, SimReport},
    transport::{Effects, Endpoint, PortTable, SimError},
};

pub(crate) type ScriptFactory = Rc<dyn Fn(Env) -> LocalBoxFuture<'static, ()>>;

/// A registered script that can be (re)started.
pub(crate) struct Script {
    pub machine: Arc<str>,
    pub service: Arc<str>,
    pub factory: ScriptFactory,
}

pub(crate) struct World {
    config: SimConfig,
    time: VirtualTime,
    rng: SimulationRng,
    scheduler: RefCell<Scheduler>,
    executor: RefCell<Executor>,
    processes: RefCell<ProcessTable>,
    cluster: RefCell<Cluster>,
    scripts: RefCell<Vec<Script>>,
}

impl World {
    pub fn new(config: SimConfig) -> Rc<Self> {
        let time = VirtualTime::new();
        Rc::new(Self {
            rng: SimulationRng::new(config.seed),
            scheduler: RefCell::new(Scheduler::new(time.clone())),
            executor: RefCell::new(Executor::new()),
            processes: RefCell::new(ProcessTable::new()),
            cluster: RefCell::new(Cluster::new(config.default_latency, config.trace_network)),
            scripts: RefCell::new(Vec::new()),
            time,
            config,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn now(&self) -> Duration {
        self.time.now()
    }

    /// Appends an entry to the run's event log.
    pub fn record(&self, source: &str, message: impl Into<String>) {
        self.scheduler.borrow_mut().record(source, message);
    }

    // Topology

    pub fn add_machine(&self, name: &str) {
        self.cluster.borrow_mut().add_machine(name);
    }

    pub fn link(&self, a: &str, b: &str, profile: NetworkProfile) {
        self.cluster.borrow_mut().link(a, b, profile);
    }

    /// Declares `machine` unreachable for `duration` starting now.
    pub fn declare_outage(&self, machine: &str, duration: Duration) {
        let outage = Outage::new(machine).with_duration(self.time.now_nanos(), duration);
        self.record(machine, format!("outage for {duration:?}"));
        self.cluster.borrow_mut().add_outage(outage);
    }

    /// Runs `f` against the port table of `machine`, then routes whatever
    /// it sent. Returns None if the machine does not exist.
    pub fn with_ports<R>(
        &self,
        machine: &str,
        f: impl FnOnce(&mut PortTable, &mut Effects) -> R,
    ) -> Option<R> {
        let mut fx = Effects::default();
        let result = {
            let mut cluster = self.cluster.borrow_mut();
            let machine = cluster.machine_mut(machine)?;
            f(&mut machine.ports, &mut fx)
        };
        self.apply(fx);
        Some(result)
    }

    /// True if a connection attempt from `from` to `remote` would reach a
    /// listening socket right now.
    pub fn is_listening(&self, from: &str, remote: &Endpoint) -> bool {
        self.cluster
            .borrow()
            .is_listening(from, remote, self.time.now_nanos())
    }

    fn apply(&self, fx: Effects) {
        if fx.is_empty() {
            return;
        }
        let now = self.time.now_nanos();
        for packet in fx.packets {
            let route = self.cluster.borrow_mut().route(&packet, now, &self.rng);
            if let Some(note) = route.note {
                self.record("net", note);
            }
            let mut scheduler = self.scheduler.borrow_mut();
            for delay in route.deliveries {
                scheduler.schedule_after(delay, EventKind::Deliver(packet.clone()));
            }
        }
        let mut scheduler = self.scheduler.borrow_mut();
        for key in fx.handshake_timers {
            scheduler.schedule_after(self.config.handshake_timeout, EventKind::Handshake(key));
        }
    }

    // Suspension

    fn register<T: 'static>(
        &self,
        process: ProcessId,
        promise: &Promise<T>,
        deadline: Option<Duration>,
    ) -> Result<(), SimError> {
        let resolvable = promise.resolvable();
        {
            let mut processes = self.processes.borrow_mut();
            if processes.is_cancelled(process) {
                return Err(SimError::Cancelled);
            }
            processes.register(process, Rc::downgrade(&resolvable));
        }
        if let Some(deadline) = deadline {
            self.scheduler
                .borrow_mut()
                .schedule_after(deadline, EventKind::Deadline(Rc::downgrade(&resolvable)));
        }
        Ok(())
    }

    /// Creates a promise owned by `process`, failing with Timeout once
    /// `deadline` elapses. Fails right away if the process is cancelled.
    pub fn suspend<T: 'static>(
        &self,
        process: ProcessId,
        deadline: Option<Duration>,
    ) -> Result<(Promise<T>, SimFuture<T>), SimError> {
        let (promise, future) = future::pair::<T>();
        self.register(process, &promise, deadline)?;
        Ok((promise, future))
    }

    /// A future completing successfully after `duration` of virtual time.
    pub fn sleep(&self, process: ProcessId, duration: Duration) -> SimFuture<()> {
        let (promise, future) = future::pair_with_deadline_outcome::<()>(|| Ok(()));
        match self.register(process, &promise, Some(duration)) {
            Ok(()) => future,
            Err(err) => SimFuture::failed(err),
        }
    }

    // Processes

    pub fn add_script(&self, machine: &str, service: &str, factory: ScriptFactory) {
        self.add_machine(machine);
        self.scripts.borrow_mut().push(Script {
            machine: machine.into(),
            service: service.into(),
            factory,
        });
    }

    pub fn label(&self, process: ProcessId) -> String {
        self.processes
            .borrow()
            .get(process)
            .map(|p| p.label())
            .unwrap_or_else(|| process.to_string())
    }

    /// Starts a fresh process for script `index` unless one is running.
    pub fn start_script(self: &Rc<Self>, index: usize) -> Option<ProcessId> {
        let (machine, service, factory) = {
            let scripts = self.scripts.borrow();
            let script = scripts.get(index)?;
            (
                script.machine.clone(),
                script.service.clone(),
                script.factory.clone(),
            )
        };
        if self.processes.borrow().script_running(index) {
            return None;
        }
        self.cluster.borrow_mut().start_up(&machine);
        let process =
            self.processes
                .borrow_mut()
                .create(machine.clone(), service.clone(), Some(index));
        let rng = self.rng.child_with_index(u64::from(process.index()));
        let env = Env::new(self.clone(), process, machine, service, rng);

        self.record(&env.name(), "started");
        tracing::debug!(process = %env.name(), t_ms = self.time.now_nanos() / 1_000_000, "process started");
        self.spawn(process, factory(env));
        Some(process)
    }

    /// Starts every script whose name matches `selector`.
    pub fn start_matching(self: &Rc<Self>, selector: &str) -> Vec<ProcessId> {
        let indices: Vec<_> = self
            .scripts
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, s)| super::process::matches_selector(selector, &s.machine, &s.service))
            .map(|(i, _)| i)
            .collect();
        indices
            .into_iter()
            .filter_map(|i| self.start_script(i))
            .collect()
    }

    /// Creates the harness-side process that runs a plan. It is never
    /// matched by service selectors.
    pub fn plan_process(&self) -> ProcessId {
        self.processes
            .borrow_mut()
            .create("sim".into(), "plan".into(), None)
    }

    pub fn spawn(&self, process: ProcessId, future: LocalBoxFuture<'static, ()>) {
        if !self.processes.borrow().is_running(process) {
            return;
        }
        self.processes.borrow_mut().task_started(process);
        self.executor.borrow_mut().spawn(process, future);
    }

    pub fn is_cancelled(&self, process: ProcessId) -> bool {
        self.processes.borrow().is_cancelled(process)
    }

    /// Sets the cancellation flag and resolves every future the process is
    /// suspended on with Cancelled.
    pub fn cancel(&self, process: ProcessId) {
        let pending = self.processes.borrow_mut().cancel(process);
        for resolvable in pending {
            resolvable.cancel();
        }
    }

    pub fn cancel_matching(&self, selector: &str) -> Vec<ProcessId> {
        let processes = self.processes.borrow().running_matching(selector);
        for process in &processes {
            tracing::debug!(process = %self.label(*process), "cancelling");
            self.cancel(*process);
        }
        processes
    }

    /// Ends the calling process. Its tasks are dropped once the current
    /// poll returns.
    pub fn halt(&self, process: ProcessId, reason: &str) {
        self.processes.borrow_mut().halt(process, reason.to_owned());
        let label = self.label(process);
        tracing::debug!(process = %label, reason, "process halted");
        self.record(&label, format!("halted: {reason}"));
    }

    /// Force-stops processes. Machines left without a running process go
    /// down and lose their sockets before the tasks are dropped, so a dead
    /// host never sends a RESET.
    pub fn kill(&self, processes: &[ProcessId]) {
        let mut machines = BTreeSet::new();
        let mut killed = Vec::new();
        for &process in processes {
            let (was_running, machine) = match self.processes.borrow().get(process) {
                Some(p) => (p.is_running(), p.machine.clone()),
                None => continue,
            };
            self.processes.borrow_mut().kill(process);
            if was_running {
                self.record(&self.label(process), "stopped");
            }
            machines.insert(machine);
            killed.push(process);
        }
        for machine in machines {
            if self.processes.borrow().machine_busy(&machine) {
                continue;
            }
            self.cluster.borrow_mut().shut_down(&machine);
            tracing::debug!(%machine, "machine down");
            self.record(&machine, "machine down");
        }
        for process in killed {
            let tasks = self.executor.borrow_mut().remove_process(process);
            drop(tasks);
        }
    }

    // Main loop

    fn process_span(&self, process: ProcessId) -> tracing::Span {
        let t_ms = self.time.now_nanos() / 1_000_000;
        match self.processes.borrow().get(process) {
            Some(p) => tracing::info_span!(
                "process",
                machine = %p.machine,
                service = %p.service,
                t_ms
            ),
            None => tracing::info_span!("process", t_ms),
        }
    }

    /// Polls ready tasks until the queue is empty.
    fn run_ready(&self) {
        loop {
            let next = self.executor.borrow_mut().next_runnable();
            let Some(mut runnable) = next else {
                break;
            };
            let process = runnable.process;
            let poll = {
                let span = self.process_span(process);
                let _enter = span.enter();
                let mut cx = Context::from_waker(&runnable.waker);
                runnable.future.as_mut().poll(&mut cx)
            };

            let running = self.processes.borrow().is_running(process);
            match poll {
                Poll::Ready(()) => {
                    drop(runnable);
                    let finished = self.processes.borrow_mut().task_finished(process);
                    if finished {
                        let label = self.label(process);
                        tracing::debug!(process = %label, "process finished");
                        self.record(&label, "finished");
                    }
                }
                Poll::Pending if running => self.executor.borrow_mut().put_back(runnable),
                Poll::Pending => drop(runnable),
            }

            if !running {
                let tasks = self.executor.borrow_mut().remove_process(process);
                drop(tasks);
                self.processes.borrow_mut().clear_tasks(process);
            }
        }
    }

    fn is_stale(&self, event: &Event) -> bool {
        match &event.kind {
            EventKind::Deadline(pending) => pending.upgrade().map_or(true, |r| !r.is_pending()),
            EventKind::Handshake(key) => !self.cluster.borrow().is_half_open(key),
            EventKind::Deliver(_) => false,
        }
    }

    /// Drops stale events at the head of the queue so they never move the
    /// clock.
    fn discard_stale_events(&self) {
        loop {
            let stale = self
                .scheduler
                .borrow()
                .peek()
                .is_some_and(|event| self.is_stale(event));
            if !stale {
                break;
            }
            self.scheduler.borrow_mut().discard_next();
        }
    }

    fn fire(&self, event: Event) {
        match event.kind {
            EventKind::Deadline(pending) => {
                if let Some(resolvable) = pending.upgrade() {
                    resolvable.expire();
                }
            }
            EventKind::Deliver(packet) => {
                let span = tracing::info_span!(
                    "deliver",
                    machine = %packet.destination.machine(),
                    service = "net",
                    t_ms = event.timestamp / 1_000_000
                );
                let _enter = span.enter();
                let mut fx = Effects::default();
                self.cluster
                    .borrow_mut()
                    .deliver(packet, event.timestamp, &mut fx);
                self.apply(fx);
            }
            EventKind::Handshake(key) => {
                let mut fx = Effects::default();
                self.cluster.borrow_mut().expire_handshake(&key, &mut fx);
                self.apply(fx);
            }
        }
    }

    /// Runs until idle, until every process is done, or until the clock
    /// would pass the configured maximum.
    pub fn run(&self) -> SimReport {
        let max_time = duration_to_nanos(self.config.max_time);
        let exit = loop {
            self.run_ready();
            if self.processes.borrow().all_done() {
                break ExitReason::AllHalted;
            }
            self.discard_stale_events();
            let Some(next) = self.scheduler.borrow().next_event_time() else {
                break ExitReason::Idle;
            };
            if next > max_time {
                self.time.advance_to(max_time);
                break ExitReason::MaxTimeExceeded;
            }
            // every event due at this instant fires before scripts resume
            while self.scheduler.borrow().next_event_time() == Some(next) {
                let event = self.scheduler.borrow_mut().step();
                if let Some(event) = event {
                    if !self.is_stale(&event) {
                        self.fire(event);
                    }
                }
            }
        };

        self.shutdown();

        let finished_at = self.now();
        tracing::info!(?exit, ?finished_at, seed = self.config.seed, "simulation finished");
        let mut scheduler = self.scheduler.borrow_mut();
        SimReport {
            seed: self.config.seed,
            finished_at,
            exit,
            events_processed: scheduler.events_processed(),
            events: scheduler.take_event_log(),
            network: self.cluster.borrow().stats().clone(),
        }
    }

    /// Cancels every process still running and drops all remaining tasks
    /// at the current instant. Machines go down first, so nothing dropped
    /// here reaches the router.
    fn shutdown(&self) {
        let running = self.processes.borrow().running();
        for process in &running {
            self.cancel(*process);
        }
        self.cluster.borrow_mut().shut_down_all();
        let tasks = self.executor.borrow_mut().drain();
        drop(tasks);
        for process in running {
            self.processes.borrow_mut().kill(process);
        }
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("now", &self.time)
            .field("scheduler", &self.scheduler)
            .field("executor", &self.executor)
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

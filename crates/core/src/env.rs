//! The operations a script can perform on its machine.

use std::{fmt, future::Future, rc::Rc, sync::Arc, time::Duration};

use crate::{
    simulation::{ProcessId, SimulationRng, World},
    transport::{Connection, Endpoint, SimError, Socket},
};

/// Execution context handed to a script when its process starts.
///
/// Cheap to clone; clones share the process, so tasks started with
/// [`Env::spawn`] are cancelled and halted together with the script.
#[derive(Clone)]
pub struct Env {
    world: Rc<World>,
    process: ProcessId,
    machine: Arc<str>,
    service: Arc<str>,
    rng: SimulationRng,
}

impl Env {
    pub(crate) fn new(
        world: Rc<World>,
        process: ProcessId,
        machine: Arc<str>,
        service: Arc<str>,
        rng: SimulationRng,
    ) -> Self {
        Self {
            world,
            process,
            machine,
            service,
            rng,
        }
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// `machine:service`, the name the script shows up as in logs.
    pub fn name(&self) -> String {
        format!("{}:{}", self.machine, self.service)
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Current virtual time since the start of the run.
    pub fn now(&self) -> Duration {
        self.world.now()
    }

    /// Random source private to this process, derived from the run seed.
    pub fn rng(&self) -> &SimulationRng {
        &self.rng
    }

    /// Listens on `port` of this machine with the configured backlog.
    pub fn bind(&self, port: u16) -> Result<Socket, SimError> {
        self.bind_with_backlog(port, self.world.config().accept_backlog)
    }

    pub fn bind_with_backlog(&self, port: u16, backlog: usize) -> Result<Socket, SimError> {
        let local = Endpoint::new(self.machine.clone(), port);
        Socket::bind(self.world.clone(), self.process, local, backlog.max(1))
    }

    /// Opens a connection to `remote` using the configured connect timeout.
    pub async fn connect(&self, remote: impl Into<Endpoint>) -> Result<Connection, SimError> {
        let timeout = self.world.config().connect_timeout;
        self.connect_timeout(remote, timeout).await
    }

    /// Opens a connection, giving up after `timeout`.
    ///
    /// Fails with [`SimError::Unreachable`] if nothing answered,
    /// [`SimError::Reset`] if the peer refused and [`SimError::Timeout`] if
    /// the handshake started but never completed.
    pub async fn connect_timeout(
        &self,
        remote: impl Into<Endpoint>,
        timeout: Duration,
    ) -> Result<Connection, SimError> {
        let remote = remote.into();
        tracing::debug!(%remote, ?timeout, "connecting");
        Connection::open(
            self.world.clone(),
            self.process,
            &self.machine,
            remote,
            timeout,
        )
        .await
    }

    /// Suspends for `duration` of virtual time.
    pub async fn delay(&self, duration: Duration) -> Result<(), SimError> {
        self.world.sleep(self.process, duration).await
    }

    /// Models CPU-bound work taking `duration` of virtual time.
    pub async fn simulate_work(&self, duration: Duration) -> Result<(), SimError> {
        tracing::trace!(?duration, "simulating work");
        self.world.sleep(self.process, duration).await
    }

    /// Runs `task` in this process alongside the script.
    pub fn spawn(&self, task: impl Future<Output = ()> + 'static) {
        self.world.spawn(self.process, Box::pin(task));
    }

    /// Ends this script. Other processes, including other scripts on the
    /// same machine, keep running.
    pub fn halt(&self, reason: &str) {
        self.world.halt(self.process, reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.world.is_cancelled(self.process)
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            world: self.world.clone(),
            process: self.process,
        }
    }

    /// Logs `message` and appends it to the event log of the run.
    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(machine = %self.machine, service = %self.service, "{message}");
        self.world.record(&self.name(), message);
    }

    /// Makes `machine` unreachable for `duration`, starting now.
    pub fn declare_outage(&self, machine: &str, duration: Duration) {
        self.world.declare_outage(machine, duration);
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("process", &self.process)
            .field("machine", &self.machine)
            .field("service", &self.service)
            .finish()
    }
}

/// Cancellation signal of one process.
#[derive(Clone)]
pub struct CancelToken {
    world: Rc<World>,
    process: ProcessId,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.world.is_cancelled(self.process)
    }

    /// Completes once the process is cancelled.
    pub async fn cancelled(&self) {
        let Ok((_promise, signal)) = self.world.suspend::<()>(self.process, None) else {
            return;
        };
        // only cancellation resolves this future
        let _ = signal.await;
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("process", &self.process)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

use std::{
    cell::Cell,
    collections::{BTreeMap, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;

use super::{
    connection::{ConnState, Transition},
    ConnKey, Connection, Effects, Endpoint, Flag, Packet, SimError, EPHEMERAL_PORT_START,
};
use crate::simulation::{
    future::{Promise, SimFuture},
    ProcessId, World,
};

/// Run-wide id source shared by every port table.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnIds(Rc<Cell<u64>>);

impl ConnIds {
    pub fn next(&self) -> u64 {
        let id = self.0.get();
        self.0.set(id + 1);
        id
    }
}

struct Listener {
    id: u64,
    backlog: usize,
    /// Established connections nobody accepted yet
    queue: VecDeque<ConnKey>,
    pending_accept: Option<Promise<ConnKey>>,
}

enum Binding {
    Listener(Listener),
    /// Ephemeral port owned by one outbound connection.
    Outbound(u64),
}

/// Sockets and connections of one machine.
///
/// Connections are keyed by (local port, remote endpoint), so a listening
/// socket keeps at most one connection per remote. Closed connections that
/// were replaced by a newer one from the same remote move to the graveyard,
/// where their handle can still drain them.
pub(crate) struct PortTable {
    machine: Arc<str>,
    ids: ConnIds,
    bound: BTreeMap<u16, Binding>,
    conns: BTreeMap<(u16, Endpoint), ConnState>,
    graveyard: BTreeMap<u64, ConnState>,
    next_ephemeral: u16,
}

impl PortTable {
    pub fn new(machine: Arc<str>, ids: ConnIds) -> Self {
        Self {
            machine,
            ids,
            bound: BTreeMap::new(),
            conns: BTreeMap::new(),
            graveyard: BTreeMap::new(),
            next_ephemeral: EPHEMERAL_PORT_START,
        }
    }

    fn endpoint(&self, port: u16) -> Endpoint {
        Endpoint::new(self.machine.clone(), port)
    }

    /// Forgets every socket and connection, as after a reboot.
    pub fn reset(&mut self) {
        self.bound.clear();
        self.conns.clear();
        self.graveyard.clear();
        self.next_ephemeral = EPHEMERAL_PORT_START;
    }

    #[cfg(test)]
    pub fn is_bound(&self, port: u16) -> bool {
        self.bound.contains_key(&port)
    }

    /// True if a listening socket owns `port`.
    pub fn is_listening(&self, port: u16) -> bool {
        matches!(self.bound.get(&port), Some(Binding::Listener(_)))
    }

    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.conns.len() + self.graveyard.len()
    }

    /// Starts listening on `port`. Returns the listener id.
    pub fn bind(&mut self, port: u16, backlog: usize) -> Result<u64, SimError> {
        if self.bound.contains_key(&port) {
            return Err(SimError::AddressInUse(self.endpoint(port)));
        }
        let id = self.ids.next();
        self.bound.insert(
            port,
            Binding::Listener(Listener {
                id,
                backlog: backlog.max(1),
                queue: VecDeque::new(),
                pending_accept: None,
            }),
        );
        Ok(id)
    }

    fn allocate_ephemeral(&mut self) -> Option<u16> {
        let range = u32::from(u16::MAX - EPHEMERAL_PORT_START) + 1;
        for _ in 0..range {
            let port = self.next_ephemeral;
            self.next_ephemeral = port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
            if !self.bound.contains_key(&port) {
                return Some(port);
            }
        }
        None
    }

    /// Opens a connection to `remote` from a fresh ephemeral port.
    pub fn open(
        &mut self,
        remote: Endpoint,
        connect: Promise<()>,
        fx: &mut Effects,
    ) -> Result<ConnKey, SimError> {
        let port = self
            .allocate_ephemeral()
            .ok_or_else(|| SimError::AddressInUse(self.endpoint(0)))?;
        let key = ConnKey {
            local: self.endpoint(port),
            remote,
            id: self.ids.next(),
        };
        self.bound.insert(port, Binding::Outbound(key.id));
        let conn = ConnState::outbound(key.clone(), connect, fx);
        self.conns.insert((port, key.remote.clone()), conn);
        Ok(key)
    }

    /// Delivery entry point for packets addressed to this machine.
    pub fn receive(&mut self, packet: Packet, fx: &mut Effects) {
        let slot = (packet.destination.port(), packet.source.clone());

        // a peer reconnecting from an endpoint whose previous connection is over
        let reconnect = packet.flag == Flag::Syn
            && self.conns.get(&slot).is_some_and(|conn| conn.is_closed());
        if reconnect {
            if let Some(old) = self.conns.remove(&slot) {
                self.graveyard.insert(old.key().id, old);
            }
        }

        if let Some(conn) = self.conns.get_mut(&slot) {
            let key = conn.key().clone();
            match conn.receive(packet, fx) {
                Transition::Stay => {}
                Transition::Accepted => self.hand_to_listener(key, fx),
                Transition::Aborted => {
                    self.conns.remove(&slot);
                }
            }
            return;
        }

        let port = slot.0;
        let listener = match self.bound.get(&port) {
            Some(Binding::Listener(listener)) => listener,
            Some(Binding::Outbound(_)) => {
                tracing::warn!(packet = %packet.summary(), "no connection for packet, dropped");
                return;
            }
            None => {
                tracing::warn!(packet = %packet.summary(), "no socket bound, packet dropped");
                return;
            }
        };

        if packet.flag != Flag::Syn {
            if packet.flag != Flag::Reset {
                tracing::warn!(packet = %packet.summary(), "no connection for packet, dropped");
            }
            return;
        }

        let half_open = self
            .conns
            .iter()
            .filter(|((p, _), conn)| *p == port && conn.is_half_open())
            .count();
        if half_open + listener.queue.len() >= listener.backlog {
            tracing::debug!(
                local = %packet.destination,
                remote = %packet.source,
                backlog = listener.backlog,
                "accept backlog full, refusing connection"
            );
            fx.send(Packet::control(
                packet.destination.clone(),
                packet.source.clone(),
                Flag::Reset,
                0,
            ));
            return;
        }

        let key = ConnKey {
            local: packet.destination.clone(),
            remote: packet.source.clone(),
            id: self.ids.next(),
        };
        let conn = ConnState::inbound(key, &packet, fx);
        self.conns.insert(slot, conn);
    }

    fn hand_to_listener(&mut self, key: ConnKey, fx: &mut Effects) {
        if let Some(Binding::Listener(listener)) = self.bound.get_mut(&key.local.port()) {
            let key = match listener.pending_accept.take() {
                Some(acceptor) => match acceptor.resolve(key) {
                    Ok(()) => return,
                    Err(key) => key,
                },
                None => key,
            };
            listener.queue.push_back(key);
            return;
        }
        // listener went away during the handshake
        if let Some(mut conn) = self.remove_conn(&key) {
            if let Some(reset) = conn.close_locally() {
                fx.send(reset);
            }
        }
    }

    /// An accepted connection whose acceptor went away before taking it.
    pub fn return_accepted(&mut self, key: ConnKey, fx: &mut Effects) {
        tracing::debug!(conn = %key, "accepted connection not taken, requeued");
        self.hand_to_listener(key, fx);
    }

    /// Takes the next accepted connection, or None if the caller has to wait.
    pub fn poll_accept(&mut self, port: u16, listener_id: u64) -> Result<Option<ConnKey>, SimError> {
        let listener = match self.bound.get_mut(&port) {
            Some(Binding::Listener(listener)) if listener.id == listener_id => listener,
            _ => return Err(SimError::Closed),
        };
        if let Some(key) = listener.queue.pop_front() {
            return Ok(Some(key));
        }
        if listener
            .pending_accept
            .as_ref()
            .is_some_and(|acceptor| acceptor.is_awaited())
        {
            return Err(SimError::AlreadyWaiting);
        }
        Ok(None)
    }

    pub fn park_acceptor(
        &mut self,
        port: u16,
        listener_id: u64,
        acceptor: Promise<ConnKey>,
    ) -> Result<(), SimError> {
        match self.bound.get_mut(&port) {
            Some(Binding::Listener(listener)) if listener.id == listener_id => {
                listener.pending_accept = Some(acceptor);
                Ok(())
            }
            _ => Err(SimError::Closed),
        }
    }

    /// Closes a listening socket. Connections it already handed out stay
    /// open; half-open and unaccepted ones are reset.
    pub fn release_listener(&mut self, port: u16, listener_id: u64, fx: &mut Effects) {
        match self.bound.get(&port) {
            Some(Binding::Listener(listener)) if listener.id == listener_id => {}
            _ => return,
        }
        let Some(Binding::Listener(listener)) = self.bound.remove(&port) else {
            return;
        };

        let half_open: Vec<_> = self
            .conns
            .iter()
            .filter(|((p, _), conn)| *p == port && conn.is_half_open())
            .map(|(_, conn)| conn.key().clone())
            .collect();
        for key in listener.queue.iter().chain(half_open.iter()) {
            if let Some(mut conn) = self.remove_conn(key) {
                if let Some(reset) = conn.close_locally() {
                    fx.send(reset);
                }
            }
        }
        tracing::debug!(local = %self.endpoint(port), "socket released");
    }

    pub fn conn_mut(&mut self, key: &ConnKey) -> Option<&mut ConnState> {
        let slot = (key.local.port(), key.remote.clone());
        if self.conns.get(&slot).is_some_and(|conn| conn.key().id == key.id) {
            return self.conns.get_mut(&slot);
        }
        self.graveyard.get_mut(&key.id)
    }

    fn remove_conn(&mut self, key: &ConnKey) -> Option<ConnState> {
        let slot = (key.local.port(), key.remote.clone());
        if self.conns.get(&slot).is_some_and(|conn| conn.key().id == key.id) {
            return self.conns.remove(&slot);
        }
        self.graveyard.remove(&key.id)
    }

    /// The handle of a connection went away.
    pub fn release_conn(&mut self, key: &ConnKey, fx: &mut Effects) {
        if let Some(mut conn) = self.remove_conn(key) {
            if let Some(reset) = conn.close_locally() {
                fx.send(reset);
            }
        }
        let port = key.local.port();
        if matches!(self.bound.get(&port), Some(Binding::Outbound(id)) if *id == key.id) {
            self.bound.remove(&port);
        }
    }

    /// True while `key` is still waiting for the final ACK.
    pub fn is_half_open(&self, key: &ConnKey) -> bool {
        let slot = (key.local.port(), key.remote.clone());
        self.conns
            .get(&slot)
            .is_some_and(|conn| conn.key().id == key.id && conn.is_half_open())
    }

    /// Gives up on a half-open connection whose ACK never came.
    pub fn expire_handshake(&mut self, key: &ConnKey, fx: &mut Effects) {
        if !self.is_half_open(key) {
            return;
        }
        if let Some(mut conn) = self.remove_conn(key) {
            if let Some(reset) = conn.expire_handshake() {
                fx.send(reset);
            }
        }
    }
}

impl fmt::Debug for PortTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortTable")
            .field("machine", &self.machine)
            .field("bound", &self.bound.keys().collect::<Vec<_>>())
            .field("conns", &self.conns.values().collect::<Vec<_>>())
            .field("graveyard", &self.graveyard.len())
            .finish()
    }
}

/// A listening socket bound to a local endpoint.
///
/// Dropping the handle releases the port. Connections already accepted
/// from it stay open.
pub struct Socket {
    world: Rc<World>,
    local: Endpoint,
    listener_id: u64,
    owner: ProcessId,
}

impl Socket {
    pub(crate) fn bind(
        world: Rc<World>,
        owner: ProcessId,
        local: Endpoint,
        backlog: usize,
    ) -> Result<Self, SimError> {
        let port = local.port();
        let listener_id = world
            .with_ports(local.machine(), |ports, _| ports.bind(port, backlog))
            .unwrap_or(Err(SimError::Closed))?;
        tracing::debug!(%local, backlog, "socket bound");
        Ok(Self {
            world,
            local,
            listener_id,
            owner,
        })
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Waits for the next established connection.
    ///
    /// Only one accept may be outstanding per socket.
    pub async fn accept(&self) -> Result<Connection, SimError> {
        self.accept_inner(None).await
    }

    /// Like [`Socket::accept`], failing with [`SimError::Timeout`] after
    /// `timeout`.
    pub async fn accept_timeout(&self, timeout: Duration) -> Result<Connection, SimError> {
        self.accept_inner(Some(timeout)).await
    }

    async fn accept_inner(&self, deadline: Option<Duration>) -> Result<Connection, SimError> {
        let (port, id) = (self.local.port(), self.listener_id);
        let ready = self
            .world
            .with_ports(self.local.machine(), |ports, _| ports.poll_accept(port, id))
            .unwrap_or(Err(SimError::Closed))?;

        let key = match ready {
            Some(key) => key,
            None => {
                let (promise, accepted) = self.world.suspend::<ConnKey>(self.owner, deadline)?;
                self.world
                    .with_ports(self.local.machine(), |ports, _| {
                        ports.park_acceptor(port, id, promise)
                    })
                    .unwrap_or(Err(SimError::Closed))?;
                AcceptWait {
                    socket: self,
                    accepted,
                }
                .await?
            }
        };
        Ok(Connection::new(self.world.clone(), key, self.owner))
    }
}

/// A parked accept. Dropped after its connection arrived but before it was
/// polled, it gives the connection back to the listener.
struct AcceptWait<'a> {
    socket: &'a Socket,
    accepted: SimFuture<ConnKey>,
}

impl Future for AcceptWait<'_> {
    type Output = Result<ConnKey, SimError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.accepted.poll_unpin(cx)
    }
}

impl Drop for AcceptWait<'_> {
    fn drop(&mut self) {
        if let Some(Ok(key)) = self.accepted.take_ready() {
            self.socket
                .world
                .with_ports(self.socket.local.machine(), |ports, fx| {
                    ports.return_accepted(key, fx)
                });
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let (port, id) = (self.local.port(), self.listener_id);
        self.world
            .with_ports(self.local.machine(), |ports, fx| {
                ports.release_listener(port, id, fx)
            });
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").field("local", &self.local).finish()
    }
}

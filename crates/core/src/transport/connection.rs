use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;

use super::{ConnKey, Effects, Endpoint, Flag, Packet, SimError};
use crate::simulation::{future::Promise, ProcessId, World};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnPhase {
    SynSent,
    SynReceived,
    Established,
    /// Carries the error later operations fail with.
    Closed(SimError),
}

/// What the owning port table has to do after a packet was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Stay,
    /// Handshake completed on the accepting side.
    Accepted,
    /// Half-open connection failed and must be forgotten.
    Aborted,
}

/// Protocol state of one connection.
pub(crate) struct ConnState {
    key: ConnKey,
    phase: ConnPhase,
    /// Sequence number of the next packet we emit
    next_send: u64,
    /// Sequence number the peer must send next
    next_recv: u64,
    /// Packets that arrived ahead of `next_recv`
    reorder: BTreeMap<u64, Packet>,
    inbox: VecDeque<Bytes>,
    pending_read: Option<Promise<Bytes>>,
    pending_connect: Option<Promise<()>>,
}

impl ConnState {
    fn with_phase(key: ConnKey, phase: ConnPhase, next_recv: u64) -> Self {
        Self {
            key,
            phase,
            next_send: 0,
            next_recv,
            reorder: BTreeMap::new(),
            inbox: VecDeque::new(),
            pending_read: None,
            pending_connect: None,
        }
    }

    /// Starts an active open: emits the SYN.
    pub fn outbound(key: ConnKey, connect: Promise<()>, fx: &mut Effects) -> Self {
        let mut conn = Self::with_phase(key, ConnPhase::SynSent, 0);
        conn.pending_connect = Some(connect);
        fx.send(conn.emit(Flag::Syn));
        conn
    }

    /// Answers a SYN: emits SYN|ACK and starts the ACK wait.
    pub fn inbound(key: ConnKey, syn: &Packet, fx: &mut Effects) -> Self {
        let mut conn = Self::with_phase(key, ConnPhase::SynReceived, syn.seq + 1);
        fx.send(conn.emit(Flag::SynAck));
        fx.handshake_timers.push(conn.key.clone());
        conn
    }

    pub fn key(&self) -> &ConnKey {
        &self.key
    }

    #[cfg(test)]
    pub fn phase(&self) -> &ConnPhase {
        &self.phase
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, ConnPhase::Closed(_))
    }

    pub fn is_half_open(&self) -> bool {
        self.phase == ConnPhase::SynReceived
    }

    fn emit(&mut self, flag: Flag) -> Packet {
        let seq = self.next_send;
        self.next_send += 1;
        Packet::control(self.key.local.clone(), self.key.remote.clone(), flag, seq)
    }

    fn emit_data(&mut self, payload: Bytes) -> Packet {
        let seq = self.next_send;
        self.next_send += 1;
        Packet::data(self.key.local.clone(), self.key.remote.clone(), seq, payload)
    }

    /// Feeds one packet from the peer through the reorder buffer.
    pub fn receive(&mut self, packet: Packet, fx: &mut Effects) -> Transition {
        if self.is_closed() {
            tracing::trace!(packet = %packet.summary(), "packet for closed connection dropped");
            return Transition::Stay;
        }

        // handshake RESETs act on arrival, there is nothing to keep in order yet
        if packet.flag == Flag::Reset
            && matches!(self.phase, ConnPhase::SynSent | ConnPhase::SynReceived)
        {
            return self.reset_during_handshake();
        }

        if packet.seq < self.next_recv || self.reorder.contains_key(&packet.seq) {
            tracing::trace!(packet = %packet.summary(), "duplicate dropped");
            return Transition::Stay;
        }
        if packet.seq > self.next_recv {
            tracing::trace!(
                packet = %packet.summary(),
                expected = self.next_recv,
                "buffered out of order packet"
            );
        }
        self.reorder.insert(packet.seq, packet);

        let mut transition = Transition::Stay;
        while let Some(packet) = self.reorder.remove(&self.next_recv) {
            self.next_recv += 1;
            match self.process(packet, fx) {
                Transition::Stay => {}
                other => transition = other,
            }
            if self.is_closed() {
                self.reorder.clear();
                break;
            }
        }
        transition
    }

    fn reset_during_handshake(&mut self) -> Transition {
        let remote = self.key.remote.clone();
        tracing::debug!(conn = %self.key, "reset during handshake");
        let half_open = self.is_half_open();
        self.close(SimError::Reset(remote));
        if half_open {
            Transition::Aborted
        } else {
            Transition::Stay
        }
    }

    /// Handles the next in-order packet.
    fn process(&mut self, packet: Packet, fx: &mut Effects) -> Transition {
        let remote = self.key.remote.clone();
        match (&self.phase, packet.flag) {
            (ConnPhase::SynSent, Flag::SynAck) => {
                self.phase = ConnPhase::Established;
                fx.send(self.emit(Flag::Ack));
                tracing::debug!(conn = %self.key, "connection established");
                if let Some(connect) = self.pending_connect.take() {
                    // a timed out connect is torn down by its handle
                    let _ = connect.resolve(());
                }
                Transition::Stay
            }
            (ConnPhase::SynSent, flag) => {
                tracing::warn!(conn = %self.key, %flag, "unexpected packet while connecting");
                fx.send(self.emit(Flag::Reset));
                self.close(SimError::Reset(remote));
                Transition::Stay
            }
            (ConnPhase::SynReceived, Flag::Ack) => {
                self.phase = ConnPhase::Established;
                tracing::debug!(conn = %self.key, "connection accepted");
                Transition::Accepted
            }
            (ConnPhase::SynReceived, flag) => {
                tracing::warn!(conn = %self.key, %flag, "unexpected packet during handshake");
                fx.send(self.emit(Flag::Reset));
                self.close(SimError::Reset(remote));
                Transition::Aborted
            }
            (ConnPhase::Established, Flag::Data) => {
                if let Some(body) = packet.payload {
                    self.push_inbox(body);
                }
                Transition::Stay
            }
            (ConnPhase::Established, Flag::Reset) => {
                tracing::debug!(conn = %self.key, "connection reset by peer");
                self.close(SimError::Reset(remote));
                Transition::Stay
            }
            (ConnPhase::Established, flag) => {
                tracing::warn!(conn = %self.key, %flag, "unexpected packet on established connection");
                Transition::Stay
            }
            (ConnPhase::Closed(_), _) => Transition::Stay,
        }
    }

    fn push_inbox(&mut self, body: Bytes) {
        let body = match self.pending_read.take() {
            Some(reader) => match reader.resolve(body) {
                Ok(()) => return,
                Err(body) => body,
            },
            None => body,
        };
        self.inbox.push_back(body);
    }

    fn close(&mut self, reason: SimError) {
        self.phase = ConnPhase::Closed(reason.clone());
        self.reorder.clear();
        if let Some(connect) = self.pending_connect.take() {
            connect.fail(reason.clone());
        }
        if self.inbox.is_empty() {
            if let Some(reader) = self.pending_read.take() {
                reader.fail(reason);
            }
        }
    }

    /// Returns the next payload or terminal error, or None when the caller
    /// has to suspend.
    pub fn poll_read(&mut self) -> Option<Result<Bytes, SimError>> {
        if let Some(body) = self.inbox.pop_front() {
            return Some(Ok(body));
        }
        if let ConnPhase::Closed(reason) = &self.phase {
            return Some(Err(reason.clone()));
        }
        if self.pending_read.as_ref().is_some_and(|p| p.is_awaited()) {
            return Some(Err(SimError::AlreadyWaiting));
        }
        None
    }

    pub fn park_reader(&mut self, reader: Promise<Bytes>) {
        self.pending_read = Some(reader);
    }

    pub fn write(&mut self, payload: Bytes) -> Result<Packet, SimError> {
        match &self.phase {
            ConnPhase::Established => Ok(self.emit_data(payload)),
            ConnPhase::Closed(reason) => Err(reason.clone()),
            ConnPhase::SynSent | ConnPhase::SynReceived => Err(SimError::Closed),
        }
    }

    /// Local teardown. Returns the RESET to send if the connection was
    /// still open.
    pub fn close_locally(&mut self) -> Option<Packet> {
        if self.is_closed() {
            return None;
        }
        let reset = self.emit(Flag::Reset);
        self.close(SimError::Closed);
        Some(reset)
    }

    /// The ACK wait of a half-open connection elapsed.
    pub fn expire_handshake(&mut self) -> Option<Packet> {
        if !self.is_half_open() {
            return None;
        }
        tracing::debug!(conn = %self.key, "handshake timed out");
        let reset = self.emit(Flag::Reset);
        self.close(SimError::Timeout);
        Some(reset)
    }
}

impl fmt::Debug for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnState")
            .field("key", &self.key)
            .field("phase", &self.phase)
            .field("next_send", &self.next_send)
            .field("next_recv", &self.next_recv)
            .field("buffered", &self.reorder.len())
            .field("inbox", &self.inbox.len())
            .finish()
    }
}

/// An open stream between two endpoints, as seen by one script.
///
/// Dropping the handle tears the connection down, sending a RESET to the
/// peer if it was still open.
pub struct Connection {
    world: Rc<World>,
    key: ConnKey,
    owner: ProcessId,
}

impl Connection {
    pub(crate) fn new(world: Rc<World>, key: ConnKey, owner: ProcessId) -> Self {
        Self { world, key, owner }
    }

    /// Active open from `machine` to `remote`.
    ///
    /// The connection gets its own ephemeral port. When the deadline passes
    /// the outcome is a timeout if `remote` is reachable and listening, and
    /// unreachable otherwise.
    pub(crate) async fn open(
        world: Rc<World>,
        owner: ProcessId,
        machine: &str,
        remote: Endpoint,
        timeout: Duration,
    ) -> Result<Self, SimError> {
        let (promise, established) = world.suspend::<()>(owner, Some(timeout))?;
        let key = world
            .with_ports(machine, |ports, fx| ports.open(remote.clone(), promise, fx))
            .unwrap_or(Err(SimError::Closed))?;
        let conn = Self::new(world, key, owner);

        match established.await {
            Ok(()) => Ok(conn),
            Err(SimError::Timeout) if !conn.world.is_listening(machine, &remote) => {
                Err(SimError::Unreachable(remote))
            }
            Err(err) => Err(err),
        }
    }

    pub fn local(&self) -> &Endpoint {
        &self.key.local
    }

    pub fn remote(&self) -> &Endpoint {
        &self.key.remote
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ConnState, &mut Effects) -> R) -> Result<R, SimError> {
        self.world
            .with_ports(self.key.local.machine(), |ports, fx| {
                ports.conn_mut(&self.key).map(|conn| f(conn, fx))
            })
            .flatten()
            .ok_or(SimError::Closed)
    }

    /// Reads the next in-order payload, waiting at most `timeout`.
    ///
    /// Payloads that arrived before a reset are still returned; the reset
    /// error surfaces once they are drained.
    pub async fn read(&self, timeout: Duration) -> Result<Bytes, SimError> {
        self.read_inner(Some(timeout)).await
    }

    /// Reads the next in-order payload without a deadline.
    pub async fn recv(&self) -> Result<Bytes, SimError> {
        self.read_inner(None).await
    }

    async fn read_inner(&self, deadline: Option<Duration>) -> Result<Bytes, SimError> {
        if let Some(ready) = self.with_state(|conn, _| conn.poll_read())? {
            return ready;
        }
        let (promise, payload) = self.world.suspend::<Bytes>(self.owner, deadline)?;
        self.with_state(|conn, _| conn.park_reader(promise))?;
        payload.await
    }

    /// Hands `payload` to the network and returns immediately.
    ///
    /// Success means the packet left this endpoint, not that the peer got
    /// it. Writing on a closed connection fails with the close reason.
    pub fn write(&self, payload: impl Into<Bytes>) -> Result<(), SimError> {
        let payload = payload.into();
        self.with_state(|conn, fx| conn.write(payload).map(|packet| fx.send(packet)))?
    }

    /// Closes the connection, sending a RESET if it was still open.
    ///
    /// Later reads and writes fail with [`SimError::Closed`].
    pub fn close(&self) {
        let _ = self.with_state(|conn, fx| {
            if let Some(reset) = conn.close_locally() {
                fx.send(reset);
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|conn, _| conn.is_closed()).unwrap_or(true)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let key = &self.key;
        self.world
            .with_ports(key.local.machine(), |ports, fx| ports.release_conn(key, fx));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.key.local)
            .field("remote", &self.key.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::future;

    fn key(id: u64) -> ConnKey {
        ConnKey {
            local: Endpoint::new("server", 80),
            remote: Endpoint::new("client", 49152),
            id,
        }
    }

    fn from_client(flag: Flag, seq: u64) -> Packet {
        Packet::control(Endpoint::new("client", 49152), Endpoint::new("server", 80), flag, seq)
    }

    fn data_from_client(seq: u64, body: &'static str) -> Packet {
        Packet::data(
            Endpoint::new("client", 49152),
            Endpoint::new("server", 80),
            seq,
            Bytes::from_static(body.as_bytes()),
        )
    }

    fn established() -> ConnState {
        let mut fx = Effects::default();
        let mut conn = ConnState::inbound(key(1), &from_client(Flag::Syn, 0), &mut fx);
        assert_eq!(conn.receive(from_client(Flag::Ack, 1), &mut fx), Transition::Accepted);
        conn
    }

    #[test]
    fn test_inbound_handshake() {
        let mut fx = Effects::default();
        let conn = ConnState::inbound(key(1), &from_client(Flag::Syn, 0), &mut fx);
        assert!(conn.is_half_open());
        assert_eq!(fx.packets.len(), 1);
        assert_eq!(fx.packets[0].flag, Flag::SynAck);
        assert_eq!(fx.packets[0].seq, 0);
        assert_eq!(fx.handshake_timers, vec![key(1)]);
    }

    #[test]
    fn test_outbound_handshake() {
        let mut fx = Effects::default();
        let (promise, _established) = future::pair::<()>();
        let client_key = ConnKey {
            local: Endpoint::new("client", 49152),
            remote: Endpoint::new("server", 80),
            id: 2,
        };
        let mut conn = ConnState::outbound(client_key, promise, &mut fx);
        assert_eq!(fx.packets[0].flag, Flag::Syn);

        let synack = Packet::control(
            Endpoint::new("server", 80),
            Endpoint::new("client", 49152),
            Flag::SynAck,
            0,
        );
        let mut fx = Effects::default();
        conn.receive(synack, &mut fx);
        assert_eq!(conn.phase(), &ConnPhase::Established);
        assert_eq!(fx.packets[0].flag, Flag::Ack);
        assert_eq!(fx.packets[0].seq, 1);
    }

    #[test]
    fn test_out_of_order_data_is_released_in_sequence() {
        let mut conn = established();
        let mut fx = Effects::default();

        conn.receive(data_from_client(3, "B"), &mut fx);
        assert!(conn.poll_read().is_none());
        conn.receive(data_from_client(2, "A"), &mut fx);

        assert_eq!(conn.poll_read(), Some(Ok(Bytes::from_static(b"A"))));
        assert_eq!(conn.poll_read(), Some(Ok(Bytes::from_static(b"B"))));
        assert!(conn.poll_read().is_none());
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut conn = established();
        let mut fx = Effects::default();

        conn.receive(data_from_client(2, "A"), &mut fx);
        conn.receive(data_from_client(2, "A"), &mut fx);
        conn.receive(data_from_client(4, "C"), &mut fx);
        conn.receive(data_from_client(4, "C"), &mut fx);
        conn.receive(data_from_client(3, "B"), &mut fx);

        let read: Vec<_> = std::iter::from_fn(|| conn.poll_read())
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            read,
            vec![
                Bytes::from_static(b"A"),
                Bytes::from_static(b"B"),
                Bytes::from_static(b"C")
            ]
        );
    }

    #[test]
    fn test_reset_waits_for_earlier_data() {
        let mut conn = established();
        let mut fx = Effects::default();

        // RESET overtakes the last payload on the wire
        conn.receive(from_client(Flag::Reset, 3), &mut fx);
        assert!(!conn.is_closed());
        conn.receive(data_from_client(2, "last"), &mut fx);
        assert!(conn.is_closed());

        assert_eq!(conn.poll_read(), Some(Ok(Bytes::from_static(b"last"))));
        let remote = Endpoint::new("client", 49152);
        assert_eq!(conn.poll_read(), Some(Err(SimError::Reset(remote))));
    }

    #[test]
    fn test_unexpected_flag_aborts_half_open() {
        let mut fx = Effects::default();
        let mut conn = ConnState::inbound(key(1), &from_client(Flag::Syn, 0), &mut fx);
        let mut fx = Effects::default();
        let transition = conn.receive(data_from_client(1, "early"), &mut fx);
        assert_eq!(transition, Transition::Aborted);
        assert_eq!(fx.packets[0].flag, Flag::Reset);
    }

    #[test]
    fn test_reset_in_handshake_is_immediate() {
        let mut fx = Effects::default();
        let mut conn = ConnState::inbound(key(1), &from_client(Flag::Syn, 0), &mut fx);
        // sequence number far ahead, still acts at once
        let transition = conn.receive(from_client(Flag::Reset, 7), &mut fx);
        assert_eq!(transition, Transition::Aborted);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_write_and_local_close() {
        let mut conn = established();
        let packet = conn.write(Bytes::from_static(b"World")).unwrap();
        assert_eq!(packet.flag, Flag::Data);
        assert_eq!(packet.seq, 1);

        let reset = conn.close_locally().unwrap();
        assert_eq!(reset.flag, Flag::Reset);
        assert_eq!(reset.seq, 2);
        assert!(conn.close_locally().is_none());
        assert_eq!(conn.write(Bytes::new()), Err(SimError::Closed));
    }

    #[test]
    fn test_handshake_expiry_only_for_half_open() {
        let mut fx = Effects::default();
        let mut conn = ConnState::inbound(key(1), &from_client(Flag::Syn, 0), &mut fx);
        assert_eq!(conn.expire_handshake().map(|p| p.flag), Some(Flag::Reset));

        let mut conn = established();
        assert!(conn.expire_handshake().is_none());
    }
}

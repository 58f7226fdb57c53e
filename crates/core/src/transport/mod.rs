//! Virtual transport layer.
//!
//! A simplified reliable stream protocol over simulated packets: a three
//! way handshake, per-direction sequence numbers, in-order delivery through
//! a reorder buffer and RESET for teardown. There are no retransmissions;
//! a lost handshake segment surfaces to the caller as a timeout or reset.
//!
//! Protocol state lives in a per-machine [`PortTable`] owned by the cluster.
//! Scripts only hold [`Socket`] and [`Connection`] handles, which are keys
//! into that table.

use std::fmt;

mod connection;
mod errors;
mod packet;
mod socket;

pub use connection::Connection;
pub use errors::SimError;
pub use packet::{Endpoint, Flag, Packet};
pub use socket::Socket;

pub(crate) use socket::{ConnIds, PortTable};

/// Ephemeral ports are handed out upward from here.
pub(crate) const EPHEMERAL_PORT_START: u16 = 49152;

/// Stable identifier of one connection.
///
/// The id is unique for the whole run, so a key outlives reboots and
/// reconnections from a reused endpoint without ever matching a newer
/// connection.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnKey {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub id: u64,
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {} (#{})", self.local, self.remote, self.id)
    }
}

impl fmt::Debug for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Side effects produced while the port tables are borrowed.
///
/// Applied by the world once the borrow is released.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// Packets to hand to the router
    pub packets: Vec<Packet>,
    /// Half-open connections whose ACK wait starts now
    pub handshake_timers: Vec<ConnKey>,
}

impl Effects {
    pub fn send(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.handshake_timers.is_empty()
    }
}

use std::{fmt, str::FromStr, sync::Arc};

use bytes::Bytes;

use super::errors::SimError;

/// A (machine, port) pair identifying one end of a simulated connection.
///
/// Machine names are compared byte for byte, so `"API"` and `"api"` are
/// different machines.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    machine: Arc<str>,
    port: u16,
}

impl Endpoint {
    pub fn new(machine: impl Into<Arc<str>>, port: u16) -> Self {
        Self {
            machine: machine.into(),
            port,
        }
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Endpoint {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (machine, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SimError::InvalidEndpoint(s.to_owned()))?;
        if machine.is_empty() {
            return Err(SimError::InvalidEndpoint(s.to_owned()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| SimError::InvalidEndpoint(s.to_owned()))?;
        Ok(Self::new(machine, port))
    }
}

impl From<(&str, u16)> for Endpoint {
    fn from((machine, port): (&str, u16)) -> Self {
        Self::new(machine, port)
    }
}

/// Control flag carried by every simulated packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flag {
    Syn,
    SynAck,
    Ack,
    Reset,
    Data,
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Flag::Syn => "SYN",
            Flag::SynAck => "SYN|ACK",
            Flag::Ack => "ACK",
            Flag::Reset => "RESET",
            Flag::Data => "DATA",
        };
        f.write_str(s)
    }
}

/// Envelope routed by the cluster between two endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub flag: Flag,
    /// Per-direction sequence number assigned by the sending connection.
    pub seq: u64,
    pub payload: Option<Bytes>,
}

impl Packet {
    pub(crate) fn control(source: Endpoint, destination: Endpoint, flag: Flag, seq: u64) -> Self {
        Self {
            source,
            destination,
            flag,
            seq,
            payload: None,
        }
    }

    pub(crate) fn data(source: Endpoint, destination: Endpoint, seq: u64, payload: Bytes) -> Self {
        Self {
            source,
            destination,
            flag: Flag::Data,
            seq,
            payload: Some(payload),
        }
    }

    /// Short human readable summary used in logs.
    pub fn summary(&self) -> String {
        match &self.payload {
            Some(body) => format!(
                "{} -> {} {} #{} '{}'",
                self.source,
                self.destination,
                self.flag,
                self.seq,
                String::from_utf8_lossy(body)
            ),
            None => format!(
                "{} -> {} {} #{}",
                self.source, self.destination, self.flag, self.seq
            ),
        }
    }
}

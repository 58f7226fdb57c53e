use thiserror::Error;

use super::packet::Endpoint;

/// Failures surfaced to simulated scripts.
///
/// The first four variants are the engine's fault model. The rest report
/// misuse of the socket API. None of them are retried by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// Nothing answered: no route, no listener, or the host is down.
    #[error("no route to host {0}")]
    Unreachable(Endpoint),

    /// The peer tore the connection (or the handshake) down.
    #[error("connection reset by {0}")]
    Reset(Endpoint),

    #[error("timeout occurred")]
    Timeout,

    /// The owning process was cancelled while the call was suspended.
    #[error("operation cancelled")]
    Cancelled,

    #[error("address already in use: {0}")]
    AddressInUse(Endpoint),

    /// A second Accept or Read was issued while one is still pending.
    #[error("there is a wait already")]
    AlreadyWaiting,

    #[error("socket or connection is closed")]
    Closed,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl SimError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SimError::Unreachable(_))
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, SimError::Reset(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SimError::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SimError::Cancelled)
    }
}

//! The server acceptor.
//!
//! Owns the listening socket exclusively and routes accepted sockets across
//! the participating workers round-robin. Never touches application state.

mod actor;
mod ingress;

pub(crate) use actor::Acceptor;
pub use ingress::Control;

/// Server lifecycle, observable through [`crate::system::ServerHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Created but not yet bound.
    Initializing = 0,
    /// Listening socket bound; acceptor not yet running.
    Bound = 1,
    /// Accepting connections.
    Running = 2,
    /// No longer accepting; in-flight connections finish.
    Draining = 3,
    /// Terminal; the listening socket is released.
    Stopped = 4,
}

impl ServerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initializing,
            1 => Self::Bound,
            2 => Self::Running,
            3 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Bound on accepted sockets per loop turn, so a connect flood cannot starve
/// control commands.
pub(crate) const ACCEPT_PER_LOOP_MAX: usize = 100;

//! Control messages for a server acceptor.

/// A control command for the acceptor loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    /// Stop accepting but keep the thread alive so in-flight connections can
    /// finish under a live server entry.
    Drain,
    /// Release the listening socket and exit.
    Stop,
}

//! The runtime's long-lived actors: event-loop workers and server acceptors.
//!
//! Each actor is one OS thread with a mio poll and a bounded command inbox;
//! cross-thread communication is strictly by message.

pub mod acceptor;
pub mod worker;

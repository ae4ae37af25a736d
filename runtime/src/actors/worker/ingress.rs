//! Messages that can be processed by a worker.

use crate::{
    connection::{ConnectionHandler, InitializerFactory},
    context::{Context, WorkerItem},
};
use mio::net::TcpStream;
use std::{any::Any, net::SocketAddr, sync::Arc, time::Duration};

/// A command enqueued to a worker's inbox.
///
/// Commands are processed FIFO, at most a fairness bound per loop turn.
/// Factories carry a pre-allocated context id so callers hold a usable
/// reference before the worker applies the bind.
pub enum Command {
    /// Create and register a [`WorkerItem`], then run its bind hook.
    Bind {
        id: u64,
        factory: Box<dyn FnOnce(Context) -> Box<dyn WorkerItem> + Send>,
    },
    /// Bind a client connection and begin an outgoing connect.
    BindAndConnect {
        id: u64,
        addr: SocketAddr,
        factory: Box<dyn FnOnce(Context) -> Box<dyn ConnectionHandler> + Send>,
    },
    /// Handoff of an accepted socket from a server acceptor.
    NewConnection {
        stream: TcpStream,
        peer: SocketAddr,
        server: u64,
    },
    /// Deliver a payload to an item's message hook.
    Message {
        target: u64,
        payload: Box<dyn Any + Send>,
    },
    /// An async-bridge completion is ready for import.
    AsyncResult { owner: u64, bridge: u64 },
    /// Place a timer that delivers `message` to `target` after `delay`.
    Schedule {
        target: u64,
        delay: Duration,
        message: Box<dyn Any + Send>,
    },
    /// A server starts participating on this worker; build its initializer.
    RegisterServer {
        server: u64,
        name: String,
        factory: Arc<dyn InitializerFactory>,
    },
    /// The server stopped; drop its initializer.
    DeregisterServer { server: u64 },
    /// Graceful: drain connections, then exit the loop.
    Shutdown,
    /// Immediate teardown.
    Apocalypse,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Bind { id, .. } => f.debug_struct("Bind").field("id", id).finish(),
            Command::BindAndConnect { id, addr, .. } => f
                .debug_struct("BindAndConnect")
                .field("id", id)
                .field("addr", addr)
                .finish(),
            Command::NewConnection { peer, server, .. } => f
                .debug_struct("NewConnection")
                .field("peer", peer)
                .field("server", server)
                .finish(),
            Command::Message { target, .. } => {
                f.debug_struct("Message").field("target", target).finish()
            }
            Command::AsyncResult { owner, bridge } => f
                .debug_struct("AsyncResult")
                .field("owner", owner)
                .field("bridge", bridge)
                .finish(),
            Command::Schedule { target, delay, .. } => f
                .debug_struct("Schedule")
                .field("target", target)
                .field("delay", delay)
                .finish(),
            Command::RegisterServer { server, name, .. } => f
                .debug_struct("RegisterServer")
                .field("server", server)
                .field("name", name)
                .finish(),
            Command::DeregisterServer { server } => f
                .debug_struct("DeregisterServer")
                .field("server", server)
                .finish(),
            Command::Shutdown => f.write_str("Shutdown"),
            Command::Apocalypse => f.write_str("Apocalypse"),
        }
    }
}

//! The acceptor loop.

use super::{ingress::Control, ServerState, ACCEPT_PER_LOOP_MAX};
use crate::{
    actors::worker::Command,
    context::WorkerHandle,
    metrics::ServerMetrics,
};
use crossbeam_queue::ArrayQueue;
use mio::{net::TcpListener, Events, Interest, Poll, Token, Waker};
use std::{
    io,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use tracing::{debug, info, warn};

// Token 0 is the control waker, created by the system alongside this poll.
const LISTENER_TOKEN: Token = Token(1);

pub(crate) struct Acceptor {
    server: u64,
    name: String,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    workers: Vec<WorkerHandle>,
    next: usize,
    state: Arc<AtomicU8>,
    control: Arc<ArrayQueue<Control>>,
    waker: Arc<Waker>,
    metrics: ServerMetrics,
}

impl Acceptor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        server: u64,
        name: String,
        poll: Poll,
        listener: TcpListener,
        workers: Vec<WorkerHandle>,
        state: Arc<AtomicU8>,
        control: Arc<ArrayQueue<Control>>,
        waker: Arc<Waker>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            server,
            name,
            poll,
            events: Events::with_capacity(64),
            listener,
            workers,
            next: 0,
            state,
            control,
            waker,
            metrics,
        }
    }

    pub(crate) fn run(mut self) {
        if let Err(err) =
            self.poll
                .registry()
                .register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
        {
            warn!(?err, server = %self.name, "failed to register listener");
            self.state.store(ServerState::Stopped as u8, Ordering::Release);
            return;
        }
        self.state.store(ServerState::Running as u8, Ordering::Release);
        info!(server = %self.name, "accepting connections");

        'outer: loop {
            if let Err(err) = self.poll.poll(&mut self.events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(?err, server = %self.name, "acceptor poll failed");
                break;
            }

            while let Some(control) = self.control.pop() {
                match control {
                    Control::Drain => self.drain(),
                    Control::Stop => break 'outer,
                }
            }

            if self.state.load(Ordering::Acquire) == ServerState::Running as u8 {
                self.accept_batch();
            }
        }

        // Release the socket and detach the per-worker initializers.
        for worker in &self.workers {
            let _ = worker.send(Command::DeregisterServer {
                server: self.server,
            });
        }
        self.state.store(ServerState::Stopped as u8, Ordering::Release);
        info!(server = %self.name, "stopped");
    }

    fn drain(&mut self) {
        if self.state.load(Ordering::Acquire) != ServerState::Running as u8 {
            return;
        }
        info!(server = %self.name, "draining");
        if let Err(err) = self.poll.registry().deregister(&mut self.listener) {
            warn!(?err, server = %self.name, "failed to deregister listener");
        }
        self.state.store(ServerState::Draining as u8, Ordering::Release);
    }

    fn accept_batch(&mut self) {
        for _ in 0..ACCEPT_PER_LOOP_MAX {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    self.metrics.accepts.inc();
                    self.dispatch(stream, peer);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(?err, server = %self.name, "failed to accept connection");
                    return;
                }
            }
        }
        // Readiness is edge-triggered and the batch bound was hit with the
        // backlog still hot; wake ourselves so the next turn keeps accepting
        // after control commands get their look-in.
        let _ = self.waker.wake();
    }

    /// Round-robin handoff; a worker with a saturated inbox is skipped, and
    /// the socket is dropped only when every worker refuses it.
    fn dispatch(&mut self, stream: mio::net::TcpStream, peer: std::net::SocketAddr) {
        let mut command = Command::NewConnection {
            stream,
            peer,
            server: self.server,
        };
        for _ in 0..self.workers.len() {
            let worker = &self.workers[self.next % self.workers.len()];
            self.next = self.next.wrapping_add(1);
            match worker.try_send(command) {
                Ok(()) => return,
                Err(returned) => command = returned,
            }
        }
        self.metrics.refusals.inc();
        warn!(server = %self.name, %peer, "all worker inboxes full, dropping connection");
    }
}

//! The named owner of a worker pool.
//!
//! An [`IoSystem`] spawns its workers, hands out servers and clients, and
//! tears everything down on shutdown. It is cheaply cloneable and many
//! independent systems can coexist in one process (tests rely on this).

use crate::{
    actors::{
        acceptor::{Acceptor, Control, ServerState},
        worker::{Command, Worker, WAKE_TOKEN},
    },
    connection::{ConnectionHandler, InitializerFactory},
    context::{Context, WorkerHandle, WorkerItem},
    metrics::Metrics,
    Config, Error,
};
use crossbeam_queue::ArrayQueue;
use mio::{net::TcpListener, Poll, Token, Waker};
use prometheus_client::registry::Registry;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{info, warn};

/// How long [`IoSystem::start`] waits for the worker readiness barrier.
const STARTUP_DEADLINE: Duration = Duration::from_secs(5);

/// Handle to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    id: u64,
    name: String,
    addr: SocketAddr,
    state: Arc<AtomicU8>,
    control: Arc<ArrayQueue<Control>>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    /// The server's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address; useful when serving on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stops accepting while letting in-flight connections finish.
    pub fn drain(&self) {
        let _ = self.control.push(Control::Drain);
        let _ = self.waker.wake();
    }

    /// Releases the listening socket; terminal.
    pub fn stop(&self) {
        let _ = self.control.push(Control::Stop);
        let _ = self.waker.wake();
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

struct Inner {
    name: String,
    cfg: Config,
    workers: Vec<WorkerHandle>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    exited: Mutex<mpsc::Receiver<usize>>,
    servers: Mutex<Vec<ServerHandle>>,
    registry: Mutex<Registry>,
    metrics: Metrics,
    next_worker: AtomicUsize,
    next_server: AtomicU64,
}

/// A named collection of event-loop workers plus their manager.
#[derive(Clone)]
pub struct IoSystem {
    inner: Arc<Inner>,
}

impl IoSystem {
    /// Spawns the worker pool and blocks until every worker's loop is live.
    ///
    /// A system with zero workers can be constructed (tests only); every
    /// bind, connect, and serve on it fails with [`Error::NoWorkers`].
    pub fn start(cfg: Config) -> Result<Self, Error> {
        if cfg.pipeline_low() > cfg.pipeline_high()
            || cfg.read_buffer_kb() == 0
            || cfg.write_buffer_kb() == 0
        {
            warn!("rejecting invalid configuration");
            return Err(Error::StartupFailed);
        }

        let mut registry = Registry::with_prefix(cfg.name());
        let metrics = Metrics::init(&mut registry);
        let ids = Arc::new(AtomicU64::new(1));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();

        let mut workers = Vec::with_capacity(cfg.num_workers());
        let mut threads = Vec::with_capacity(cfg.num_workers());
        for index in 0..cfg.num_workers() {
            let poll = Poll::new().map_err(|_| Error::StartupFailed)?;
            let waker = Arc::new(
                Waker::new(poll.registry(), WAKE_TOKEN).map_err(|_| Error::StartupFailed)?,
            );
            let inbox = Arc::new(ArrayQueue::new(cfg.inbox_capacity()));
            let handle = WorkerHandle::new(index, inbox.clone(), waker, ids.clone());

            let worker_cfg = cfg.clone();
            let worker_handle = handle.clone();
            let worker_metrics = metrics.for_worker(index as u64);
            let ready = ready_tx.clone();
            let exit = exit_tx.clone();
            let thread = thread::Builder::new()
                .name(format!("{}-worker-{}", cfg.name(), index))
                .spawn(move || {
                    // The worker and everything it owns live on this thread.
                    let worker = Worker::new(
                        index,
                        &worker_cfg,
                        poll,
                        inbox,
                        worker_handle,
                        worker_metrics,
                    );
                    worker.run(ready, exit);
                })
                .map_err(|_| Error::StartupFailed)?;

            workers.push(handle);
            threads.push(thread);
        }

        // Readiness barrier: every worker reports once its loop is
        // constructed and polling, so callers can bind immediately.
        for _ in 0..workers.len() {
            ready_rx
                .recv_timeout(STARTUP_DEADLINE)
                .map_err(|_| Error::StartupFailed)?;
        }
        info!(name = cfg.name(), workers = workers.len(), "io system started");

        let name = cfg.name().to_string();
        Ok(Self {
            inner: Arc::new(Inner {
                name,
                cfg,
                workers,
                threads: Mutex::new(threads),
                exited: Mutex::new(exit_rx),
                servers: Mutex::new(Vec::new()),
                registry: Mutex::new(registry),
                metrics,
                next_worker: AtomicUsize::new(0),
                next_server: AtomicU64::new(1),
            }),
        })
    }

    /// The system's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.inner.workers.len()
    }

    /// The `Send` handle to a specific worker.
    pub fn worker(&self, index: usize) -> Option<&WorkerHandle> {
        self.inner.workers.get(index)
    }

    fn pick_worker(&self) -> Result<&WorkerHandle, Error> {
        if self.inner.workers.is_empty() {
            return Err(Error::NoWorkers);
        }
        let index = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
        Ok(&self.inner.workers[index % self.inner.workers.len()])
    }

    /// Binds a bare [`WorkerItem`] to a worker chosen round-robin. Returns
    /// the owning worker's handle and the item's context id.
    pub fn bind(
        &self,
        factory: impl FnOnce(Context) -> Box<dyn WorkerItem> + Send + 'static,
    ) -> Result<(WorkerHandle, u64), Error> {
        let worker = self.pick_worker()?;
        let id = worker.allocate_id();
        worker.send(Command::Bind {
            id,
            factory: Box::new(factory),
        })?;
        Ok((worker.clone(), id))
    }

    /// Binds a client connection to a worker chosen round-robin and begins
    /// an outgoing connect.
    pub fn connect(
        &self,
        addr: SocketAddr,
        factory: impl FnOnce(Context) -> Box<dyn ConnectionHandler> + Send + 'static,
    ) -> Result<(WorkerHandle, u64), Error> {
        let worker = self.pick_worker()?;
        let id = worker.allocate_id();
        worker.send(Command::BindAndConnect {
            id,
            addr,
            factory: Box::new(factory),
        })?;
        Ok((worker.clone(), id))
    }

    /// Starts a server: binds the listening socket, installs an initializer
    /// on every worker, and spawns the acceptor.
    pub fn serve(
        &self,
        name: &str,
        addr: SocketAddr,
        factory: impl InitializerFactory,
    ) -> Result<ServerHandle, Error> {
        if self.inner.workers.is_empty() {
            return Err(Error::NoWorkers);
        }
        let factory: Arc<dyn InitializerFactory> = Arc::new(factory);
        let server = self.inner.next_server.fetch_add(1, Ordering::Relaxed);

        let listener = bind_listener(addr, self.inner.cfg.accept_backlog())?;
        let local_addr = listener.local_addr().map_err(|_| Error::BindFailed)?;
        let state = Arc::new(AtomicU8::new(ServerState::Bound as u8));

        for worker in &self.inner.workers {
            worker.send(Command::RegisterServer {
                server,
                name: name.to_string(),
                factory: factory.clone(),
            })?;
        }

        let poll = Poll::new().map_err(|_| Error::StartupFailed)?;
        let waker =
            Arc::new(Waker::new(poll.registry(), Token(0)).map_err(|_| Error::StartupFailed)?);
        let control = Arc::new(ArrayQueue::new(8));
        let acceptor = Acceptor::new(
            server,
            name.to_string(),
            poll,
            listener,
            self.inner.workers.clone(),
            state.clone(),
            control.clone(),
            waker.clone(),
            self.inner.metrics.for_server(name),
        );
        let thread = thread::Builder::new()
            .name(format!("{}-acceptor-{}", self.inner.name, name))
            .spawn(move || acceptor.run())
            .map_err(|_| Error::StartupFailed)?;

        let handle = ServerHandle {
            id: server,
            name: name.to_string(),
            addr: local_addr,
            state,
            control,
            waker,
        };
        info!(server = name, %local_addr, "server bound");
        self.inner.threads.lock().unwrap().push(thread);
        self.inner.servers.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    /// Renders the metrics registry in the Prometheus text format.
    pub fn encode_metrics(&self) -> String {
        let registry = self.inner.registry.lock().unwrap();
        let mut out = String::new();
        let _ = prometheus_client::encoding::text::encode(&mut out, &registry);
        out
    }

    /// Graceful shutdown: servers stop accepting, workers drain their
    /// connections, and anything still alive at the deadline is torn down
    /// immediately.
    pub fn shutdown(&self, deadline: Duration) {
        info!(name = %self.inner.name, "shutting down");
        for server in self.inner.servers.lock().unwrap().drain(..) {
            server.stop();
        }
        for worker in &self.inner.workers {
            let _ = worker.send(Command::Shutdown);
        }

        let deadline_at = Instant::now() + deadline;
        let mut remaining = self.inner.workers.len();
        {
            let exited = self.inner.exited.lock().unwrap();
            while remaining > 0 {
                let left = deadline_at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                match exited.recv_timeout(left) {
                    Ok(_) => remaining -= 1,
                    Err(_) => break,
                }
            }
        }
        if remaining > 0 {
            warn!(remaining, "graceful deadline exceeded, tearing down");
            for worker in &self.inner.workers {
                send_urgent(worker, Command::Apocalypse);
            }
        }
        for thread in self.inner.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for IoSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSystem")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.workers.len())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last reference without an explicit shutdown: best-effort teardown
        // so worker threads do not outlive the system.
        for server in self.servers.lock().unwrap().drain(..) {
            server.stop();
        }
        for worker in &self.workers {
            send_urgent(worker, Command::Apocalypse);
        }
    }
}

/// Pushes a command that must not be lost, yielding while the inbox is full.
/// Gives up once the worker has clearly stopped draining.
fn send_urgent(worker: &WorkerHandle, command: Command) {
    let mut command = command;
    for _ in 0..1024 {
        match worker.try_send(command) {
            Ok(()) => return,
            Err(returned) => {
                command = returned;
                thread::yield_now();
            }
        }
    }
    warn!(worker = worker.index(), "worker inbox saturated during teardown");
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|_| Error::BindFailed)?;
    socket.set_reuse_address(true).map_err(|_| Error::BindFailed)?;
    socket.bind(&addr.into()).map_err(|_| Error::BindFailed)?;
    socket
        .listen(backlog.min(i32::MAX as u32) as i32)
        .map_err(|_| Error::BindFailed)?;
    socket.set_nonblocking(true).map_err(|_| Error::BindFailed)?;
    Ok(TcpListener::from_std(socket.into()))
}

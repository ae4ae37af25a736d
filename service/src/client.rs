//! The pipelined client: FIFO request correlation over one connection.
//!
//! `send` encodes the request onto the connection's write pipeline and pushes
//! an entry onto the in-flight FIFO; decoded responses resolve entries
//! strictly in order (pipelining over an ordered transport). A request
//! deadline poisons the connection, since a truncated response would misalign
//! every later entry: the connection closes, remaining entries fail with a
//! disconnection error, and the reconnect policy takes over.

use crate::{codec::{Codec, Decoded}, retry::RetryPolicy};
use colossus_runtime::{
    Callback, ConnectionHandler, Context, DataBuffer, Error, Resolver, WorkerItem, WriteHandle,
};
use std::{
    any::Any,
    cell::RefCell,
    collections::VecDeque,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};
use tracing::{debug, warn};

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    request_timeout: Duration,
    retry: RetryPolicy,
    /// Sends accepted while the connection is still being established.
    pending_limit: usize,
}

impl ClientConfig {
    // Setters
    /// See [ClientConfig]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
    /// See [ClientConfig]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
    /// See [ClientConfig]
    pub const fn with_pending_limit(mut self, pending_limit: usize) -> Self {
        self.pending_limit = pending_limit;
        self
    }

    // Getters
    /// See [ClientConfig]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
    /// See [ClientConfig]
    pub const fn retry(&self) -> RetryPolicy {
        self.retry
    }
    /// See [ClientConfig]
    pub const fn pending_limit(&self) -> usize {
        self.pending_limit
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            retry: RetryPolicy::None,
            pending_limit: 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Timer payload for a request deadline.
struct Deadline {
    seq: u64,
}

/// Timer payload for a scheduled reconnect attempt.
struct Reconnect;

struct Flight<T> {
    seq: u64,
    resolver: Resolver<T>,
}

struct Core<C: Codec> {
    addr: SocketAddr,
    codec: C,
    cfg: ClientConfig,
    state: State,
    anchor: Option<Context>,
    link: Option<(Context, WriteHandle)>,
    inflight: VecDeque<Flight<C::Input>>,
    pending: VecDeque<(C::Output, Resolver<C::Input>)>,
    next_seq: u64,
    attempt: u32,
}

/// A worker-local handle to a pipelined client.
///
/// Cheap to clone; lives on the worker that opened it, like everything else
/// touching the connection.
pub struct Client<C: Codec> {
    core: Rc<RefCell<Core<C>>>,
}

impl<C: Codec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<C: Codec> Client<C> {
    /// Opens a client on the caller's worker and begins connecting.
    ///
    /// `ctx` may belong to any item on the worker that should own the client
    /// (commonly the initializer's context for worker-scoped pools).
    pub fn open(ctx: &Context, addr: SocketAddr, codec: C, cfg: ClientConfig) -> Self {
        let core = Rc::new(RefCell::new(Core {
            addr,
            codec,
            cfg,
            state: State::Connecting,
            anchor: None,
            link: None,
            inflight: VecDeque::new(),
            pending: VecDeque::new(),
            next_seq: 0,
            attempt: 0,
        }));
        let anchor_core = core.clone();
        ctx.bind(move |_anchor_ctx| Box::new(Anchor { core: anchor_core }) as Box<dyn WorkerItem>);
        Self { core }
    }

    /// Sends a request; the callback resolves with the correlated response,
    /// a timeout, or a disconnection error.
    ///
    /// While the connection is still being established, sends queue up to the
    /// pending limit and flush on connect.
    pub fn send(&self, request: C::Output) -> Callback<C::Input> {
        let (callback, resolver) = Callback::promise();
        submit(&self.core, request, resolver);
        callback
    }

    /// Current in-flight depth.
    pub fn in_flight(&self) -> usize {
        self.core.borrow().inflight.len()
    }

    /// Whether the transport is currently established.
    pub fn is_connected(&self) -> bool {
        self.core.borrow().state == State::Connected
    }

    /// Stops the client: aborts the transport and fails everything pending.
    pub fn close(&self) {
        let (anchor, link) = {
            let mut core = self.core.borrow_mut();
            core.state = State::Stopped;
            (core.anchor.take(), core.link.take())
        };
        if let Some((_, write)) = link {
            write.abort();
        }
        if let Some(anchor) = anchor {
            anchor.unbind(anchor.id());
        }
        fail_all(&self.core, &Error::Closed);
    }
}

/// The persistent worker item behind a client: outlives individual
/// connections so reconnect timers always have a live target.
struct Anchor<C: Codec> {
    core: Rc<RefCell<Core<C>>>,
}

impl<C: Codec> WorkerItem for Anchor<C> {
    fn on_bind(&mut self, ctx: &Context) {
        self.core.borrow_mut().anchor = Some(ctx.clone());
        start_connect(&self.core);
    }

    fn on_message(&mut self, _ctx: &Context, message: Box<dyn Any + Send>) {
        if message.downcast::<Reconnect>().is_ok() {
            start_connect(&self.core);
        }
    }

    fn on_unbind(&mut self, _ctx: &Context) {
        let link = {
            let mut core = self.core.borrow_mut();
            core.state = State::Stopped;
            core.anchor = None;
            core.link.take()
        };
        if let Some((_, write)) = link {
            write.abort();
        }
        fail_all(&self.core, &Error::ShuttingDown);
    }
}

/// The connection-side handler: decodes responses and resolves the FIFO.
struct Link<C: Codec> {
    core: Rc<RefCell<Core<C>>>,
}

impl<C: Codec> ConnectionHandler for Link<C> {
    fn on_bind(&mut self, ctx: &Context, write: &WriteHandle) {
        debug!(id = ctx.id(), "client transport established");
        let queued = {
            let mut core = self.core.borrow_mut();
            if core.state == State::Stopped {
                write.abort();
                return;
            }
            core.state = State::Connected;
            core.attempt = 0;
            core.link = Some((ctx.clone(), write.clone()));
            std::mem::take(&mut core.pending)
        };
        for (request, resolver) in queued {
            submit(&self.core, request, resolver);
        }
    }

    fn on_data(
        &mut self,
        _ctx: &Context,
        buf: &mut DataBuffer,
        _write: &WriteHandle,
    ) -> Result<(), Error> {
        loop {
            let decoded = self.core.borrow_mut().codec.decode(buf)?;
            match decoded {
                Decoded::More => return Ok(()),
                Decoded::Frame(response) => {
                    let flight = self.core.borrow_mut().inflight.pop_front();
                    match flight {
                        Some(flight) => flight.resolver.resolve(Ok(response)),
                        None => {
                            // Nothing to correlate against: the stream can no
                            // longer be aligned with the request FIFO.
                            return Err(Error::Protocol("unsolicited response".into()));
                        }
                    }
                }
            }
        }
    }

    fn on_message(
        &mut self,
        _ctx: &Context,
        message: Box<dyn Any + Send>,
        write: &WriteHandle,
    ) {
        if let Ok(deadline) = message.downcast::<Deadline>() {
            expire(&self.core, deadline.seq, write);
        }
    }

    fn on_disconnect(&mut self, ctx: &Context, reason: &Error) {
        debug!(id = ctx.id(), %reason, "client transport lost");
        on_disconnect(&self.core, reason);
    }
}

fn start_connect<C: Codec>(core: &Rc<RefCell<Core<C>>>) {
    let target = {
        let mut inner = core.borrow_mut();
        if inner.state == State::Stopped {
            return;
        }
        inner.state = State::Connecting;
        inner.anchor.clone().map(|anchor| (anchor, inner.addr))
    };
    let Some((anchor, addr)) = target else {
        return;
    };
    let link_core = core.clone();
    anchor.connect(addr, move |_ctx| Box::new(Link { core: link_core }) as Box<dyn ConnectionHandler>);
}

fn submit<C: Codec>(core: &Rc<RefCell<Core<C>>>, request: C::Output, resolver: Resolver<C::Input>) {
    let rejected = {
        let mut inner = core.borrow_mut();
        match inner.state {
            State::Connected => {
                let (link_ctx, write) = inner
                    .link
                    .clone()
                    .expect("connected client has a transport");
                let seq = inner.next_seq;
                inner.next_seq += 1;
                let encoder = inner.codec.encode(request);
                match write.write(encoder) {
                    Ok(()) => {
                        link_ctx.schedule(inner.cfg.request_timeout, Box::new(Deadline { seq }));
                        inner.inflight.push_back(Flight { seq, resolver });
                        None
                    }
                    Err(error) => Some((resolver, error)),
                }
            }
            State::Connecting | State::Reconnecting => {
                if inner.pending.len() < inner.cfg.pending_limit {
                    inner.pending.push_back((request, resolver));
                    None
                } else {
                    Some((resolver, Error::PipelineFull))
                }
            }
            State::Stopped => Some((resolver, Error::Closed)),
        }
    };
    if let Some((resolver, error)) = rejected {
        resolver.resolve(Err(error));
    }
}

/// A request deadline fired. If the entry is still in flight the connection
/// is poisoned: the entry times out, the transport closes, and the rest of
/// the FIFO fails with a disconnection error.
fn expire<C: Codec>(core: &Rc<RefCell<Core<C>>>, seq: u64, write: &WriteHandle) {
    let flight = {
        let mut inner = core.borrow_mut();
        let position = inner.inflight.iter().position(|flight| flight.seq == seq);
        position.and_then(|index| inner.inflight.remove(index))
    };
    let Some(flight) = flight else {
        // Already resolved; the deadline is stale.
        return;
    };
    warn!(seq, "request deadline elapsed, poisoning connection");
    flight.resolver.resolve(Err(Error::Timeout));
    write.abort();
}

fn on_disconnect<C: Codec>(core: &Rc<RefCell<Core<C>>>, reason: &Error) {
    let retry_in = {
        let mut inner = core.borrow_mut();
        inner.link = None;
        if inner.state == State::Stopped {
            None
        } else {
            let delay = inner.cfg.retry.delay(inner.attempt);
            match delay {
                Some(delay) => {
                    inner.state = State::Reconnecting;
                    inner.attempt += 1;
                    Some(delay)
                }
                None => {
                    inner.state = State::Stopped;
                    None
                }
            }
        }
    };

    // In-flight entries can never be matched again; pending sends survive a
    // reconnecting client but die with a stopped one.
    let flights: Vec<Flight<C::Input>> = core.borrow_mut().inflight.drain(..).collect();
    for flight in flights {
        flight.resolver.resolve(Err(match reason {
            Error::ConnectionFailed => Error::ConnectionFailed,
            _ => Error::Disconnected,
        }));
    }

    match retry_in {
        Some(delay) => {
            let anchor = core.borrow().anchor.clone();
            if let Some(anchor) = anchor {
                debug!(?delay, "scheduling reconnect");
                anchor.schedule(delay, Box::new(Reconnect));
            }
        }
        None => fail_all(core, reason),
    }
}

fn fail_all<C: Codec>(core: &Rc<RefCell<Core<C>>>, reason: &Error) {
    let (flights, pending) = {
        let mut inner = core.borrow_mut();
        (
            inner.inflight.drain(..).collect::<Vec<_>>(),
            inner.pending.drain(..).collect::<Vec<_>>(),
        )
    };
    let error = match reason {
        Error::ConnectionFailed => Error::ConnectionFailed,
        Error::ShuttingDown => Error::ShuttingDown,
        _ => Error::Disconnected,
    };
    for flight in flights {
        flight.resolver.resolve(Err(error.clone()));
    }
    for (_, resolver) in pending {
        resolver.resolve(Err(error.clone()));
    }
}

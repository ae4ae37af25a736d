//! The worker event loop.
//!
//! Each turn: drain the inbox up to a fairness bound, poll readiness with a
//! bounded wait, dispatch I/O events with a rotating start index, advance the
//! timing wheel, and apply the local actions handler code staged along the
//! way (binds, flushes, timers). Connections whose state machines reach
//! `Closed` are removed at the end of the step that closed them.

use super::{
    ingress::Command, INBOX_FAIRNESS, POLL_TIMEOUT_MAX, WAKE_TOKEN, WHEEL_SLOTS, WHEEL_TICK,
};
use crate::{
    connection::{Connection, ConnectionHandler, Initializer},
    context::{BindKind, Context, LocalAction, WorkerHandle, WorkerItem, WorkerLocal},
    metrics::WorkerMetrics,
    wheel::{TimerEntry, Wheel},
    Config, Error,
};
use crossbeam_queue::ArrayQueue;
use mio::{net::TcpStream, Events, Poll};
use std::{
    collections::HashMap,
    io,
    rc::Rc,
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

enum Entity {
    Connection(Connection),
    Item {
        ctx: Context,
        item: Box<dyn WorkerItem>,
    },
}

struct ServerEntry {
    name: String,
    initializer: Box<dyn Initializer>,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Worker {
    index: usize,
    poll: Poll,
    events: Events,
    inbox: Arc<ArrayQueue<Command>>,
    handle: WorkerHandle,
    local: Rc<WorkerLocal>,
    items: HashMap<u64, Entity>,
    wheel: Wheel,
    servers: HashMap<u64, ServerEntry>,
    read_scratch: Vec<u8>,
    write_scratch: Vec<u8>,
    read_cap: usize,
    pipeline_high: usize,
    pipeline_low: usize,
    idle_timeout: Option<Duration>,
    sweep_interval: Duration,
    metrics: WorkerMetrics,
    draining: bool,
    /// Reused per turn; rotated start index keeps late tokens from starving.
    event_buf: Vec<(u64, bool, bool)>,
    rotate: usize,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        cfg: &Config,
        poll: Poll,
        inbox: Arc<ArrayQueue<Command>>,
        handle: WorkerHandle,
        metrics: WorkerMetrics,
    ) -> Self {
        let now = Instant::now();
        let idle_timeout = cfg.connection_idle_timeout();
        let sweep_interval = idle_timeout
            .map(|timeout| (timeout / 4).clamp(WHEEL_TICK, Duration::from_secs(1)))
            .unwrap_or(Duration::from_secs(1));
        let mut wheel = Wheel::new(WHEEL_SLOTS, WHEEL_TICK, now);
        if idle_timeout.is_some() {
            wheel.schedule(now, sweep_interval, TimerEntry::IdleSweep);
        }
        Self {
            index,
            poll,
            events: Events::with_capacity(1024),
            inbox,
            handle,
            local: WorkerLocal::new(),
            items: HashMap::new(),
            wheel,
            servers: HashMap::new(),
            read_scratch: vec![0u8; cfg.read_buffer_kb() * 1024],
            write_scratch: vec![0u8; cfg.write_buffer_kb() * 1024],
            read_cap: cfg.read_buffer_kb() * 1024,
            pipeline_high: cfg.pipeline_high(),
            pipeline_low: cfg.pipeline_low(),
            idle_timeout,
            sweep_interval,
            metrics,
            draining: false,
            event_buf: Vec::new(),
            rotate: 0,
        }
    }

    /// Runs the loop to completion. `ready` is the startup barrier; `exited`
    /// reports the loop's end to the system.
    pub(crate) fn run(mut self, ready: mpsc::Sender<()>, exited: mpsc::Sender<usize>) {
        let _ = ready.send(());
        debug!(worker = self.index, "worker started");

        loop {
            // (a) Drain the inbox, bounded for fairness with I/O.
            let mut stop = false;
            for _ in 0..INBOX_FAIRNESS {
                let Some(command) = self.inbox.pop() else {
                    break;
                };
                self.metrics.commands.inc();
                if self.dispatch_command(command) == Flow::Stop {
                    stop = true;
                    break;
                }
                self.run_local_actions();
            }
            if stop {
                break;
            }
            if self.draining && !self.has_connections() {
                debug!(worker = self.index, "drained");
                break;
            }

            // (b) Poll readiness with a bounded wait. Commands left behind by
            // the fairness bound must not wait out the full timeout.
            let timeout = if self.inbox.is_empty() {
                self.wheel.poll_timeout(Instant::now(), POLL_TIMEOUT_MAX)
            } else {
                Duration::ZERO
            };
            if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, worker = self.index, "poll failed");
                break;
            }

            // (c) Dispatch, starting at a rotating index so a large ready set
            // cannot starve late registrations.
            self.event_buf.clear();
            for event in self.events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                self.event_buf
                    .push((event.token().0 as u64, event.is_readable(), event.is_writable()));
            }
            let ready_count = self.event_buf.len();
            if ready_count > 0 {
                self.rotate = self.rotate.wrapping_add(1);
                let start = self.rotate % ready_count;
                for i in 0..ready_count {
                    let (id, readable, writable) = self.event_buf[(start + i) % ready_count];
                    self.dispatch_io(id, readable, writable);
                    self.run_local_actions();
                }
            }

            // (d) Advance the timing wheel.
            for entry in self.wheel.advance(Instant::now()) {
                self.metrics.timers_fired.inc();
                self.fire_timer(entry);
                self.run_local_actions();
            }
        }

        self.teardown_all();
        debug!(worker = self.index, "worker stopped");
        let _ = exited.send(self.index);
    }

    fn has_connections(&self) -> bool {
        self.items
            .values()
            .any(|entity| matches!(entity, Entity::Connection(_)))
    }

    fn make_context(&self, id: u64) -> Context {
        Context::new(id, self.handle.clone(), self.local.clone())
    }

    fn dispatch_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Bind { id, factory } => {
                let ctx = self.make_context(id);
                let item = factory(ctx.clone());
                self.apply_bind(id, BindKind::Item(item), ctx);
            }
            Command::BindAndConnect { id, addr, factory } => {
                let ctx = self.make_context(id);
                let handler = factory(ctx.clone());
                self.apply_bind(id, BindKind::Connect { addr, handler }, ctx);
            }
            Command::NewConnection {
                stream,
                peer,
                server,
            } => self.accept_connection(stream, peer, server),
            Command::Message { target, payload } => self.deliver_message(target, payload),
            Command::AsyncResult { owner, bridge } => self.resume_bridge(owner, bridge),
            Command::Schedule {
                target,
                delay,
                message,
            } => self
                .wheel
                .schedule(Instant::now(), delay, TimerEntry::Message { target, message }),
            Command::RegisterServer {
                server,
                name,
                factory,
            } => {
                let ctx = self.make_context(self.handle.allocate_id());
                let initializer = factory.build(&ctx);
                self.servers.insert(server, ServerEntry { name, initializer });
            }
            Command::DeregisterServer { server } => {
                if let Some(mut entry) = self.servers.remove(&server) {
                    entry.initializer.on_shutdown();
                }
            }
            Command::Shutdown => self.begin_drain(),
            Command::Apocalypse => return Flow::Stop,
        }
        Flow::Continue
    }

    fn apply_bind(&mut self, id: u64, kind: BindKind, ctx: Context) {
        match kind {
            BindKind::Item(mut item) => {
                item.on_bind(&ctx);
                self.items.insert(id, Entity::Item { ctx, item });
            }
            BindKind::Connect { addr, mut handler } => {
                if self.draining {
                    handler.on_disconnect(&ctx, &Error::ShuttingDown);
                    return;
                }
                self.open_connection(id, ctx, addr, handler);
            }
        }
    }

    fn open_connection(
        &mut self,
        id: u64,
        ctx: Context,
        addr: std::net::SocketAddr,
        mut handler: Box<dyn ConnectionHandler>,
    ) {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                let mut conn = Connection::connecting(
                    ctx,
                    stream,
                    handler,
                    self.read_cap,
                    self.pipeline_high,
                    self.pipeline_low,
                );
                conn.start(self.poll.registry());
                self.metrics.connections_accepted.inc();
                self.metrics.connections_open.inc();
                self.items.insert(id, Entity::Connection(conn));
            }
            Err(err) => {
                debug!(?err, id, %addr, "outgoing connect failed to start");
                handler.on_disconnect(&ctx, &Error::ConnectionFailed);
            }
        }
    }

    fn accept_connection(&mut self, stream: TcpStream, peer: std::net::SocketAddr, server: u64) {
        if self.draining {
            return;
        }
        let id = self.handle.allocate_id();
        let ctx = self.make_context(id);
        let handler = match self.servers.get_mut(&server) {
            Some(entry) => match entry.initializer.on_connect(&ctx) {
                Ok(handler) => handler,
                Err(err) => {
                    warn!(error = ?err, server = %entry.name, "initializer refused connection");
                    return;
                }
            },
            None => {
                warn!(server, "connection handed to worker for unknown server");
                return;
            }
        };
        debug!(worker = self.index, id, %peer, "connection bound");
        let mut conn = Connection::accepted(
            ctx,
            stream,
            handler,
            self.read_cap,
            self.pipeline_high,
            self.pipeline_low,
        );
        conn.start(self.poll.registry());
        self.metrics.connections_accepted.inc();
        self.metrics.connections_open.inc();
        self.items.insert(id, Entity::Connection(conn));
    }

    fn deliver_message(&mut self, target: u64, payload: Box<dyn std::any::Any + Send>) {
        match self.items.get_mut(&target) {
            Some(Entity::Connection(conn)) => conn.deliver(payload),
            Some(Entity::Item { ctx, item }) => item.on_message(ctx, payload),
            None => debug!(item = target, "message for unknown item dropped"),
        }
    }

    fn resume_bridge(&mut self, owner: u64, bridge: u64) {
        let entry = self.local.bridges.borrow_mut().take(bridge);
        let Some((entry_owner, resume)) = entry else {
            return;
        };
        debug_assert_eq!(entry_owner, owner);
        if self.items.contains_key(&owner) {
            self.metrics.bridges_resumed.inc();
            resume();
        } else {
            // Owner unbound before the result arrived: the resumption is
            // discarded without touching anything.
            self.metrics.bridges_dropped.inc();
            drop(resume);
        }
    }

    fn fire_timer(&mut self, entry: TimerEntry) {
        match entry {
            TimerEntry::Message { target, message } => self.deliver_message(target, message),
            TimerEntry::IdleSweep => {
                self.idle_sweep();
                self.wheel
                    .schedule(Instant::now(), self.sweep_interval, TimerEntry::IdleSweep);
            }
        }
    }

    fn idle_sweep(&mut self) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<u64> = self
            .items
            .iter()
            .filter_map(|(id, entity)| match entity {
                Entity::Connection(conn) if conn.idle_expired(now, timeout) => Some(*id),
                _ => None,
            })
            .collect();
        for id in expired {
            debug!(id, "connection idle timeout");
            self.metrics.idle_closed.inc();
            self.remove_with(id, &Error::Timeout);
        }
    }

    fn dispatch_io(&mut self, id: u64, readable: bool, writable: bool) {
        let closed = {
            let Self {
                items,
                read_scratch,
                write_scratch,
                poll,
                metrics,
                ..
            } = self;
            let Some(entity) = items.get_mut(&id) else {
                return;
            };
            match entity {
                Entity::Connection(conn) => {
                    if writable {
                        conn.handle_writable(write_scratch, poll.registry(), metrics);
                    }
                    if readable && !conn.is_closed() {
                        conn.handle_readable(read_scratch, poll.registry(), metrics);
                    }
                    conn.is_closed()
                }
                Entity::Item { .. } => false,
            }
        };
        if closed {
            self.remove_with(id, &Error::Closed);
        }
    }

    fn run_local_actions(&mut self) {
        loop {
            let action = self.local.actions.borrow_mut().pop_front();
            let Some(action) = action else {
                break;
            };
            match action {
                LocalAction::Flush(id) => self.flush_connection(id),
                LocalAction::Bind { id, kind } => {
                    let ctx = self.make_context(id);
                    let kind = kind(ctx.clone());
                    self.apply_bind(id, kind, ctx);
                }
                LocalAction::Unbind { target } => self.remove_with(target, &Error::Closed),
                LocalAction::Schedule {
                    target,
                    delay,
                    message,
                } => self
                    .wheel
                    .schedule(Instant::now(), delay, TimerEntry::Message { target, message }),
            }
        }
    }

    fn flush_connection(&mut self, id: u64) {
        let closed = {
            let Self {
                items,
                write_scratch,
                poll,
                metrics,
                ..
            } = self;
            let Some(Entity::Connection(conn)) = items.get_mut(&id) else {
                return;
            };
            conn.flush(write_scratch, poll.registry(), metrics);
            conn.is_closed()
        };
        if closed {
            self.remove_with(id, &Error::Closed);
        }
    }

    /// Removes an item; connections not yet closed are torn down with
    /// `reason`. Pending bridge entries owned by the item are discarded.
    fn remove_with(&mut self, id: u64, reason: &Error) {
        let Some(entity) = self.items.remove(&id) else {
            return;
        };
        match entity {
            Entity::Connection(mut conn) => {
                if !conn.is_closed() {
                    conn.teardown(reason, self.poll.registry(), &self.metrics);
                }
            }
            Entity::Item { ctx, mut item } => item.on_unbind(&ctx),
        }
        self.local.bridges.borrow_mut().purge_owner(id);
    }

    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        debug!(worker = self.index, "draining");
        self.draining = true;
        for entity in self.items.values_mut() {
            if let Entity::Connection(conn) = entity {
                conn.write_handle().close();
            }
        }
    }

    fn teardown_all(&mut self) {
        let ids: Vec<u64> = self.items.keys().copied().collect();
        for id in ids {
            if let Some(Entity::Item { ctx, item }) = self.items.get_mut(&id) {
                let ctx = ctx.clone();
                item.on_shutdown(&ctx);
            }
            self.remove_with(id, &Error::ShuttingDown);
        }
        for (_, mut entry) in self.servers.drain() {
            entry.initializer.on_shutdown();
        }
    }
}

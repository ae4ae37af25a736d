//! Per-connection state machine and the chained write pipeline.
//!
//! A connection is pinned to the worker that created it. The worker drives
//! the read pump (socket → handler), the write pump (encoder pipeline →
//! socket scratch → socket), backpressure between the two, and graceful or
//! abrupt termination. Handlers never touch the socket: they consume a
//! [`DataBuffer`] and queue [`Encoder`]s through a [`WriteHandle`].

use crate::{
    buffer::{DataBuffer, DataOutBuffer, FixedOutBuffer},
    context::{Context, LocalAction, WorkerLocal},
    encoder::{EncodeStatus, Encoder},
    metrics::WorkerMetrics,
    Error,
};
use bytes::{Bytes, BytesMut};
use mio::{net::TcpStream, Interest, Registry, Token};
use std::{
    any::Any,
    cell::RefCell,
    collections::VecDeque,
    io::{Read, Write},
    rc::Rc,
    time::Instant,
};
use tracing::{debug, error, warn};

/// Callbacks a connection delivers to its protocol layer.
///
/// All hooks run on the connection's worker. `on_data` receives the visible
/// bytes and consumes whole frames from the front, leaving any partial frame
/// for the next read event. Returning an error closes the connection.
pub trait ConnectionHandler: 'static {
    /// Runs once when the connection is established (accepted, or an
    /// outgoing connect completed).
    fn on_bind(&mut self, _ctx: &Context, _write: &WriteHandle) {}

    /// Bytes arrived. Consume what can be framed; the remainder is retained.
    fn on_data(
        &mut self,
        ctx: &Context,
        buf: &mut DataBuffer,
        write: &WriteHandle,
    ) -> Result<(), Error>;

    /// A scheduled timer or a message sent to this connection's id.
    fn on_message(
        &mut self,
        _ctx: &Context,
        _message: Box<dyn Any + Send>,
        _write: &WriteHandle,
    ) {
    }

    /// Runs exactly once when the connection leaves the worker.
    fn on_disconnect(&mut self, _ctx: &Context, _reason: &Error) {}
}

/// Per-worker factory for per-connection handlers.
///
/// One instance exists per (server, worker) pair; it holds worker-scoped
/// resources such as upstream client pools and is only ever touched by its
/// worker's thread.
pub trait Initializer: 'static {
    /// Builds the handler for a newly accepted connection.
    fn on_connect(&mut self, ctx: &Context) -> Result<Box<dyn ConnectionHandler>, Error>;

    /// The owning server is stopping.
    fn on_shutdown(&mut self) {}
}

/// Builds one [`Initializer`] per participating worker.
pub trait InitializerFactory: Send + Sync + 'static {
    fn build(&self, worker: &Context) -> Box<dyn Initializer>;
}

impl<F> InitializerFactory for F
where
    F: Fn(&Context) -> Box<dyn Initializer> + Send + Sync + 'static,
{
    fn build(&self, worker: &Context) -> Box<dyn Initializer> {
        (self)(worker)
    }
}

/// Connection lifecycle. A connection is in exactly one state at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outgoing connect in flight (clients only).
    Connecting,
    /// Established; reads and writes flow.
    Connected,
    /// Peer closed its write side; we finish draining ours.
    HalfClosed,
    /// Terminal.
    Closed,
}

/// The bounded queue of encoders awaiting the socket, shared between the
/// connection and its handler's [`WriteHandle`]s.
pub(crate) struct WritePipeline {
    queue: VecDeque<Encoder>,
    high: usize,
    low: usize,
    /// Read interest is withheld while set; flips at the watermarks.
    suppressed: bool,
    closing: bool,
    aborting: bool,
    closed: bool,
}

impl WritePipeline {
    pub(crate) fn new(high: usize, low: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            high,
            low,
            suppressed: false,
            closing: false,
            aborting: false,
            closed: false,
        }
    }

    fn push(&mut self, encoder: Encoder) {
        self.queue.push_back(encoder);
        if self.queue.len() >= self.high {
            self.suppressed = true;
        }
    }

    /// Requeues bytes the socket would not take; does not count against the
    /// watermarks any differently than the encoder they came from.
    fn push_front(&mut self, encoder: Encoder) {
        self.queue.push_front(encoder);
    }

    fn after_drain(&mut self) {
        if self.suppressed && self.queue.len() <= self.low {
            self.suppressed = false;
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn suppressed(&self) -> bool {
        self.suppressed
    }
}

/// Handler-side handle for queueing output onto a connection.
///
/// Cheap to clone; continuations capture one and append completed responses
/// from wherever in the callback chain they finish. Writes to a closed
/// connection fail with [`Error::Closed`] and have no observable effect.
#[derive(Clone)]
pub struct WriteHandle {
    target: u64,
    pipeline: Rc<RefCell<WritePipeline>>,
    local: Rc<WorkerLocal>,
}

impl WriteHandle {
    pub(crate) fn new(
        target: u64,
        pipeline: Rc<RefCell<WritePipeline>>,
        local: Rc<WorkerLocal>,
    ) -> Self {
        Self {
            target,
            pipeline,
            local,
        }
    }

    /// Appends a frame to the write pipeline and requests a flush.
    pub fn write(&self, encoder: Encoder) -> Result<(), Error> {
        {
            let mut pipeline = self.pipeline.borrow_mut();
            if pipeline.closed || pipeline.closing || pipeline.aborting {
                return Err(Error::Closed);
            }
            pipeline.push(encoder);
        }
        self.local.defer(LocalAction::Flush(self.target));
        Ok(())
    }

    /// Requests a graceful close: queued frames drain first.
    pub fn close(&self) {
        self.pipeline.borrow_mut().closing = true;
        self.local.defer(LocalAction::Flush(self.target));
    }

    /// Requests an abrupt close: queued frames are discarded.
    pub fn abort(&self) {
        self.pipeline.borrow_mut().aborting = true;
        self.local.defer(LocalAction::Flush(self.target));
    }

    /// Number of frames awaiting the socket.
    pub fn depth(&self) -> usize {
        self.pipeline.borrow().depth()
    }

    pub fn is_closed(&self) -> bool {
        let pipeline = self.pipeline.borrow();
        pipeline.closed || pipeline.closing || pipeline.aborting
    }

    /// The connection's context id.
    pub fn target(&self) -> u64 {
        self.target
    }
}

pub(crate) struct Connection {
    ctx: Context,
    stream: TcpStream,
    state: ConnectionState,
    handler: Box<dyn ConnectionHandler>,
    pipeline: Rc<RefCell<WritePipeline>>,
    write: WriteHandle,
    read_buf: BytesMut,
    read_cap: usize,
    last_activity: Instant,
    /// Interest currently registered with the poll, if any.
    registered: Option<Interest>,
}

impl Connection {
    pub(crate) fn accepted(
        ctx: Context,
        stream: TcpStream,
        handler: Box<dyn ConnectionHandler>,
        read_cap: usize,
        high: usize,
        low: usize,
    ) -> Self {
        Self::new(ctx, stream, handler, ConnectionState::Connected, read_cap, high, low)
    }

    pub(crate) fn connecting(
        ctx: Context,
        stream: TcpStream,
        handler: Box<dyn ConnectionHandler>,
        read_cap: usize,
        high: usize,
        low: usize,
    ) -> Self {
        Self::new(ctx, stream, handler, ConnectionState::Connecting, read_cap, high, low)
    }

    fn new(
        ctx: Context,
        stream: TcpStream,
        handler: Box<dyn ConnectionHandler>,
        state: ConnectionState,
        read_cap: usize,
        high: usize,
        low: usize,
    ) -> Self {
        let pipeline = Rc::new(RefCell::new(WritePipeline::new(high, low)));
        let write = WriteHandle::new(ctx.id(), pipeline.clone(), ctx.local().clone());
        Self {
            ctx,
            stream,
            state,
            handler,
            pipeline,
            write,
            read_buf: BytesMut::with_capacity(read_cap),
            read_cap,
            last_activity: Instant::now(),
            registered: None,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub(crate) fn write_handle(&self) -> &WriteHandle {
        &self.write
    }

    /// Registers with the poll and, for established connections, runs the
    /// handler's bind hook.
    pub(crate) fn start(&mut self, registry: &Registry) {
        if let Err(err) = self.stream.set_nodelay(true) {
            warn!(?err, id = self.ctx.id(), "failed to set TCP_NODELAY");
        }
        self.update_interest(registry);
        if self.state == ConnectionState::Connected {
            self.handler.on_bind(&self.ctx, &self.write);
        }
    }

    fn desired_interest(&self) -> Option<Interest> {
        let pipeline = self.pipeline.borrow();
        match self.state {
            ConnectionState::Connecting => Some(Interest::WRITABLE),
            ConnectionState::Closed => None,
            ConnectionState::HalfClosed => {
                (!pipeline.queue.is_empty()).then_some(Interest::WRITABLE)
            }
            ConnectionState::Connected => {
                let read = !pipeline.suppressed && !pipeline.closing && !pipeline.aborting;
                let write = !pipeline.queue.is_empty();
                match (read, write) {
                    (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                    (true, false) => Some(Interest::READABLE),
                    (false, true) => Some(Interest::WRITABLE),
                    // Keep the registration alive with a writable interest so
                    // drains are observed even while reads are suppressed.
                    (false, false) => Some(Interest::WRITABLE),
                }
            }
        }
    }

    pub(crate) fn update_interest(&mut self, registry: &Registry) {
        let desired = self.desired_interest();
        if desired == self.registered {
            return;
        }
        let token = Token(self.ctx.id() as usize);
        let result = match (self.registered, desired) {
            (None, Some(interest)) => registry.register(&mut self.stream, token, interest),
            (Some(_), Some(interest)) => registry.reregister(&mut self.stream, token, interest),
            (Some(_), None) => registry.deregister(&mut self.stream),
            (None, None) => Ok(()),
        };
        if let Err(err) = result {
            warn!(?err, id = self.ctx.id(), "poll registration failed");
        }
        self.registered = desired;
    }

    /// Read pump: socket → read buffer → handler.
    pub(crate) fn handle_readable(
        &mut self,
        scratch: &mut [u8],
        registry: &Registry,
        metrics: &WorkerMetrics,
    ) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.last_activity = Instant::now();

        // Readiness is edge-triggered: keep pulling until the socket reports
        // WouldBlock, handing frames to the handler whenever the read buffer
        // fills up.
        loop {
            let mut eof = false;
            let mut socket_drained = false;
            loop {
                let room = self.read_cap.saturating_sub(self.read_buf.len());
                if room == 0 {
                    break;
                }
                let want = room.min(scratch.len());
                match self.stream.read(&mut scratch[..want]) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        metrics.bytes_read.inc_by(n as u64);
                        self.read_buf.extend_from_slice(&scratch[..n]);
                        if n < want {
                            // A short stream read means the socket is empty.
                            socket_drained = true;
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        socket_drained = true;
                        break;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(?err, id = self.ctx.id(), "read failed");
                        self.teardown(&Error::ReadFailed, registry, metrics);
                        return;
                    }
                }
            }

            self.process_input(registry, metrics);
            if self.is_closed() {
                return;
            }

            if eof {
                let pending = self.pipeline.borrow().depth() > 0;
                if pending {
                    self.state = ConnectionState::HalfClosed;
                    self.update_interest(registry);
                } else {
                    self.teardown(&Error::Closed, registry, metrics);
                }
                return;
            }
            if socket_drained {
                return;
            }
            // The read buffer was full: either the handler made room or the
            // frame can never fit.
            if self.read_buf.len() >= self.read_cap {
                error!(id = self.ctx.id(), "read buffer exhausted without a decodable frame");
                self.teardown(
                    &Error::Protocol("frame exceeds read buffer".into()),
                    registry,
                    metrics,
                );
                return;
            }
        }
    }

    fn process_input(&mut self, registry: &Registry, metrics: &WorkerMetrics) {
        if self.read_buf.is_empty() {
            return;
        }
        let mut buf = DataBuffer::new(self.read_buf.split().freeze());
        let result = self.handler.on_data(&self.ctx, &mut buf, &self.write);
        let rest = buf.into_bytes();
        if !rest.is_empty() {
            // Partial frame; keep it for the next read event.
            self.read_buf.extend_from_slice(&rest);
        }
        if let Err(err) = result {
            debug!(error = ?err, id = self.ctx.id(), "handler rejected input");
            self.teardown(&err, registry, metrics);
        }
    }

    /// Write readiness: either an outgoing connect finished or the socket
    /// drained enough to continue flushing.
    pub(crate) fn handle_writable(
        &mut self,
        scratch: &mut [u8],
        registry: &Registry,
        metrics: &WorkerMetrics,
    ) {
        if self.state == ConnectionState::Connecting {
            match self.stream.take_error() {
                Ok(None) => match self.stream.peer_addr() {
                    Ok(_) => {
                        debug!(id = self.ctx.id(), "outgoing connect established");
                        self.state = ConnectionState::Connected;
                        self.last_activity = Instant::now();
                        self.update_interest(registry);
                        self.handler.on_bind(&self.ctx, &self.write);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotConnected => return,
                    Err(err) => {
                        debug!(?err, id = self.ctx.id(), "outgoing connect failed");
                        self.teardown(&Error::ConnectionFailed, registry, metrics);
                        return;
                    }
                },
                Ok(Some(err)) => {
                    debug!(?err, id = self.ctx.id(), "outgoing connect failed");
                    self.teardown(&Error::ConnectionFailed, registry, metrics);
                    return;
                }
                Err(err) => {
                    debug!(?err, id = self.ctx.id(), "outgoing connect failed");
                    self.teardown(&Error::ConnectionFailed, registry, metrics);
                    return;
                }
            }
        }
        self.flush(scratch, registry, metrics);
    }

    /// Write pump: encoders → scratch → socket, stopping cleanly on a short
    /// write and resuming when writability returns.
    pub(crate) fn flush(
        &mut self,
        scratch: &mut [u8],
        registry: &Registry,
        metrics: &WorkerMetrics,
    ) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.state == ConnectionState::Connecting {
            // A close requested before the connect finished tears the
            // attempt down; otherwise wait for writability.
            let cancelled = {
                let pipeline = self.pipeline.borrow();
                pipeline.closing || pipeline.aborting
            };
            if cancelled {
                self.teardown(&Error::Closed, registry, metrics);
            }
            return;
        }
        if self.pipeline.borrow().aborting {
            self.teardown(&Error::Closed, registry, metrics);
            return;
        }

        loop {
            // Stream as many frames as fit into one scratch batch.
            let filled = {
                let mut pipeline = self.pipeline.borrow_mut();
                let mut out = FixedOutBuffer::new(scratch);
                while out.available() > 0 {
                    let Some(head) = pipeline.queue.front_mut() else {
                        break;
                    };
                    match head.write_into(&mut out) {
                        Ok(EncodeStatus::Complete) => {
                            pipeline.queue.pop_front();
                        }
                        Ok(EncodeStatus::Incomplete) => {
                            if out.available() == 0 {
                                break;
                            }
                            // A sized frame spilled to its overflow buffer;
                            // the next pass drains it as a block.
                            metrics.encoder_overflows.inc();
                        }
                        Err(err) => {
                            error!(error = ?err, id = self.ctx.id(), "encoder failure");
                            drop(pipeline);
                            self.teardown(&err, registry, metrics);
                            return;
                        }
                    }
                }
                pipeline.after_drain();
                out.written()
            };

            if filled == 0 {
                break;
            }

            let mut offset = 0;
            while offset < filled {
                match self.stream.write(&scratch[offset..filled]) {
                    Ok(0) => {
                        self.teardown(&Error::WriteFailed, registry, metrics);
                        return;
                    }
                    Ok(n) => {
                        metrics.bytes_written.inc_by(n as u64);
                        offset += n;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(?err, id = self.ctx.id(), "write failed");
                        self.teardown(&Error::WriteFailed, registry, metrics);
                        return;
                    }
                }
            }

            if offset < filled {
                // Short write: keep the unsent bytes at the head of the
                // pipeline and wait for writability.
                self.pipeline
                    .borrow_mut()
                    .push_front(Encoder::block(Bytes::copy_from_slice(&scratch[offset..filled])));
                self.update_interest(registry);
                return;
            }
        }

        // Fully drained.
        let (closing, depth) = {
            let pipeline = self.pipeline.borrow();
            (pipeline.closing, pipeline.depth())
        };
        debug_assert_eq!(depth, 0);
        if closing || self.state == ConnectionState::HalfClosed {
            self.teardown(&Error::Closed, registry, metrics);
            return;
        }
        self.update_interest(registry);
    }

    /// Delivers a message or expired timer payload to the handler.
    pub(crate) fn deliver(&mut self, message: Box<dyn Any + Send>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.handler.on_message(&self.ctx, message, &self.write);
    }

    pub(crate) fn idle_expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        self.state != ConnectionState::Closed
            && now.saturating_duration_since(self.last_activity) >= timeout
    }

    /// Terminal transition: deregister, discard pending output, and notify
    /// the handler exactly once.
    pub(crate) fn teardown(
        &mut self,
        reason: &Error,
        registry: &Registry,
        metrics: &WorkerMetrics,
    ) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!(id = self.ctx.id(), reason = ?reason, "connection closed");
        self.state = ConnectionState::Closed;
        {
            let mut pipeline = self.pipeline.borrow_mut();
            pipeline.closed = true;
            pipeline.queue.clear();
        }
        if self.registered.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
        metrics.connections_closed.inc();
        metrics.connections_open.dec();
        self.handler.on_disconnect(&self.ctx, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_hysteresis() {
        let mut pipeline = WritePipeline::new(4, 2);
        assert!(!pipeline.suppressed());

        for _ in 0..4 {
            pipeline.push(Encoder::block(&b"x"[..]));
        }
        assert!(pipeline.suppressed());

        // Draining to just above the low watermark keeps reads suppressed.
        pipeline.queue.pop_front();
        pipeline.after_drain();
        assert!(pipeline.suppressed());

        // First transition to the low watermark restores reads.
        pipeline.queue.pop_front();
        pipeline.after_drain();
        assert!(!pipeline.suppressed());
    }

    #[test]
    fn test_suppression_reasserts_on_refill() {
        let mut pipeline = WritePipeline::new(2, 0);
        pipeline.push(Encoder::block(&b"x"[..]));
        assert!(!pipeline.suppressed());
        pipeline.push(Encoder::block(&b"y"[..]));
        assert!(pipeline.suppressed());

        pipeline.queue.clear();
        pipeline.after_drain();
        assert!(!pipeline.suppressed());

        pipeline.push(Encoder::block(&b"z"[..]));
        pipeline.push(Encoder::block(&b"w"[..]));
        assert!(pipeline.suppressed());
    }
}

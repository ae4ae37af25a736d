#![doc = include_str!("../README.md")]

pub mod actors;
pub mod buffer;
pub mod callback;
pub mod connection;
pub mod context;
pub mod encoder;
pub mod mocks;
pub mod system;

mod metrics;
mod wheel;

pub use actors::{
    acceptor::{Control, ServerState},
    worker::Command,
};
pub use buffer::{DataBuffer, DataOutBuffer, DynamicOutBuffer, FixedOutBuffer};
pub use callback::{AsyncHandle, Callback, Completer, Resolver};
pub use connection::{
    ConnectionHandler, ConnectionState, Initializer, InitializerFactory, WriteHandle,
};
pub use context::{Context, WorkerHandle, WorkerItem};
pub use encoder::{EncodeStatus, Encoder};
pub use system::{IoSystem, ServerHandle};

use std::{sync::Arc, time::Duration};
use thiserror::Error as ThisError;

/// Errors surfaced by the runtime.
///
/// Cloneable so a single failure can resolve many pending callbacks.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// The connection or item is gone; also the reason for a normal close.
    #[error("closed")]
    Closed,
    /// An idle or request deadline elapsed.
    #[error("timeout")]
    Timeout,
    #[error("bind failed")]
    BindFailed,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("read failed")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    /// The worker's bounded inbox is saturated.
    #[error("mailbox full")]
    MailboxFull,
    /// The system was started with zero workers (tests only).
    #[error("no workers")]
    NoWorkers,
    #[error("shutting down")]
    ShuttingDown,
    #[error("startup failed")]
    StartupFailed,
    /// The off-worker side of an async bridge went away without completing.
    #[error("bridge dropped")]
    BridgeDropped,
    /// A producer wrote past the sink's capacity; a programming error.
    #[error("buffer overflow")]
    BufferOverflow,
    /// `write_into` was called on an encoder that already finished; a
    /// programming error.
    #[error("encoder already complete")]
    EncoderComplete,
    /// The peer went away with requests still in flight.
    #[error("disconnected")]
    Disconnected,
    /// The client's pending-send buffer is full.
    #[error("pipeline full")]
    PipelineFull,
    /// Bytes did not satisfy the codec grammar; unrecoverable at the
    /// transport level.
    #[error("protocol: {0}")]
    Protocol(String),
    /// An application handler failed.
    #[error("handler: {0}")]
    Handler(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an application error for transport through a callback chain.
    pub fn handler(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Handler(Arc::new(error))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Protocol(a), Error::Protocol(b)) => a == b,
            (Error::Handler(a), Error::Handler(b)) => Arc::ptr_eq(a, b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

/// Runtime configuration.
///
/// Buffer sizes and watermarks are per connection; the worker count and
/// inbox capacity are per system.
#[derive(Clone, Debug)]
pub struct Config {
    name: String,
    num_workers: usize,
    read_buffer_kb: usize,
    write_buffer_kb: usize,
    pipeline_high: usize,
    pipeline_low: usize,
    connection_idle_timeout: Option<Duration>,
    accept_backlog: u32,
    inbox_capacity: usize,
}

impl Config {
    // Setters
    /// See [Config]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
    /// Worker count. Zero is legal only for tests: such a system fails every
    /// bind with [`Error::NoWorkers`].
    pub const fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }
    /// See [Config]
    pub const fn with_read_buffer_kb(mut self, read_buffer_kb: usize) -> Self {
        self.read_buffer_kb = read_buffer_kb;
        self
    }
    /// See [Config]
    pub const fn with_write_buffer_kb(mut self, write_buffer_kb: usize) -> Self {
        self.write_buffer_kb = write_buffer_kb;
        self
    }
    /// Backpressure watermarks: reads pause at `high` queued frames and
    /// resume at `low`.
    pub const fn with_pipeline_watermarks(mut self, high: usize, low: usize) -> Self {
        self.pipeline_high = high;
        self.pipeline_low = low;
        self
    }
    /// See [Config]
    pub const fn with_connection_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_idle_timeout = timeout;
        self
    }
    /// See [Config]
    pub const fn with_accept_backlog(mut self, accept_backlog: u32) -> Self {
        self.accept_backlog = accept_backlog;
        self
    }
    /// See [Config]
    pub const fn with_inbox_capacity(mut self, inbox_capacity: usize) -> Self {
        self.inbox_capacity = inbox_capacity;
        self
    }

    // Getters
    /// See [Config]
    pub fn name(&self) -> &str {
        &self.name
    }
    /// See [Config]
    pub const fn num_workers(&self) -> usize {
        self.num_workers
    }
    /// See [Config]
    pub const fn read_buffer_kb(&self) -> usize {
        self.read_buffer_kb
    }
    /// See [Config]
    pub const fn write_buffer_kb(&self) -> usize {
        self.write_buffer_kb
    }
    /// See [Config]
    pub const fn pipeline_high(&self) -> usize {
        self.pipeline_high
    }
    /// See [Config]
    pub const fn pipeline_low(&self) -> usize {
        self.pipeline_low
    }
    /// See [Config]
    pub const fn connection_idle_timeout(&self) -> Option<Duration> {
        self.connection_idle_timeout
    }
    /// See [Config]
    pub const fn accept_backlog(&self) -> u32 {
        self.accept_backlog
    }
    /// See [Config]
    pub const fn inbox_capacity(&self) -> usize {
        self.inbox_capacity
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "colossus".to_string(),
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            read_buffer_kb: 64,
            write_buffer_kb: 64,
            pipeline_high: 128,
            pipeline_low: 32,
            connection_idle_timeout: None,
            accept_backlog: 1024,
            inbox_capacity: 16 * 1024,
        }
    }
}

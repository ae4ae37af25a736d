//! Runtime metrics.
//!
//! Counters are sharded per worker: each worker resolves its labeled handles
//! once at startup and bumps plain atomics from then on, so the hot path
//! never touches the registry. A scrape merges the shards by label.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct WorkerLabel {
    pub(crate) worker: u64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct ServerLabel {
    pub(crate) server: String,
}

#[derive(Debug)]
pub(crate) struct Metrics {
    connections_accepted: Family<WorkerLabel, Counter>,
    connections_closed: Family<WorkerLabel, Counter>,
    connections_open: Family<WorkerLabel, Gauge>,
    bytes_read: Family<WorkerLabel, Counter>,
    bytes_written: Family<WorkerLabel, Counter>,
    commands: Family<WorkerLabel, Counter>,
    timers_fired: Family<WorkerLabel, Counter>,
    bridges_resumed: Family<WorkerLabel, Counter>,
    bridges_dropped: Family<WorkerLabel, Counter>,
    encoder_overflows: Family<WorkerLabel, Counter>,
    idle_closed: Family<WorkerLabel, Counter>,
    accepts: Family<ServerLabel, Counter>,
    refusals: Family<ServerLabel, Counter>,
}

impl Metrics {
    pub(crate) fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            connections_accepted: Family::default(),
            connections_closed: Family::default(),
            connections_open: Family::default(),
            bytes_read: Family::default(),
            bytes_written: Family::default(),
            commands: Family::default(),
            timers_fired: Family::default(),
            bridges_resumed: Family::default(),
            bridges_dropped: Family::default(),
            encoder_overflows: Family::default(),
            idle_closed: Family::default(),
            accepts: Family::default(),
            refusals: Family::default(),
        };
        registry.register(
            "connections_accepted",
            "Total connections bound to a worker",
            metrics.connections_accepted.clone(),
        );
        registry.register(
            "connections_closed",
            "Total connections fully closed",
            metrics.connections_closed.clone(),
        );
        registry.register(
            "connections_open",
            "Connections currently bound to a worker",
            metrics.connections_open.clone(),
        );
        registry.register(
            "bytes_read",
            "Bytes read from sockets",
            metrics.bytes_read.clone(),
        );
        registry.register(
            "bytes_written",
            "Bytes written to sockets",
            metrics.bytes_written.clone(),
        );
        registry.register(
            "commands",
            "Worker commands processed",
            metrics.commands.clone(),
        );
        registry.register(
            "timers_fired",
            "Timing wheel entries fired",
            metrics.timers_fired.clone(),
        );
        registry.register(
            "bridges_resumed",
            "Async-bridge results resumed on their worker",
            metrics.bridges_resumed.clone(),
        );
        registry.register(
            "bridges_dropped",
            "Async-bridge results discarded because the owner was gone",
            metrics.bridges_dropped.clone(),
        );
        registry.register(
            "encoder_overflows",
            "Sized frames that spilled to a heap buffer",
            metrics.encoder_overflows.clone(),
        );
        registry.register(
            "idle_closed",
            "Connections closed by the idle timeout",
            metrics.idle_closed.clone(),
        );
        registry.register(
            "accepted",
            "Sockets accepted by a server",
            metrics.accepts.clone(),
        );
        registry.register(
            "refused",
            "Accepted sockets dropped because every worker inbox was full",
            metrics.refusals.clone(),
        );
        metrics
    }

    /// Resolves this worker's shard of each family.
    pub(crate) fn for_worker(&self, worker: u64) -> WorkerMetrics {
        let label = WorkerLabel { worker };
        WorkerMetrics {
            connections_accepted: self.connections_accepted.get_or_create(&label).clone(),
            connections_closed: self.connections_closed.get_or_create(&label).clone(),
            connections_open: self.connections_open.get_or_create(&label).clone(),
            bytes_read: self.bytes_read.get_or_create(&label).clone(),
            bytes_written: self.bytes_written.get_or_create(&label).clone(),
            commands: self.commands.get_or_create(&label).clone(),
            timers_fired: self.timers_fired.get_or_create(&label).clone(),
            bridges_resumed: self.bridges_resumed.get_or_create(&label).clone(),
            bridges_dropped: self.bridges_dropped.get_or_create(&label).clone(),
            encoder_overflows: self.encoder_overflows.get_or_create(&label).clone(),
            idle_closed: self.idle_closed.get_or_create(&label).clone(),
        }
    }

    /// Resolves a server's accept-side counters.
    pub(crate) fn for_server(&self, server: &str) -> ServerMetrics {
        let label = ServerLabel {
            server: server.to_string(),
        };
        ServerMetrics {
            accepts: self.accepts.get_or_create(&label).clone(),
            refusals: self.refusals.get_or_create(&label).clone(),
        }
    }
}

/// One worker's pre-resolved counter handles.
#[derive(Clone, Debug)]
pub(crate) struct WorkerMetrics {
    pub(crate) connections_accepted: Counter,
    pub(crate) connections_closed: Counter,
    pub(crate) connections_open: Gauge,
    pub(crate) bytes_read: Counter,
    pub(crate) bytes_written: Counter,
    pub(crate) commands: Counter,
    pub(crate) timers_fired: Counter,
    pub(crate) bridges_resumed: Counter,
    pub(crate) bridges_dropped: Counter,
    pub(crate) encoder_overflows: Counter,
    pub(crate) idle_closed: Counter,
}

/// One server's pre-resolved counter handles.
#[derive(Clone, Debug)]
pub(crate) struct ServerMetrics {
    pub(crate) accepts: Counter,
    pub(crate) refusals: Counter,
}

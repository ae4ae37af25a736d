//! The single-threaded event-loop worker.
//!
//! A worker owns a readiness selector, a table of worker items keyed by
//! context id, a timing wheel, and a bounded command inbox drained once per
//! loop turn. Everything it owns is mutated only on its thread.

mod actor;
mod ingress;

pub(crate) use actor::Worker;
pub use ingress::Command;

use mio::Token;
use std::time::Duration;

/// Token reserved for the inbox waker; item tokens are context ids, which
/// start above zero.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// Commands drained per loop turn before readiness is polled again.
pub(crate) const INBOX_FAIRNESS: usize = 256;

/// Upper bound on a single poll wait.
pub(crate) const POLL_TIMEOUT_MAX: Duration = Duration::from_millis(100);

/// Timing wheel granularity.
pub(crate) const WHEEL_TICK: Duration = Duration::from_millis(10);

/// Timing wheel slot count.
pub(crate) const WHEEL_SLOTS: usize = 512;

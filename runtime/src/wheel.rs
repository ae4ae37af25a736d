//! Hashed timing wheel.
//!
//! One wheel per worker drives idle sweeps, scheduled item messages, client
//! request deadlines, and reconnect delays. Slots are buckets of entries
//! hashed by expiry tick; advancing the wheel walks only the slots whose
//! ticks have elapsed.

use std::{any::Any, time::{Duration, Instant}};

/// What fires when a timer expires.
pub(crate) enum TimerEntry {
    /// Deliver `message` to the item's `on_message` hook.
    Message {
        target: u64,
        message: Box<dyn Any + Send>,
    },
    /// Scan connections for idle timeouts and re-arm.
    IdleSweep,
}

struct Timer {
    tick: u64,
    entry: TimerEntry,
}

pub(crate) struct Wheel {
    slots: Vec<Vec<Timer>>,
    tick: Duration,
    base: Instant,
    /// Next tick to collect; everything below has already fired.
    cursor: u64,
    pending: usize,
}

impl Wheel {
    pub(crate) fn new(slots: usize, tick: Duration, now: Instant) -> Self {
        assert!(slots > 0 && tick > Duration::ZERO);
        Self {
            slots: (0..slots).map(|_| Vec::new()).collect(),
            tick,
            base: now,
            cursor: 0,
            pending: 0,
        }
    }

    fn tick_of(&self, deadline: Instant) -> u64 {
        let elapsed = deadline.saturating_duration_since(self.base);
        // Round up so an entry never fires early.
        (elapsed.as_nanos().div_ceil(self.tick.as_nanos())) as u64
    }

    pub(crate) fn schedule(&mut self, now: Instant, delay: Duration, entry: TimerEntry) {
        let tick = self.tick_of(now + delay).max(self.cursor);
        let slot = (tick % self.slots.len() as u64) as usize;
        self.slots[slot].push(Timer { tick, entry });
        self.pending += 1;
    }

    /// How long the poll may sleep before the next tick boundary.
    pub(crate) fn poll_timeout(&self, now: Instant, cap: Duration) -> Duration {
        if self.pending == 0 {
            return cap;
        }
        let next_nanos = (self.tick.as_nanos()).saturating_mul(self.cursor as u128 + 1);
        let next = self.base + Duration::from_nanos(next_nanos.min(u64::MAX as u128) as u64);
        next.saturating_duration_since(now).min(cap)
    }

    /// Collects every entry whose tick has elapsed, in tick order.
    pub(crate) fn advance(&mut self, now: Instant) -> Vec<TimerEntry> {
        let current = (now.saturating_duration_since(self.base).as_nanos()
            / self.tick.as_nanos()) as u64;
        let mut fired = Vec::new();
        while self.cursor <= current {
            if self.pending == 0 {
                self.cursor = current + 1;
                break;
            }
            let cursor = self.cursor;
            let slot = (cursor % self.slots.len() as u64) as usize;
            let bucket = &mut self.slots[slot];
            let mut kept = Vec::with_capacity(bucket.len());
            for timer in bucket.drain(..) {
                if timer.tick <= cursor {
                    fired.push(timer);
                } else {
                    kept.push(timer);
                }
            }
            *bucket = kept;
            self.cursor += 1;
        }
        self.pending -= fired.len();
        fired.sort_by_key(|timer| timer.tick);
        fired.into_iter().map(|timer| timer.entry).collect()
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(target: u64) -> TimerEntry {
        TimerEntry::Message {
            target,
            message: Box::new(()),
        }
    }

    fn targets(entries: Vec<TimerEntry>) -> Vec<u64> {
        entries
            .into_iter()
            .map(|entry| match entry {
                TimerEntry::Message { target, .. } => target,
                TimerEntry::IdleSweep => u64::MAX,
            })
            .collect()
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let start = Instant::now();
        let mut wheel = Wheel::new(8, Duration::from_millis(10), start);
        wheel.schedule(start, Duration::from_millis(30), message(3));
        wheel.schedule(start, Duration::from_millis(10), message(1));
        wheel.schedule(start, Duration::from_millis(20), message(2));

        assert!(targets(wheel.advance(start)).is_empty());
        assert_eq!(
            targets(wheel.advance(start + Duration::from_millis(35))),
            vec![1, 2, 3]
        );
        assert_eq!(wheel.pending(), 0);
    }

    #[test]
    fn test_never_fires_early() {
        let start = Instant::now();
        let mut wheel = Wheel::new(8, Duration::from_millis(10), start);
        wheel.schedule(start, Duration::from_millis(25), message(1));

        assert!(targets(wheel.advance(start + Duration::from_millis(20))).is_empty());
        assert_eq!(
            targets(wheel.advance(start + Duration::from_millis(30))),
            vec![1]
        );
    }

    #[test]
    fn test_colliding_slots_keep_distant_entries() {
        let start = Instant::now();
        // Two entries eight ticks apart share a slot in an 8-slot wheel.
        let mut wheel = Wheel::new(8, Duration::from_millis(10), start);
        wheel.schedule(start, Duration::from_millis(10), message(1));
        wheel.schedule(start, Duration::from_millis(90), message(9));

        assert_eq!(
            targets(wheel.advance(start + Duration::from_millis(15))),
            vec![1]
        );
        assert_eq!(wheel.pending(), 1);
        assert_eq!(
            targets(wheel.advance(start + Duration::from_millis(95))),
            vec![9]
        );
    }

    #[test]
    fn test_poll_timeout_bounded_by_next_tick() {
        let start = Instant::now();
        let mut wheel = Wheel::new(8, Duration::from_millis(10), start);
        let cap = Duration::from_millis(100);
        assert_eq!(wheel.poll_timeout(start, cap), cap);

        wheel.schedule(start, Duration::from_millis(50), message(1));
        assert!(wheel.poll_timeout(start, cap) <= Duration::from_millis(10));
    }
}

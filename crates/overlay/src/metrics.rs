//! Overlay metrics collection.
//!
//! Counters for the connection lifecycle and the relay path, plus a latency
//! timer for the outbound handshake. Everything is atomic and can be updated
//! from any task without locking.
//!
//! # Overview
//!
//! - **Attempt metrics**: outbound attempts started, failed, timed out
//! - **Peer metrics**: peers activated and closed, inbound redirects
//! - **Relay metrics**: messages relayed, suppressed and dropped at the hop bound

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counter for simple metrics.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by n.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to 0 and return the previous value.
    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

/// Accumulates durations of one kind of operation.
#[derive(Debug, Default)]
pub struct Timer {
    total_us: AtomicU64,
    count: AtomicU64,
    max_us: AtomicU64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a duration.
    pub fn record(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    /// Record the time elapsed since `start`.
    pub fn record_since(&self, start: Instant) {
        self.record(start.elapsed());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average duration, zero if nothing was recorded.
    pub fn avg(&self) -> Duration {
        match self.count() {
            0 => Duration::ZERO,
            n => Duration::from_micros(self.total_us.load(Ordering::Relaxed) / n),
        }
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_us.load(Ordering::Relaxed))
    }
}

/// Counters for one registry.
#[derive(Debug, Default)]
pub struct OverlayMetrics {
    // Attempts
    pub attempts_started: Counter,
    pub attempts_failed: Counter,
    pub attempts_timed_out: Counter,
    /// Outbound handshake duration, from dial to activation.
    pub handshake_latency: Timer,

    // Peers
    pub peers_activated: Counter,
    pub peers_closed: Counter,
    pub inbound_redirected: Counter,

    // Relay
    pub messages_received: Counter,
    pub messages_relayed: Counter,
    pub messages_suppressed: Counter,
    pub messages_hop_dropped: Counter,
}

impl OverlayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> OverlayMetricsSnapshot {
        OverlayMetricsSnapshot {
            attempts_started: self.attempts_started.get(),
            attempts_failed: self.attempts_failed.get(),
            attempts_timed_out: self.attempts_timed_out.get(),
            handshake_count: self.handshake_latency.count(),
            handshake_avg: self.handshake_latency.avg(),
            handshake_max: self.handshake_latency.max(),
            peers_activated: self.peers_activated.get(),
            peers_closed: self.peers_closed.get(),
            inbound_redirected: self.inbound_redirected.get(),
            messages_received: self.messages_received.get(),
            messages_relayed: self.messages_relayed.get(),
            messages_suppressed: self.messages_suppressed.get(),
            messages_hop_dropped: self.messages_hop_dropped.get(),
        }
    }
}

/// Point-in-time copy of [`OverlayMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayMetricsSnapshot {
    pub attempts_started: u64,
    pub attempts_failed: u64,
    pub attempts_timed_out: u64,
    pub handshake_count: u64,
    pub handshake_avg: Duration,
    pub handshake_max: Duration,
    pub peers_activated: u64,
    pub peers_closed: u64,
    pub inbound_redirected: u64,
    pub messages_received: u64,
    pub messages_relayed: u64,
    pub messages_suppressed: u64,
    pub messages_hop_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(5);
        assert_eq!(counter.get(), 6);

        let prev = counter.reset();
        assert_eq!(prev, 6);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_counter_concurrent() {
        let counter = Counter::new();
        let counter_ref = &counter;

        thread::scope(|s| {
            for _ in 0..10 {
                s.spawn(|| {
                    for _ in 0..100 {
                        counter_ref.inc();
                    }
                });
            }
        });

        assert_eq!(counter.get(), 1000);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        assert_eq!(timer.avg(), Duration::ZERO);

        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(30));
        assert_eq!(timer.count(), 2);
        assert_eq!(timer.avg(), Duration::from_millis(20));
        assert_eq!(timer.max(), Duration::from_millis(30));
    }

    #[test]
    fn test_snapshot() {
        let metrics = OverlayMetrics::new();
        metrics.attempts_started.add(3);
        metrics.messages_suppressed.inc();

        let snap = metrics.snapshot();
        assert_eq!(snap.attempts_started, 3);
        assert_eq!(snap.messages_suppressed, 1);
        assert_eq!(snap.peers_activated, 0);
    }
}

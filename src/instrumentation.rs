//! Per-destination relay counters.
//!
//! Counter names follow the carbon convention
//! `destinations.<host_port_instance>.<counter>` so they can be fed back
//! into the relay as internal metrics. All counters are plain monotonic
//! adds; wrap-around at 64 bits is acceptable.

use crate::metric::Destination;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept for one destination session.
#[derive(Debug, Default)]
pub struct DestinationCounters {
    destination: String,
    /// Datapoints offered to this destination, dropped or not.
    pub attempted_relays: AtomicU64,
    /// Datapoints serialized into frames handed to the transport.
    pub sent: AtomicU64,
    /// Datapoints dropped because the send queue was at capacity.
    pub full_queue_drops: AtomicU64,
    /// Datapoints queued while the session had no live connection.
    pub queued_until_connected: AtomicU64,
    /// Datapoints queued while the transport was not accepting writes.
    pub queued_until_ready: AtomicU64,
}

impl DestinationCounters {
    pub fn new(destination: &Destination) -> Self {
        Self {
            destination: destination.counter_name(),
            ..Default::default()
        }
    }

    /// Counter-namespace segment for this destination.
    pub fn destination_name(&self) -> &str {
        &self.destination
    }

    pub fn add_attempted_relays(&self, n: u64) {
        self.attempted_relays.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_full_queue_drops(&self, n: u64) {
        self.full_queue_drops.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_queued_until_connected(&self, n: u64) {
        self.queued_until_connected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_queued_until_ready(&self, n: u64) {
        self.queued_until_ready.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot as fully-qualified `(name, value)` pairs.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let name = |counter: &str| format!("destinations.{}.{}", self.destination, counter);
        vec![
            (
                name("attemptedRelays"),
                self.attempted_relays.load(Ordering::Relaxed),
            ),
            (name("sent"), self.sent.load(Ordering::Relaxed)),
            (
                name("fullQueueDrops"),
                self.full_queue_drops.load(Ordering::Relaxed),
            ),
            (
                name("queuedUntilConnected"),
                self.queued_until_connected.load(Ordering::Relaxed),
            ),
            (
                name("queuedUntilReady"),
                self.queued_until_ready.load(Ordering::Relaxed),
            ),
        ]
    }
}

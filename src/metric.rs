//! Core data model shared by the forwarding and storage paths.
//!
//! A metric is a dotted byte-string path, optionally carrying `;tag=value`
//! pairs. The forwarding path passes metric names verbatim to the wire;
//! only the storage plugins apply [`tag_encode`] to derive a
//! filesystem-safe representation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A metric path as received from the ingest layer.
pub type MetricName = String;

/// A single observation for a metric: epoch seconds plus a float value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    /// Timestamp in whole seconds since the epoch.
    pub timestamp: u64,
    /// Observed value.
    pub value: f64,
}

impl Datapoint {
    pub fn new(timestamp: u64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// One downstream carbon endpoint.
///
/// The triple is the session map key; its textual form (with `.` replaced
/// by `_`) names the per-destination counter namespace, see
/// [`crate::instrumentation`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    /// Carbon instance label, used to tell apart multiple daemons on one host.
    pub instance: String,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, instance: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            instance: instance.into(),
        }
    }

    /// `host:port` form handed to the connector.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Counter-namespace form: `host:port:instance` with `.` and `:`
    /// flattened to `_` so the name nests under `destinations.`.
    pub fn counter_name(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.instance).replace(['.', ':'], "_")
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.instance)
    }
}

/// Deterministic, filesystem-safe encoding of a possibly tag-bearing
/// metric name.
///
/// Untagged names pass through unchanged. Tagged series (anything with a
/// `;` in it) are sharded under a `_tagged` prefix by the first hex digits
/// of a stable digest of the full series name, with literal dots in the
/// name escaped so they cannot introduce extra path components.
pub fn tag_encode(metric: &str, sep: &str) -> String {
    if !metric.contains(';') {
        return metric.to_string();
    }
    let digest = format!("{:016x}", fnv1a64(metric.as_bytes()));
    [
        "_tagged",
        &digest[0..3],
        &digest[3..6],
        &metric.replace('.', "_DOT_"),
    ]
    .join(sep)
}

// 64-bit FNV-1a. Stable across platforms and releases, which the on-disk
// layout depends on.
fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

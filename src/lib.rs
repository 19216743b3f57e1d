//! # Carbon Relay Core
//!
//! The metric forwarding client core of a carbon-style telemetry relay.
//! This library accepts streams of `(metric, datapoint)` tuples from an
//! upstream ingest path and delivers them to downstream carbon daemons
//! over persistent TCP connections, with bounded per-destination
//! buffering, automatic reconnection, pickle-batch framing, and
//! end-to-end flow control back to the ingest layer.
//!
//! The surrounding daemon supplies the pieces this crate consumes: the
//! line-protocol receiver, the [`client::Router`] that maps metric names
//! to destinations, configuration parsing, and process supervision.
//!
//! A parallel writer path persists datapoints through the
//! [`storage::TimeSeriesDatabase`] plugin interface; the forwarding core
//! itself never touches disk.

pub mod client;
pub mod codec;
pub mod config;
pub mod flow;
pub mod instrumentation;
pub mod metric;
pub mod signal;
pub mod storage;

pub use client::{
    ClientManager, ClientSession, ConnectOutcome, Connector, ReconnectPolicy, Router,
    SessionState, StopReason, TcpConnector, Transport,
};
pub use config::Settings;
pub use flow::{FlowControl, FlowControlEvent};
pub use instrumentation::DestinationCounters;
pub use metric::{Datapoint, Destination, MetricName};
pub use storage::{StorageError, TimeSeriesDatabase};

/// The current version of the relay core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Hard cap on each destination's send queue.
    pub const MAX_QUEUE_SIZE: usize = 10_000;

    /// Largest batch serialized into one frame.
    pub const MAX_DATAPOINTS_PER_MESSAGE: usize = 500;

    /// Fraction of the queue cap below which paused ingest is resumed.
    pub const QUEUE_LOW_WATERMARK_RATIO: f64 = 0.8;

    /// Ceiling on the reconnect backoff delay.
    pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

    /// Base URL of the graphite web app.
    pub const GRAPHITE_URL: &str = "http://127.0.0.1:8080";

    /// Root directory for on-disk time series databases.
    pub const LOCAL_DATA_DIR: &str = "/opt/graphite/storage/whisper";

    /// Largest ceres slice gap bridged by padding, in slots.
    pub const CERES_MAX_SLICE_GAP: u64 = 80;
}

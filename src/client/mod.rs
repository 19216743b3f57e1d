//! # Carbon Client Sessions
//!
//! Everything needed to forward datapoints to downstream carbon daemons:
//! one auto-reconnecting [`ClientSession`] per destination, a
//! [`ClientManager`] that owns the session set and fans incoming
//! datapoints out according to a [`Router`], and the transport seam the
//! sessions write through.
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌────────────────┐    ┌─────────────────┐    ┌──────────────────┐
//! │ ClientManager  │───▶│  ClientSession  │───▶│ Connector /      │
//! │ (router fanout)│    │  (queue, state) │    │ Transport (TCP)  │
//! └────────────────┘    └─────────────────┘    └──────────────────┘
//! ```
//!
//! The session never talks TCP directly; it drives a boxed [`Transport`]
//! obtained from a [`Connector`]. That seam is what the reconnect loop
//! retries, what backpressure is signalled through, and what tests swap
//! for a scripted in-memory implementation.

use crate::metric::Destination;
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

pub mod manager;
pub mod queue;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::ClientManager;
pub use session::{ClientSession, SessionState};

/// Routing policy consumed by the manager.
///
/// Implemented by the surrounding daemon; the manager only calls it. The
/// destination set returned for a metric must be stable between
/// `add_destination` / `remove_destination` mutations.
pub trait Router: Send + Sync {
    fn add_destination(&self, destination: &Destination);
    fn remove_destination(&self, destination: &Destination);
    fn destinations(&self, metric: &str) -> Vec<Destination>;
}

/// One live connection to a carbon daemon.
///
/// A frame handed to [`write_frame`](Transport::write_frame) is written
/// whole; the call suspends while the peer applies backpressure. The
/// [`writable`](Transport::writable) watch is the producer pause/resume
/// signal: transports that can observe peer pressure ahead of a write
/// flip it to `false`, and the session then queues instead of writing.
/// The TCP transport reports always-writable and lets kernel
/// backpressure suspend the write itself.
#[async_trait]
pub trait Transport: Send {
    /// Write one complete frame.
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Producer signal: `false` while the peer is not draining.
    fn writable(&self) -> watch::Receiver<bool>;

    /// Cleanly shut the connection down.
    async fn close(&mut self) -> io::Result<()>;
}

/// Factory for [`Transport`]s, invoked by the session's reconnect loop.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, destination: &Destination) -> io::Result<Box<dyn Transport>>;
}

/// Plain TCP connector with the usual low-latency socket options.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub nodelay: bool,
    pub send_buffer_size: Option<usize>,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            nodelay: true,
            send_buffer_size: None,
        }
    }
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, destination: &Destination) -> io::Result<Box<dyn Transport>> {
        debug!("connecting to {}", destination.addr());
        let stream = TcpStream::connect((destination.host.as_str(), destination.port)).await?;

        // Apply socket options through socket2; tokio only exposes nodelay.
        let std_stream = stream.into_std()?;
        let socket = socket2::Socket::from(std_stream.try_clone()?);
        socket.set_nodelay(self.nodelay)?;
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        let stream = TcpStream::from_std(std_stream)?;

        Ok(Box::new(TcpTransport::new(stream)))
    }
}

/// [`Transport`] over a connected TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
    writable_tx: watch::Sender<bool>,
    writable_rx: watch::Receiver<bool>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let (writable_tx, writable_rx) = watch::channel(true);
        Self {
            stream,
            writable_tx,
            writable_rx,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }

    fn writable(&self) -> watch::Receiver<bool> {
        self.writable_rx.clone()
    }

    async fn close(&mut self) -> io::Result<()> {
        let _ = self.writable_tx.send(false);
        self.stream.shutdown().await
    }
}

/// Reconnect tuning for a session's connector.
///
/// Delays grow geometrically from `initial_delay` up to `max_delay`, with
/// a small random jitter so a fleet of relays does not thunder back in
/// lockstep. The backoff resets after a successful connect and after a
/// connection loss.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay used as symmetric jitter.
    pub jitter: f64,
    /// Per-attempt cap on how long a connect may hang.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: crate::defaults::MAX_RECONNECT_DELAY,
            factor: 2.0,
            jitter: 0.1,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Backoff schedule state for one session.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.policy.connect_timeout
    }

    /// Next delay in the schedule, jittered.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = match self.current {
            None => self.policy.initial_delay,
            Some(previous) => self
                .policy
                .max_delay
                .min(previous.mul_f64(self.policy.factor)),
        };
        self.current = Some(base);
        if self.policy.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-1.0..=1.0) * self.policy.jitter;
            base.mul_f64(1.0 + spread)
        } else {
            base
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

/// Result of a session's first connect attempt, as observed through
/// [`ClientManager::start_client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed(String),
}

/// Why a session's disconnect completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Queue drained (or was already empty) and the transport closed.
    Drained,
    /// A connect attempt failed while stopping; the backlog was abandoned.
    ConnectFailed,
}

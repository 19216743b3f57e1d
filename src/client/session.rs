//! One client session per destination.
//!
//! A session owns everything for a single downstream daemon: the bounded
//! send queue, the reconnecting connector, the live transport, and the
//! per-destination counters. All of that mutable state is confined to one
//! spawned actor task; the [`ClientSession`] handle is a thin command
//! sender, so `send` never blocks the ingest caller.
//!
//! Lifecycle: `Idle` until `start_connecting`, then
//! `Connecting → Writable ↔ Paused`, back to `Connecting` on connection
//! loss, and `Closing → Closed` once `disconnect` has drained the queue
//! (or a connect attempt failed while stopping).

use super::queue::SendQueue;
use super::{Backoff, Connector, ReconnectPolicy, StopReason, Transport};
use crate::codec;
use crate::config::Settings;
use crate::flow::FlowControl;
use crate::instrumentation::DestinationCounters;
use crate::metric::{Datapoint, Destination, MetricName};
use crate::signal::{OneShot, Subscription};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Observable lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet asked to connect.
    Idle,
    /// No live transport; an attempt or a backoff delay is in progress.
    Connecting,
    /// Connected and accepting writes.
    Writable,
    /// Connected but the transport is not draining.
    Paused,
    /// Disconnect requested; draining and shutting down.
    Closing,
    /// Fully stopped.
    Closed,
}

/// Session event signals. Each is single-delivery and resets after firing,
/// so waiters always observe the next occurrence.
#[derive(Debug, Default)]
pub(crate) struct SessionEvents {
    pub connection_made: OneShot<()>,
    pub connect_failed: OneShot<String>,
    pub connection_lost: OneShot<()>,
    pub queue_empty: OneShot<()>,
}

/// Per-session slice of the relay settings.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub max_queue_size: usize,
    pub max_datapoints_per_message: usize,
    pub use_flow_control: bool,
    pub low_watermark: usize,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            max_queue_size: settings.max_queue_size,
            max_datapoints_per_message: settings.max_datapoints_per_message,
            use_flow_control: settings.use_flow_control,
            low_watermark: settings.low_watermark(),
            reconnect: settings.reconnect.clone(),
        }
    }
}

enum Command {
    Send {
        metric: MetricName,
        datapoint: Datapoint,
    },
    StartConnecting,
    Disconnect {
        done: oneshot::Sender<StopReason>,
    },
}

/// Handle to one destination's session actor.
///
/// Cheap to use from the ingest path: every method enqueues a command and
/// returns immediately. Dropping the last handle without calling
/// [`disconnect`](ClientSession::disconnect) shuts the actor down and
/// abandons any queued datapoints.
pub struct ClientSession {
    destination: Destination,
    counters: Arc<DestinationCounters>,
    events: Arc<SessionEvents>,
    state_rx: watch::Receiver<SessionState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ClientSession {
    pub(crate) fn spawn(
        destination: Destination,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        flow: Arc<FlowControl>,
    ) -> Self {
        let counters = Arc::new(DestinationCounters::new(&destination));
        let events = Arc::new(SessionEvents::default());
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let backoff = Backoff::new(config.reconnect.clone());
        let task = SessionTask {
            destination: destination.clone(),
            config,
            connector,
            flow,
            counters: counters.clone(),
            events: events.clone(),
            state_tx,
            queue: SendQueue::new(),
            backoff,
            started: false,
            closing: None,
            finished: false,
        };
        tokio::spawn(task.run(cmd_rx));

        Self {
            destination,
            counters,
            events,
            state_rx,
            cmd_tx,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn counters(&self) -> Arc<DestinationCounters> {
        self.counters.clone()
    }

    /// Watch the session lifecycle.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Offer one datapoint to this destination. Never blocks.
    pub fn send(&self, metric: MetricName, datapoint: Datapoint) {
        let _ = self.cmd_tx.send(Command::Send { metric, datapoint });
    }

    /// Begin connecting. Idempotent.
    pub fn start_connecting(&self) {
        let _ = self.cmd_tx.send(Command::StartConnecting);
    }

    /// Next `connectionMade` occurrence.
    pub fn when_connected(&self) -> Subscription<()> {
        self.events.connection_made.subscribe()
    }

    /// Next failed connect attempt, carrying the reason.
    pub fn when_connect_failed(&self) -> Subscription<String> {
        self.events.connect_failed.subscribe()
    }

    /// Next loss of a live connection.
    pub fn when_connection_lost(&self) -> Subscription<()> {
        self.events.connection_lost.subscribe()
    }

    /// Next transition of the send queue from non-empty to empty.
    pub fn when_queue_empty(&self) -> Subscription<()> {
        self.events.queue_empty.subscribe()
    }

    /// Stop the session. Resolves once the queue has drained and the
    /// transport is closed, or once a connect attempt failed while
    /// stopping (abandoning the backlog). Reconnect attempts already in
    /// flight with an empty queue are cancelled eagerly.
    pub fn disconnect(self) -> impl Future<Output = StopReason> {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self
            .cmd_tx
            .send(Command::Disconnect { done: done_tx })
            .is_ok();
        async move {
            if !sent {
                return StopReason::Drained;
            }
            done_rx.await.unwrap_or(StopReason::Drained)
        }
    }
}

impl fmt::Display for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSession({})", self.destination)
    }
}

/// Connection phase owned by the actor.
enum Phase {
    Idle,
    Backoff {
        sleep: Pin<Box<tokio::time::Sleep>>,
    },
    Connecting {
        attempt: Pin<Box<dyn Future<Output = io::Result<Box<dyn Transport>>> + Send>>,
    },
    Connected {
        transport: Box<dyn Transport>,
        writable: watch::Receiver<bool>,
    },
}

enum Event {
    Command(Option<Command>),
    ConnectFinished(io::Result<Box<dyn Transport>>),
    BackoffElapsed,
    WritabilityChanged,
    WritabilityClosed,
}

struct SessionTask {
    destination: Destination,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    flow: Arc<FlowControl>,
    counters: Arc<DestinationCounters>,
    events: Arc<SessionEvents>,
    state_tx: watch::Sender<SessionState>,
    queue: SendQueue,
    backoff: Backoff,
    started: bool,
    closing: Option<oneshot::Sender<StopReason>>,
    finished: bool,
}

async fn next_command(
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    open: bool,
) -> Option<Command> {
    if open {
        cmd_rx.recv().await
    } else {
        std::future::pending().await
    }
}

impl SessionTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut phase = Phase::Idle;
        let mut cmd_open = true;

        loop {
            if self.finished {
                break;
            }
            if !cmd_open {
                // No handles left. Without a pending disconnect there is
                // nothing more anyone can ask of this session.
                if self.closing.is_none() {
                    break;
                }
                if matches!(phase, Phase::Idle) {
                    self.finish(StopReason::Drained);
                    break;
                }
            }

            let event = match &mut phase {
                Phase::Idle => Event::Command(cmd_rx.recv().await),
                Phase::Backoff { sleep } => tokio::select! {
                    cmd = next_command(&mut cmd_rx, cmd_open) => Event::Command(cmd),
                    () = sleep.as_mut() => Event::BackoffElapsed,
                },
                Phase::Connecting { attempt } => tokio::select! {
                    cmd = next_command(&mut cmd_rx, cmd_open) => Event::Command(cmd),
                    result = attempt.as_mut() => Event::ConnectFinished(result),
                },
                Phase::Connected { writable, .. } => tokio::select! {
                    cmd = next_command(&mut cmd_rx, cmd_open) => Event::Command(cmd),
                    changed = writable.changed() => match changed {
                        Ok(()) => Event::WritabilityChanged,
                        Err(_) => Event::WritabilityClosed,
                    },
                },
            };

            match event {
                Event::Command(None) => {
                    cmd_open = false;
                    if self.closing.is_none() {
                        debug!("{} handles dropped, shutting down", self.destination);
                        if let Phase::Connected { transport, .. } = &mut phase {
                            let _ = transport.close().await;
                        }
                        self.set_state(SessionState::Closed);
                        break;
                    }
                }
                Event::Command(Some(Command::StartConnecting)) => {
                    self.on_start_connecting(&mut phase);
                }
                Event::Command(Some(Command::Send { metric, datapoint })) => {
                    self.on_send(metric, datapoint, &mut phase).await;
                }
                Event::Command(Some(Command::Disconnect { done })) => {
                    self.on_disconnect(done, &mut phase).await;
                }
                Event::ConnectFinished(Ok(transport)) => {
                    self.on_connected(transport, &mut phase).await;
                }
                Event::ConnectFinished(Err(err)) => {
                    self.on_connect_failed(err, &mut phase);
                }
                Event::BackoffElapsed => {
                    self.start_attempt(&mut phase);
                }
                Event::WritabilityChanged => {
                    self.on_writability(&mut phase).await;
                }
                Event::WritabilityClosed => {
                    let err = io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "transport writability signal closed",
                    );
                    self.handle_connection_lost(err, &mut phase);
                }
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    fn on_start_connecting(&mut self, phase: &mut Phase) {
        if self.started {
            return;
        }
        self.started = true;
        info!("connecting to carbon daemon at {}", self.destination);
        self.start_attempt(phase);
    }

    fn start_attempt(&mut self, phase: &mut Phase) {
        if self.closing.is_none() {
            self.set_state(SessionState::Connecting);
        }
        let connector = self.connector.clone();
        let destination = self.destination.clone();
        let connect_timeout = self.backoff.connect_timeout();
        *phase = Phase::Connecting {
            attempt: Box::pin(async move {
                match tokio::time::timeout(connect_timeout, connector.connect(&destination)).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect attempt timed out",
                    )),
                }
            }),
        };
    }

    async fn on_send(&mut self, metric: MetricName, datapoint: Datapoint, phase: &mut Phase) {
        self.counters.add_attempted_relays(1);

        // Drop the newest datapoint at the cap; the queued backlog and the
        // cost already paid for it are preserved.
        if self.queue.len() >= self.config.max_queue_size {
            debug!("{} send queue full, dropping datapoint", self.destination);
            self.counters.add_full_queue_drops(1);
            return;
        }

        let connected_and_writable = match &*phase {
            Phase::Connected { writable, .. } => Some(*writable.borrow()),
            _ => None,
        };
        match connected_and_writable {
            None => {
                self.queue.push(metric, datapoint);
                self.counters.add_queued_until_connected(1);
                self.after_enqueue();
            }
            Some(false) => {
                self.queue.push(metric, datapoint);
                self.counters.add_queued_until_ready(1);
                self.after_enqueue();
            }
            Some(true) if !self.queue.is_empty() => {
                // Enqueue behind the backlog, then drain; FIFO is preserved
                // across the direct/queued interleaving.
                self.queue.push(metric, datapoint);
                self.after_enqueue();
                self.drain_connected(phase).await;
            }
            Some(true) => {
                self.direct_send(metric, datapoint, phase).await;
            }
        }
    }

    async fn direct_send(&mut self, metric: MetricName, datapoint: Datapoint, phase: &mut Phase) {
        let batch = vec![(metric, datapoint)];
        let frame = match codec::encode_batch(&batch) {
            Ok(frame) => frame,
            Err(err) => {
                error!("{} failed to serialize datapoint: {}", self.destination, err);
                return;
            }
        };
        let result = match phase {
            Phase::Connected { transport, .. } => transport.write_frame(&frame).await,
            _ => return,
        };
        match result {
            Ok(()) => self.counters.add_sent(1),
            Err(err) => self.handle_connection_lost(err, phase),
        }
    }

    async fn drain_connected(&mut self, phase: &mut Phase) {
        let result = match phase {
            Phase::Connected {
                transport,
                writable,
            } => self.drain(transport, writable).await,
            _ => return,
        };
        if let Err(err) = result {
            self.handle_connection_lost(err, phase);
        }
    }

    /// Write queued batches while the transport stays writable.
    async fn drain(
        &mut self,
        transport: &mut Box<dyn Transport>,
        writable: &watch::Receiver<bool>,
    ) -> io::Result<()> {
        while *writable.borrow() && !self.queue.is_empty() {
            let batch = self.queue.take_batch(self.config.max_datapoints_per_message);
            let frame = match codec::encode_batch(&batch) {
                Ok(frame) => frame,
                Err(err) => {
                    error!(
                        "{} failed to serialize batch of {}: {}",
                        self.destination,
                        batch.len(),
                        err
                    );
                    continue;
                }
            };
            transport.write_frame(&frame).await?;
            self.counters.add_sent(batch.len() as u64);
            if self.queue.is_empty() {
                self.events.queue_empty.fire(());
            }
            self.maybe_resume_receivers();
        }
        Ok(())
    }

    async fn on_connected(&mut self, transport: Box<dyn Transport>, phase: &mut Phase) {
        info!("{} connection made", self.destination);
        self.backoff.reset();
        let writable = transport.writable();
        *phase = Phase::Connected {
            transport,
            writable,
        };
        self.events.connection_made.fire(());
        self.update_connected_state(phase);
        self.drain_connected(phase).await;
        self.try_finish_closing(phase).await;
    }

    fn on_connect_failed(&mut self, err: io::Error, phase: &mut Phase) {
        let reason = err.to_string();
        debug!("{} connect attempt failed: {}", self.destination, reason);
        self.events.connect_failed.fire(reason);
        if self.closing.is_some() {
            // Stopping: give up on the backlog rather than retry forever.
            *phase = Phase::Idle;
            self.finish(StopReason::ConnectFailed);
            return;
        }
        let delay = self.backoff.next_delay();
        debug!("{} retrying in {:?}", self.destination, delay);
        *phase = Phase::Backoff {
            sleep: Box::pin(tokio::time::sleep(delay)),
        };
    }

    fn handle_connection_lost(&mut self, err: io::Error, phase: &mut Phase) {
        warn!("{} connection lost: {}", self.destination, err);
        self.events.connection_lost.fire(());
        self.backoff.reset();
        if self.closing.is_some() && self.queue.is_empty() {
            *phase = Phase::Idle;
            self.finish(StopReason::Drained);
            return;
        }
        if self.closing.is_none() {
            self.set_state(SessionState::Connecting);
        }
        let delay = self.backoff.next_delay();
        *phase = Phase::Backoff {
            sleep: Box::pin(tokio::time::sleep(delay)),
        };
    }

    async fn on_writability(&mut self, phase: &mut Phase) {
        let writable_now = match phase {
            Phase::Connected { writable, .. } => *writable.borrow(),
            _ => return,
        };
        self.update_connected_state(phase);
        if writable_now {
            self.drain_connected(phase).await;
            self.try_finish_closing(phase).await;
        }
    }

    async fn on_disconnect(&mut self, done: oneshot::Sender<StopReason>, phase: &mut Phase) {
        if self.closing.is_some() {
            // A second disconnect; the dropped sender resolves as drained.
            return;
        }
        debug!("{} disconnecting", self.destination);
        self.closing = Some(done);
        self.set_state(SessionState::Closing);
        self.drain_connected(phase).await;
        self.try_finish_closing(phase).await;
    }

    /// Complete a pending disconnect once the queue is empty. An in-flight
    /// connect attempt with no pending data is cancelled here by dropping
    /// it; with data still queued the session keeps connecting so the
    /// backlog gets a chance to flush.
    async fn try_finish_closing(&mut self, phase: &mut Phase) {
        if self.closing.is_none() || !self.queue.is_empty() {
            return;
        }
        if let Phase::Connected { transport, .. } = phase {
            if let Err(err) = transport.close().await {
                debug!("{} error closing transport: {}", self.destination, err);
            }
        }
        *phase = Phase::Idle;
        self.finish(StopReason::Drained);
    }

    fn finish(&mut self, reason: StopReason) {
        if let Some(done) = self.closing.take() {
            let _ = done.send(reason);
        }
        self.set_state(SessionState::Closed);
        self.finished = true;
        info!("{} stopped", self.destination);
    }

    fn update_connected_state(&self, phase: &Phase) {
        if self.closing.is_some() {
            self.set_state(SessionState::Closing);
            return;
        }
        if let Phase::Connected { writable, .. } = phase {
            self.set_state(if *writable.borrow() {
                SessionState::Writable
            } else {
                SessionState::Paused
            });
        }
    }

    fn after_enqueue(&self) {
        if self.config.use_flow_control && self.queue.len() >= self.config.max_queue_size {
            self.flow.pause_receiving();
        }
    }

    fn maybe_resume_receivers(&self) {
        if self.config.use_flow_control
            && self.flow.receivers_paused()
            && self.queue.len() < self.config.low_watermark
        {
            self.flow.resume_receiving();
        }
    }
}

//! Session set management and datapoint fan-out.
//!
//! The [`ClientManager`] owns one [`ClientSession`] per destination and is
//! the only writer of that map. Incoming datapoints are routed through the
//! [`Router`] and offered to every selected session; the manager never
//! merges, deduplicates, or blocks the caller.

use super::session::{SessionConfig, SessionState};
use super::{ClientSession, ConnectOutcome, Connector, Router, StopReason, TcpConnector};
use crate::config::Settings;
use crate::flow::FlowControl;
use crate::instrumentation::DestinationCounters;
use crate::metric::{Datapoint, Destination};
use crate::signal::Subscription;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct ClientManager {
    router: Arc<dyn Router>,
    session_config: SessionConfig,
    connector: Arc<dyn Connector>,
    flow: Arc<FlowControl>,
    sessions: HashMap<Destination, ClientSession>,
    running: bool,
}

impl ClientManager {
    /// Manager forwarding over plain TCP.
    pub fn new(router: Arc<dyn Router>, settings: &Settings) -> Self {
        Self::with_connector(router, settings, Arc::new(TcpConnector::new()))
    }

    /// Manager with a custom transport seam.
    pub fn with_connector(
        router: Arc<dyn Router>,
        settings: &Settings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            router,
            session_config: SessionConfig::from_settings(settings),
            connector,
            flow: Arc::new(FlowControl::new()),
            sessions: HashMap::new(),
            running: false,
        }
    }

    /// The pause/resume surface the ingest layer should subscribe to.
    pub fn flow_control(&self) -> Arc<FlowControl> {
        self.flow.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start the service: all registered sessions begin connecting, and
    /// sessions registered later connect as soon as they are created.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        info!("client manager starting, {} destination(s)", self.sessions.len());
        for session in self.sessions.values() {
            session.start_connecting();
        }
    }

    /// Stop the service, draining and tearing down every session.
    pub async fn stop(&mut self) {
        self.running = false;
        self.stop_all_clients().await;
        info!("client manager stopped");
    }

    /// Register a destination and create its session. Idempotent: returns
    /// `None` when the destination is already registered. The returned
    /// future resolves on the first of `connectionMade` or
    /// `connectFailed` for the new session.
    pub fn start_client(
        &mut self,
        destination: Destination,
    ) -> Option<impl Future<Output = ConnectOutcome>> {
        if self.sessions.contains_key(&destination) {
            return None;
        }
        info!("connecting to carbon daemon at {}", destination);
        self.router.add_destination(&destination);

        let session = ClientSession::spawn(
            destination.clone(),
            self.session_config.clone(),
            self.connector.clone(),
            self.flow.clone(),
        );
        // Subscribe before connecting so the first occurrence cannot be
        // missed.
        let made = session.when_connected();
        let failed = session.when_connect_failed();
        if self.running {
            session.start_connecting();
        }
        self.sessions.insert(destination, session);

        Some(async move {
            tokio::select! {
                outcome = made => match outcome {
                    Some(()) => ConnectOutcome::Connected,
                    None => ConnectOutcome::Failed("session stopped".to_string()),
                },
                outcome = failed => match outcome {
                    Some(reason) => ConnectOutcome::Failed(reason),
                    None => ConnectOutcome::Failed("session stopped".to_string()),
                },
            }
        })
    }

    /// Deregister a destination and stop its session. The returned future
    /// resolves once the session has fully stopped; `None` if the
    /// destination was not registered.
    pub fn stop_client(
        &mut self,
        destination: &Destination,
    ) -> Option<impl Future<Output = StopReason>> {
        let session = self.sessions.remove(destination)?;
        self.router.remove_destination(destination);
        let destination = destination.clone();
        let stopping = session.disconnect();
        Some(async move {
            let reason = stopping.await;
            debug!("client for {} stopped: {:?}", destination, reason);
            reason
        })
    }

    /// Stop every session; resolves once all of them have settled. The
    /// disconnects are issued up front so the sessions wind down in
    /// parallel.
    pub async fn stop_all_clients(&mut self) {
        let destinations: Vec<Destination> = self.sessions.keys().cloned().collect();
        let mut pending = Vec::with_capacity(destinations.len());
        for destination in destinations {
            if let Some(stopping) = self.stop_client(&destination) {
                pending.push(stopping);
            }
        }
        for stopping in pending {
            stopping.await;
        }
    }

    /// Route one datapoint to every destination the router selects.
    pub fn send_datapoint(&self, metric: &str, datapoint: Datapoint) {
        for destination in self.router.destinations(metric) {
            match self.sessions.get(&destination) {
                Some(session) => session.send(metric.to_string(), datapoint),
                None => debug!("no client registered for destination {}", destination),
            }
        }
    }

    /// One-shot signal for the next time this destination's queue drains.
    pub fn when_client_queue_empty(&self, destination: &Destination) -> Option<Subscription<()>> {
        self.sessions
            .get(destination)
            .map(ClientSession::when_queue_empty)
    }

    pub fn counters(&self, destination: &Destination) -> Option<Arc<DestinationCounters>> {
        self.sessions.get(destination).map(ClientSession::counters)
    }

    /// Snapshot of every destination counter, fully qualified.
    pub fn counter_snapshot(&self) -> Vec<(String, u64)> {
        self.sessions
            .values()
            .flat_map(|session| session.counters().snapshot())
            .collect()
    }

    pub fn session_state(&self, destination: &Destination) -> Option<watch::Receiver<SessionState>> {
        self.sessions.get(destination).map(ClientSession::state)
    }
}

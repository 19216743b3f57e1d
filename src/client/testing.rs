//! Scripted connector and transport doubles for session and manager tests.
//!
//! `MockConnector` hands out `MockTransport`s wired to a per-destination
//! `MockWire` that records every frame, exposes a controllable writability
//! signal, and can inject write failures. Connect attempts can be gated
//! (endpoint down) or scripted to fail.

use super::{Connector, Transport};
use crate::metric::Destination;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

/// Recorded endpoint state shared by every connection to one destination.
pub(crate) struct MockWire {
    frames: Mutex<Vec<Vec<u8>>>,
    writable_tx: watch::Sender<bool>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

impl MockWire {
    fn new(writable: bool) -> Arc<Self> {
        let (writable_tx, _) = watch::channel(writable);
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            writable_tx,
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Flip the producer pause/resume signal.
    pub(crate) fn set_writable(&self, writable: bool) {
        let _ = self.writable_tx.send(writable);
    }

    pub(crate) fn fail_next_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` frames have been written.
    pub(crate) async fn wait_for_frames(&self, n: usize) -> Vec<Vec<u8>> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frames = self.frames();
                if frames.len() >= n {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for frames")
    }
}

pub(crate) struct MockTransport {
    wire: Arc<MockWire>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        // Honor the pause signal even if the caller raced past it.
        let mut writable = self.wire.writable_tx.subscribe();
        while !*writable.borrow() {
            writable
                .changed()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "wire torn down"))?;
        }
        if self.wire.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected write failure",
            ));
        }
        self.wire.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn writable(&self) -> watch::Receiver<bool> {
        self.wire.writable_tx.subscribe()
    }

    async fn close(&mut self) -> io::Result<()> {
        self.wire.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted [`Connector`].
pub(crate) struct MockConnector {
    wires: Mutex<HashMap<Destination, Arc<MockWire>>>,
    start_writable: bool,
    permits: Semaphore,
    fail_attempts: AtomicUsize,
    pub(crate) attempts: AtomicUsize,
}

impl MockConnector {
    /// Connects immediately; wires start with the given writability.
    pub(crate) fn new(start_writable: bool) -> Arc<Self> {
        Arc::new(Self {
            wires: Mutex::new(HashMap::new()),
            start_writable,
            permits: Semaphore::new(Semaphore::MAX_PERMITS),
            fail_attempts: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Endpoint starts down: connects hang until [`release`](Self::release).
    pub(crate) fn gated(start_writable: bool) -> Arc<Self> {
        Arc::new(Self {
            wires: Mutex::new(HashMap::new()),
            start_writable,
            permits: Semaphore::new(0),
            fail_attempts: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        })
    }

    /// The first `n` attempts are refused, later ones connect immediately.
    pub(crate) fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self {
            wires: Mutex::new(HashMap::new()),
            start_writable: true,
            permits: Semaphore::new(Semaphore::MAX_PERMITS),
            fail_attempts: AtomicUsize::new(n),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Let `n` gated connects proceed.
    pub(crate) fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Endpoint state for a destination, created on first use.
    pub(crate) fn wire(&self, destination: &Destination) -> Arc<MockWire> {
        self.wires
            .lock()
            .unwrap()
            .entry(destination.clone())
            .or_insert_with(|| MockWire::new(self.start_writable))
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, destination: &Destination) -> io::Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_attempts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_attempts.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }

        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connector torn down"))?;
        permit.forget();

        Ok(Box::new(MockTransport {
            wire: self.wire(destination),
        }))
    }
}

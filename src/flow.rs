//! Process-wide flow control back to the ingest layer.
//!
//! When any session's send queue reaches its hard cap, the relay asks the
//! ingest layer to stop accepting metrics; once the queue drains below the
//! low watermark, it asks it to resume. Only sessions mutate this state;
//! ingest reads the level and subscribes to the edges.
//!
//! Edges are fired exactly once per transition. Because the events are
//! broadcast and a slow subscriber can miss one, consumers should treat
//! them as level-triggered toward [`FlowControl::receivers_paused`].

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Edge events delivered to the ingest layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlEvent {
    PauseReceiving,
    ResumeReceiving,
}

/// Shared pause/resume surface between sessions and the ingest layer.
#[derive(Debug)]
pub struct FlowControl {
    receivers_paused: AtomicBool,
    events: broadcast::Sender<FlowControlEvent>,
}

impl FlowControl {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            receivers_paused: AtomicBool::new(false),
            events,
        }
    }

    /// Subscribe to pause/resume edges.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowControlEvent> {
        self.events.subscribe()
    }

    /// Current level, readable at any time.
    pub fn receivers_paused(&self) -> bool {
        self.receivers_paused.load(Ordering::SeqCst)
    }

    /// Request that ingest stop accepting metrics. Fires one edge per
    /// false-to-true transition; repeated calls while paused are no-ops.
    pub fn pause_receiving(&self) {
        if !self.receivers_paused.swap(true, Ordering::SeqCst) {
            debug!("send queue full, pausing metric receivers");
            let _ = self.events.send(FlowControlEvent::PauseReceiving);
        }
    }

    /// Request that ingest resume. Fires one edge per true-to-false
    /// transition.
    pub fn resume_receiving(&self) {
        if self.receivers_paused.swap(false, Ordering::SeqCst) {
            debug!("send queue has space available, resuming paused receivers");
            let _ = self.events.send(FlowControlEvent::ResumeReceiving);
        }
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn edges_fire_once_per_transition() {
        let flow = FlowControl::new();
        let mut events = flow.subscribe();

        flow.pause_receiving();
        flow.pause_receiving();
        flow.pause_receiving();
        assert!(flow.receivers_paused());

        flow.resume_receiving();
        flow.resume_receiving();
        assert!(!flow.receivers_paused());

        assert_eq!(events.try_recv().unwrap(), FlowControlEvent::PauseReceiving);
        assert_eq!(events.try_recv().unwrap(), FlowControlEvent::ResumeReceiving);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn resume_without_pause_is_silent() {
        let flow = FlowControl::new();
        let mut events = flow.subscribe();
        flow.resume_receiving();
        assert!(events.try_recv().is_err());
    }
}

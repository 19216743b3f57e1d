//! Single-delivery event signals.
//!
//! A [`OneShot`] delivers one occurrence of an event to every subscriber
//! that attached before it fired, then resets itself so later subscribers
//! wait for the next occurrence. Sessions use these for `connectionMade`,
//! `connectFailed`, `connectionLost`, and the queue-empty edge, where
//! external waiters always mean "the next time this happens".
//!
//! Unobserved events are silently discarded. Subscribers that went away
//! before the event fired are skipped without noise.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// A resettable one-shot event.
#[derive(Debug, Default)]
pub struct OneShot<T> {
    waiters: Mutex<Vec<oneshot::Sender<T>>>,
}

impl<T: Clone> OneShot<T> {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Attach to the next occurrence of the event.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().push(tx);
        Subscription { rx }
    }

    /// Deliver `value` to everyone currently subscribed and reset.
    pub fn fire(&self, value: T) {
        let waiters = std::mem::take(&mut *self.waiters.lock().unwrap());
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
    }
}

/// A pending subscription to a [`OneShot`].
///
/// Resolves to `Some(value)` when the event fires, or `None` if the signal
/// owner went away before it did.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Subscription<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(Result::ok)
    }
}

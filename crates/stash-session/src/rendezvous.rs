//! One-shot rendezvous slot bridging the handshake coordinator and the
//! account session task.
//!
//! The coordinator holds the fulfiller half, the session task the waiter
//! half. Exactly one fulfillment (a value or the "none" sentinel) sticks;
//! later attempts are no-ops. The waiter suspends with a bounded timeout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

/// Outcome of waiting on a rendezvous slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Value(T),
    /// Fulfilled with the "none" sentinel, or the fulfiller was dropped.
    Declined,
    TimedOut,
}

/// Fulfiller half of a rendezvous slot.
pub struct RendezvousFulfiller<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<Option<T>>>>>,
}

impl<T> RendezvousFulfiller<T> {
    /// Fulfills the slot. Returns true when this call set the value, false
    /// when the slot was already fulfilled.
    pub fn fulfill(&self, value: Option<T>) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    /// True when no fulfillment has been recorded yet.
    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }
}

impl<T> Clone for RendezvousFulfiller<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

/// Waiter half of a rendezvous slot.
pub struct RendezvousWaiter<T> {
    receiver: oneshot::Receiver<Option<T>>,
}

impl<T> RendezvousWaiter<T> {
    /// Suspends until the slot is fulfilled or `timeout` elapses.
    pub async fn wait(self, timeout: Duration) -> WaitOutcome<T> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(Some(value))) => WaitOutcome::Value(value),
            Ok(Ok(None)) => WaitOutcome::Declined,
            Ok(Err(_)) => WaitOutcome::Declined,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

/// Creates an unset rendezvous slot, returning its two halves.
pub fn rendezvous<T>() -> (RendezvousFulfiller<T>, RendezvousWaiter<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        RendezvousFulfiller {
            slot: Arc::new(Mutex::new(Some(sender))),
        },
        RendezvousWaiter { receiver },
    )
}

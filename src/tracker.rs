//! In-flight message accounting.
//!
//! Each consumer owns one [`InFlightTracker`]. The message handling wrapper
//! calls [`InFlightTracker::begin`] when a delivery arrives and holds the
//! returned [`InFlightGuard`] until the acknowledgment decision has been sent.
//! Shutdown waits on the tracker's [`ShutdownGate`] for the count to reach zero.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Counter of messages currently being processed by one consumer
#[derive(Debug)]
pub struct InFlightTracker {
    count: Arc<watch::Sender<usize>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Record a message as in flight. The count goes back down when the guard drops.
    pub fn begin(&self) -> InFlightGuard {
        self.count.send_modify(|n| *n += 1);
        InFlightGuard {
            count: self.count.clone(),
        }
    }

    /// Current number of in-flight messages
    pub fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Gate that opens whenever the count is zero
    pub fn gate(&self) -> ShutdownGate {
        ShutdownGate {
            count: self.count.subscribe(),
        }
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one in-flight slot; releases it exactly once on drop
#[derive(Debug)]
#[must_use = "the message stops counting as in flight as soon as the guard is dropped"]
pub struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Blocks until a counter reaches zero
#[derive(Debug, Clone)]
pub struct ShutdownGate {
    count: watch::Receiver<usize>,
}

impl ShutdownGate {
    /// Wait until the counter is zero. Returns immediately if it already is.
    pub async fn wait(&mut self) {
        // Closed channel: the tracker is gone, nothing left in flight.
        let _ = self.count.wait_for(|n| *n == 0).await;
    }

    /// Like [`wait`](Self::wait), but reports the remaining count every `interval`
    /// while the counter stays above zero.
    pub async fn wait_with_progress<F>(&mut self, interval: Duration, mut on_progress: F)
    where
        F: FnMut(usize),
    {
        loop {
            let remaining = *self.count.borrow();
            if remaining == 0 {
                return;
            }
            match tokio::time::timeout(interval, self.wait()).await {
                Ok(()) => return,
                Err(_) => on_progress(*self.count.borrow()),
            }
        }
    }

    pub fn current(&self) -> usize {
        *self.count.borrow()
    }
}

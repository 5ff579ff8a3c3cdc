use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::{Channel, ConsumerTag, DeliveryCallback};
use crate::tracker::{InFlightGuard, InFlightTracker, ShutdownGate};

/// Mutable runtime state of one consumer
#[derive(Debug, Default)]
pub struct ConsumerState {
    shutting_down: AtomicBool,
    in_flight: InFlightTracker,
    consumer_tag: Mutex<Option<ConsumerTag>>,
}

impl ConsumerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Flip into shutdown. Returns false if the consumer was already shutting down.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    pub fn in_flight_messages(&self) -> usize {
        self.in_flight.current()
    }

    pub(crate) fn track_message(&self) -> InFlightGuard {
        self.in_flight.begin()
    }

    pub(crate) fn drain_gate(&self) -> ShutdownGate {
        self.in_flight.gate()
    }

    pub fn consumer_tag(&self) -> Option<ConsumerTag> {
        self.consumer_tag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_consumer_tag(&self, tag: ConsumerTag) {
        *self
            .consumer_tag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tag);
    }
}

/// One registered queue bound to its own channel
pub(crate) struct Consumer {
    pub(crate) queue: String,
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) state: Arc<ConsumerState>,
    pub(crate) callback: DeliveryCallback,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_idle() {
        let state = ConsumerState::new();
        assert!(!state.is_shutting_down());
        assert_eq!(state.in_flight_messages(), 0);
        assert!(state.consumer_tag().is_none());
    }

    #[test]
    fn test_shutdown_flag_is_set_once() {
        let state = ConsumerState::new();
        assert!(state.begin_shutdown());
        assert!(!state.begin_shutdown());
        assert!(state.is_shutting_down());
    }

    #[test]
    fn test_consumer_tag_assignment() {
        let state = ConsumerState::new();
        state.set_consumer_tag(ConsumerTag::new("ctag-1"));
        assert_eq!(state.consumer_tag(), Some(ConsumerTag::new("ctag-1")));
    }

    #[test]
    fn test_tracked_messages_show_in_state() {
        let state = ConsumerState::new();
        let guard = state.track_message();
        assert_eq!(state.in_flight_messages(), 1);
        assert_eq!(state.drain_gate().current(), 1);
        drop(guard);
        assert_eq!(state.in_flight_messages(), 0);
    }
}

use anyhow::{Context, Result};
use futures::future::{join_all, try_join_all};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broker::{Connection, ConsumerTag};
use crate::consumer::Consumer;

/// Lifecycle of an [`App`]: `Built -> Running -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Built,
    Running,
    Stopping,
    Stopped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Cannot {operation} an app that is {state:?}")]
    InvalidTransition {
        operation: &'static str,
        state: LifecycleState,
    },
}

/// Snapshot of one consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: String,
    pub consumer_tag: Option<ConsumerTag>,
    pub in_flight: usize,
    pub shutting_down: bool,
}

/// A built set of consumers sharing one broker connection.
///
/// Cloning is cheap; all clones drive the same consumers. `run` starts
/// delivery, `stop` drains and tears everything down exactly once.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    connection: Arc<dyn Connection>,
    consumers: Vec<Arc<Consumer>>,
    lifecycle: Mutex<LifecycleState>,
    stop_requested: AtomicBool,
    progress_interval: Duration,
}

impl App {
    pub(crate) fn new(
        connection: Arc<dyn Connection>,
        consumers: Vec<Arc<Consumer>>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(AppInner {
                connection,
                consumers,
                lifecycle: Mutex::new(LifecycleState::Built),
                stop_requested: AtomicBool::new(false),
                progress_interval,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle()
    }

    /// Names of the registered queues, in definition order
    pub fn queues(&self) -> Vec<String> {
        self.inner.consumers.iter().map(|c| c.queue.clone()).collect()
    }

    /// Per-queue in-flight counts and shutdown flags
    pub fn in_flight(&self) -> Vec<QueueStats> {
        self.inner
            .consumers
            .iter()
            .map(|consumer| QueueStats {
                queue: consumer.queue.clone(),
                consumer_tag: consumer.state.consumer_tag(),
                in_flight: consumer.state.in_flight_messages(),
                shutting_down: consumer.state.is_shutting_down(),
            })
            .collect()
    }

    /// Total number of messages being processed across all consumers
    pub fn total_in_flight(&self) -> usize {
        self.inner
            .consumers
            .iter()
            .map(|c| c.state.in_flight_messages())
            .sum()
    }

    /// Start delivery on every consumer. Resolves once all of them are listening.
    pub async fn run(&self) -> Result<()> {
        self.transition("run", LifecycleState::Built, LifecycleState::Running)?;

        try_join_all(self.inner.consumers.iter().map(|consumer| async move {
            let tag = consumer
                .channel
                .consume(&consumer.queue, consumer.callback.clone())
                .await
                .with_context(|| format!("Failed to start consuming from queue '{}'", consumer.queue))?;
            consumer.state.set_consumer_tag(tag.clone());
            info!(queue = %consumer.queue, consumer_tag = %tag, "Listening on queue");
            Ok::<_, anyhow::Error>(())
        }))
        .await?;

        Ok(())
    }

    /// Cancel all consumers, wait for in-flight messages to finish, then close
    /// every channel and the connection.
    ///
    /// Only the first call does anything; later calls return `Ok(())` at once.
    /// The drain wait has no timeout. Wrap the call in `tokio::time::timeout`
    /// to bound it.
    ///
    /// # Errors
    ///
    /// Returns an error if closing the connection fails. Cancel and channel
    /// close failures are logged and do not interrupt the shutdown.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            debug!("Stop already requested, ignoring");
            return Ok(());
        }
        *self.lifecycle() = LifecycleState::Stopping;

        info!("🛑 Stopping all consumers");
        self.cancel_all().await;
        info!("All consumers cancelled");

        info!(
            in_flight_messages = self.total_in_flight(),
            "Waiting for in-flight messages"
        );
        self.drain().await;
        info!("All in-flight messages completed");

        self.close_channels().await;

        let result = if self.inner.consumers.is_empty() {
            debug!("No consumers registered, leaving connection untouched");
            Ok(())
        } else {
            self.inner
                .connection
                .close()
                .await
                .context("Failed to close broker connection")
        };

        *self.lifecycle() = LifecycleState::Stopped;
        info!("✅ App stopped");
        result
    }

    /// Run until SIGINT or SIGTERM arrives, then stop
    pub async fn run_until_signal(&self) -> Result<()> {
        if let Err(e) = self.run().await {
            warn!("Failed to start consumers, shutting down: {:#}", e);
            if let Err(stop_err) = self.stop().await {
                warn!("Shutdown after failed start also failed: {:#}", stop_err);
            }
            return Err(e);
        }

        crate::utils::shutdown_signal().await;
        self.stop().await
    }

    async fn cancel_all(&self) {
        join_all(self.inner.consumers.iter().map(|consumer| async move {
            consumer.state.begin_shutdown();
            if let Some(tag) = consumer.state.consumer_tag() {
                if let Err(e) = consumer.channel.cancel(&tag).await {
                    warn!(queue = %consumer.queue, consumer_tag = %tag, error = %e, "Failed to cancel consumer");
                }
            }
        }))
        .await;
    }

    async fn drain(&self) {
        let interval = self.inner.progress_interval;
        join_all(self.inner.consumers.iter().map(|consumer| {
            let mut gate = consumer.state.drain_gate();
            let queue = consumer.queue.as_str();
            async move {
                gate.wait_with_progress(interval, |remaining| {
                    info!(queue = %queue, in_flight_messages = remaining, "Still waiting for in-flight messages");
                })
                .await;
                debug!(queue = %queue, "Queue drained");
            }
        }))
        .await;
    }

    async fn close_channels(&self) {
        join_all(self.inner.consumers.iter().map(|consumer| async move {
            if let Err(e) = consumer.channel.close().await {
                warn!(queue = %consumer.queue, error = %e, "Failed to close channel");
            }
        }))
        .await;
    }

    fn transition(
        &self,
        operation: &'static str,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), LifecycleError> {
        let mut state = self.lifecycle();
        if *state != from {
            return Err(LifecycleError::InvalidTransition {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("state", &self.state())
            .field("consumers", &self.inner.consumers)
            .finish_non_exhaustive()
    }
}

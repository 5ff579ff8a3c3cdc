// Public API
pub mod amqp;
pub mod app;
pub mod app_builder;
pub mod broker;
pub mod config;
pub mod handler;
pub mod memory;
pub mod tracker;
pub mod utils;

// Internal modules
mod consumer;

pub use app::{App, LifecycleError, LifecycleState, QueueStats};
pub use app_builder::AppBuilder;
pub use config::{Config, RejectPolicy};
pub use handler::{FailurePolicy, HandlerError, MessageContext, QueueDefinition};

#[cfg(test)]
#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Resolve once the process receives SIGTERM or SIGINT (Ctrl+C elsewhere)
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};
        let streams = signal(SignalKind::terminate()).and_then(|sigterm| {
            signal(SignalKind::interrupt()).map(|sigint| (sigterm, sigint))
        });

        match streams {
            Ok((mut sigterm, mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("📡 Received SIGTERM - initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        info!("📡 Received SIGINT (Ctrl+C) - initiating graceful shutdown");
                    }
                }
                return;
            }
            Err(err) => {
                error!("Unable to register signal handlers, falling back to Ctrl+C: {}", err);
            }
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("📡 Received Ctrl+C - initiating graceful shutdown");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `logging.level`.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(&config.level)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Map a configured level to a filter directive, defaulting to `info`.
/// Directives naming a target are passed through untouched.
pub fn filter_directive(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') {
        return match EnvFilter::try_new(level) {
            Ok(_) => level.to_string(),
            Err(_) => "info".to_string(),
        };
    }

    match level.to_ascii_lowercase().as_str() {
        l @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => l.to_string(),
        "warning" => "warn".to_string(),
        _ => "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn test_filter_directive_levels() {
        assert_eq!(filter_directive("debug"), "debug");
        assert_eq!(filter_directive("  WARN "), "warn");
        assert_eq!(filter_directive("warning"), "warn");
        assert_eq!(filter_directive(""), "info");
        assert_eq!(filter_directive("loud"), "info");
    }

    #[test]
    fn test_filter_directive_passes_through_targets() {
        assert_eq!(
            filter_directive("rabbitmq_app_builder=debug"),
            "rabbitmq_app_builder=debug"
        );
        assert_eq!(filter_directive(" MyWorker=debug "), "MyWorker=debug");
        assert_eq!(filter_directive("orders=loud"), "info");
    }

    #[test]
    fn test_init_logging_twice_fails_without_panicking() {
        // The test harness installs a subscriber first
        let result = init_logging(&LoggingConfig::default());
        assert!(result.is_err());
    }

    quickcheck! {
        fn prop_filter_directive_is_parseable(level: String) -> bool {
            EnvFilter::try_new(filter_directive(&level)).is_ok()
        }
    }
}

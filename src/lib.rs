pub mod capability;
pub mod client;
pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod helpers;
pub mod server;

use tracing_subscriber::{self, prelude::*};

use crate::capability::CapabilityRegistry;
use crate::config::{Config, LoggingConfig};
use crate::server::MrdServer;

/// Initialize logging per the configuration
pub fn init_logging(config: &LoggingConfig) -> mrd::Result<()> {
    if config.log_to_file {
        let log_file = std::fs::File::create(&config.log_file_path).map_err(|e| {
            mrd::MrdError::config(format!(
                "Could not create log file {}: {}",
                config.log_file_path, e
            ))
        })?;

        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_writer(log_file);

        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter())
            .with(file_appender)
            .with(stdout_appender)
            .try_init()
            .map_err(|e| mrd::MrdError::internal(format!("Failed to initialize logging: {}", e)))?;
    } else {
        tracing_subscriber::fmt()
            .with_file(true)
            .with_line_number(true)
            .with_env_filter(env_filter())
            .init();
    }
    Ok(())
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Start the streaming server with the built-in capabilities
pub async fn run(config: Config) -> mrd::Result<()> {
    init_logging(&config.logging)?;

    tracing::info!("🔧 Starting resonance v{}", env!("CARGO_PKG_VERSION"));

    let mut registry = CapabilityRegistry::with_builtins();
    registry.set_fallback(&config.fallback_capability);

    tracing::info!("🚀 Serving capabilities: {}", registry.names().join(", "));
    MrdServer::new(config, registry).run().await
}

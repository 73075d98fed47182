//! Courier - main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use courier::config::Config;
use courier::error::ConfigError;
use courier::registry::RegistryBuilder;
use courier::server::Server;
use courier::testing::{MockBackend, MockHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Real deployments plug their storage in here; the memory backend runs
    // the gateway end-to-end without external services and serves the mock
    // channel type for smoke testing.
    let backend: Arc<dyn courier::Backend> = match config.backend.as_str() {
        "memory" => Arc::new(MockBackend::new().with_policy(config.network_policy()?)),
        other => return Err(ConfigError::UnknownBackend(other.to_string()).into()),
    };

    let mut builder = RegistryBuilder::new();
    if config.backend == "memory" {
        builder = builder.register(Arc::new(MockHandler::new()));
    }
    let registry = builder.build(&config.include_list()?, &config.exclude_list()?);
    if registry.is_empty() {
        tracing::warn!("no active channel handlers");
    }

    let mut server = Server::new(config, backend, registry);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}

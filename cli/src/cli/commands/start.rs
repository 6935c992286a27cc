use std::path::PathBuf;

use cil_router_core::config::load_config;
use cil_router_core::proxy::ProxyServer;

pub async fn run(config_path: Option<PathBuf>, port_override: Option<u16>) -> anyhow::Result<()> {
    // Load configuration
    let mut config = load_config(config_path)?;

    // Apply port override if provided
    if let Some(port) = port_override {
        config.server.port = port;
    }

    tracing::info!("Starting CIL Router...");
    tracing::info!("  Host: {}", config.server.host);
    tracing::info!("  Port: {}", config.server.port);
    tracing::info!("  Providers: {}", config.providers.len());
    tracing::info!("  Active provider: {}", config.routing.active_provider);
    tracing::info!(
        "  Timeouts: request {}s, stream {}s, connect {}s",
        config.timeouts.request_timeout,
        config.timeouts.stream_timeout,
        config.timeouts.connect_timeout
    );
    if config.rate_limit.enabled {
        tracing::info!(
            "  Rate limit: {} req/min, burst {}, trust proxy {}",
            config.rate_limit.requests_per_minute,
            config.rate_limit.burst_size,
            config.rate_limit.trust_proxy
        );
    } else {
        tracing::info!("  Rate limit: disabled");
    }

    let server = ProxyServer::from_config(&config).await?;

    tracing::info!("Router starting on http://{}:{}", config.server.host, config.server.port);
    tracing::info!("Press Ctrl+C to stop");

    // Run server (blocks until shutdown)
    server.run().await?;

    Ok(())
}

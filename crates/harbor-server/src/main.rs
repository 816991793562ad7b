//! Harbor API server entry point.

use harbor_server::{AppState, ServerConfig};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("harbor_server=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Harbor API server");

    let config = ServerConfig::from_env()?;
    tracing::info!(
        listen_addr = %config.listen_addr,
        preview_domain = %config.preview_domain,
        agent_image = %config.agent_image,
        sweep_secs = config.sweep_interval.as_secs(),
        api_rate_limit = config.api_rate_limit,
        "Configuration loaded"
    );

    let state = AppState::from_config(&config)?;
    let background = state.spawn_background(config.sweep_interval);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal, cleaning up...");
    };
    harbor_server::serve(state, config.listen_addr, shutdown).await?;

    for task in background {
        task.abort();
    }
    tracing::info!("Server shutdown complete");
    Ok(())
}

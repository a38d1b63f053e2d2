use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use axum::serve;
use strategy_advisor::{rate_limit::spawn_sweeper, router, AdvisorState, Config};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env()?;
    let bind_addr = config.listen_addr();

    info!("Starting Strategy Advisor");
    info!("Listening on: {}", bind_addr);
    info!("Upstream: {} (model: {})", config.base_url, config.model);
    info!("Rate limit config:");
    info!("  Max requests per window: {}", config.rate_limit_max_requests);
    info!("  Window: {:?}", config.rate_limit_window);
    info!("  Sweep interval: {:?}", config.rate_limit_sweep_interval);
    info!("Timeouts:");
    info!("  Upstream first byte: {:?}", config.upstream_timeout);
    info!("  Stream idle: {:?}", config.stream_idle_timeout);
    info!("Include strategy details in prompt: {}", config.include_strategy_details);

    if config.api_key.is_none() {
        warn!("⚠️  OPENAI_API_KEY is not set: every chat request will fail with 500");
    }

    let state = AdvisorState::from_config(&config)?;
    spawn_sweeper(Arc::clone(&state.rate_limiter), config.rate_limit_sweep_interval);

    let app = router(state);
    let listener = TcpListener::bind(&bind_addr).await?;

    info!("Strategy Advisor is ready");

    serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

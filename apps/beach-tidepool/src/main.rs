use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tidepool::{
    cli::Cli, config::Config, routes::build_router, state::AppState, telemetry::logging,
    terminal::pty::NativeSpawner,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initialize logging")?;

    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    let addr = format!("{}:{}", config.host, config.port);
    info!(
        target = "tidepool::server",
        max_sessions = config.max_sessions,
        terminal_enabled = config.terminal_enabled,
        password_required = config.password_required(),
        api_key = config.api_key.is_some(),
        "starting tidepool"
    );

    let state = AppState::new(config, Arc::new(NativeSpawner));
    let registry = state.registry.clone();
    let shutdown_registry = registry.clone();
    let kill_grace = state.config.kill_grace;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(target = "tidepool::server", %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(target = "tidepool::server", error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            let signalled = shutdown_registry.shutdown();
            info!(target = "tidepool::server", sessions = signalled, "shutting down");
        })
        .await
        .context("serve HTTP")?;

    // Give forced kills a chance to run before the runtime goes away.
    let drained = tokio::time::timeout(kill_grace + Duration::from_millis(500), async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(target = "tidepool::server", remaining = registry.len(), "sessions still running at exit");
    }
    Ok(())
}

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_road::config::RoadConfig;
use huddle_road::{router, RoadState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "huddle-road")]
#[command(about = "Signaling relay and connect-request broker for huddle endpoints")]
struct Cli {
    /// Port to listen on (overrides HUDDLE_ROAD_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides HUDDLE_ROAD_BIND)
    #[arg(long)]
    bind: Option<String>,

    /// Seconds a target has to acknowledge a connect request
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Allow connect requests to endpoints that never connected
    #[arg(long)]
    accept_unknown: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = RoadConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(secs) = cli.request_timeout {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    config.accept_unknown |= cli.accept_unknown;

    info!(
        target = "huddle_road",
        addr = %config.addr(),
        request_timeout_secs = config.huddle.request_timeout.as_secs(),
        decision_timeout_secs = config.huddle.decision_timeout.as_secs(),
        accept_unknown = config.accept_unknown,
        "starting huddle road"
    );

    let app = router(RoadState::new(&config));
    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("failed to bind {}", config.addr()))?;
    info!(target = "huddle_road", addr = %config.addr(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(target = "huddle_road", "shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}

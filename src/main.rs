use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use transit_lookup::provider::TransitlandClient;
use transit_lookup::realtime::TripUpdatesClient;
use transit_lookup::server::{create_router, AppState, SESSION_SWEEP_INTERVAL};
use transit_lookup::TransitConfig;

#[derive(Parser)]
#[command(name = "transit-lookup")]
#[command(about = "Stop lookup and departures service backed by Transitland")]
struct Args {
    /// Port to run the HTTP server on
    #[arg(short, long, env = "SERVER_PORT", default_value = "3030")]
    port: u16,

    /// Address to bind
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = TransitConfig::from_env()?;
    info!(
        "Using {} with operators {:?} in {}",
        config.base_url, config.operators, config.timezone
    );

    let http = reqwest::Client::new();
    let provider = Arc::new(TransitlandClient::with_client(http.clone(), &config));
    let trip_updates = TripUpdatesClient::with_client(http, &config);
    let state = AppState::new(config, provider, trip_updates);
    let _sweeper = state.spawn_session_sweeper(SESSION_SWEEP_INTERVAL);
    let app = create_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Server is running on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

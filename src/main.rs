use anyhow::Context;
use dotenvy::dotenv;
use tracing::{info, warn};

mod billing;
mod config;
mod db;
mod error;
mod handlers;
mod providers;
mod router;
mod state;
mod tracking;
mod utils;

use config::CONFIG;
use db::database::Database;
use state::{AppState, VendorSettings};
use utils::http::get_http_client;
use utils::logging::init_logging;

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _guards = init_logging();

    info!("Starting generation tracker");
    if CONFIG.novita_api_key.is_empty() {
        info!("NOVITA_API_KEY is not set; the key must come from dashboard settings");
    }

    let db = Database::init(&CONFIG.database_url, CONFIG.database_max_connections)
        .await
        .with_context(|| format!("Failed to open database {}", CONFIG.database_url))?;
    let state = AppState::new(
        db,
        get_http_client().clone(),
        VendorSettings::from_config(&CONFIG),
    );

    let listener = tokio::net::TcpListener::bind(&CONFIG.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", CONFIG.bind_address))?;
    info!("Listening on {}", CONFIG.bind_address);

    axum::serve(listener, router::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

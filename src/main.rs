//! ws-command server entry point.
//!
//! Starts the Axum HTTP server with the health and WebSocket endpoints.

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use ws_command::api;
use ws_command::app_state::AppState;
use ws_command::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = ServerConfig::from_env()?;
    tracing::info!(
        addr = %config.listen_addr,
        heartbeat_interval = ?config.heartbeat_interval,
        policy = ?config.malformed_frame_policy,
        "starting ws-command"
    );
    let listen_addr = config.listen_addr;

    // Build router
    let app = api::build_router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState::new(config));

    // Start server
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

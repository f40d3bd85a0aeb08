use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use crate::config::ProvisionConfig;
use crate::driver::ConversationDriver;

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub provision: ProvisionConfig,
    pub dev_mode: bool,
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and run until Ctrl-C, then terminate every pending
/// login process.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let handoff = config.provision.handoff();
    handoff.ensure_dir().with_context(|| {
        format!(
            "Failed to create session directory: {}",
            handoff.dir().display()
        )
    })?;

    let driver = ConversationDriver::from_config(&config.provision);
    let state = Arc::new(AppState { driver });

    let mut app = build_router(Arc::clone(&state));

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = config.provision.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        script = %config.provision.toml.script.program,
        sessions = %handoff.dir().display(),
        timeout_secs = config.provision.toml.conversation.timeout_secs,
        "provisiond listening"
    );
    println!("provisiond running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.driver.shutdown().await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

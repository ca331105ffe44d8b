//! HTTP transport: batch and streaming submission, SSE output and input delivery.

pub mod error;
pub mod handlers;
pub mod sse;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::types::{RunpadConfig, ServerConfig};
use crate::error::{Result, RunpadError};
use crate::execution::Orchestrator;

pub use error::ApiError;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub keep_alive: Duration,
}

/// Build the router with all routes and middleware.
pub fn router(orchestrator: Arc<Orchestrator>, config: &ServerConfig) -> Router {
    let state = AppState {
        orchestrator,
        keep_alive: Duration::from_secs(config.sse_keepalive_seconds.max(1)),
    };

    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/runtimes", get(handlers::runtimes))
        .route("/api/analyze", post(handlers::analyze))
        .route("/api/execute", post(handlers::execute))
        .route("/api/stream/execute", post(handlers::stream_execute))
        .route(
            "/api/stream/{session_id}",
            get(handlers::stream_events).delete(handlers::cancel),
        )
        .route("/api/stream/{session_id}/input", post(handlers::provide_input))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

/// Start the server described by `config` and run until Ctrl-C.
pub async fn serve(config: &RunpadConfig) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::from_config(config)?);
    if !orchestrator.backend().health_check().await {
        warn!(
            backend = orchestrator.backend().name(),
            program = %config.backend.program,
            "Execution backend did not answer its health check"
        );
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| RunpadError::Config(format!("Invalid bind address: {}", e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RunpadError::Server(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("runpad server listening on {}", addr);
    info!(
        sandbox = %orchestrator.storage().root().display(),
        "Sandboxed storage ready"
    );

    axum::serve(listener, router(orchestrator, &config.server))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RunpadError::Server(e.to_string()))?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

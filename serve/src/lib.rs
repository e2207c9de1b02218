//! axum HTTP surface for the warden agent runtime (spec §6): agent CRUD,
//! invoke/stream/resume, process-wide events, file browse, and a terminal WS.
//!
//! **Public API**: [`build_router`], [`run_serve`], [`run_serve_on_listener`].

mod auth;
mod backend_factory;
mod dto;
mod error;
mod llm_resolver;
mod routes;
pub mod seed_loader;
mod state;

use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

pub use auth::{Caller, GatewayAuth};
pub use backend_factory::WardenBackendFactory;
pub use llm_resolver::default_resolver;
pub use state::AppState;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Wires every spec §6 route onto the given state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/agents/", post(routes::agents::create_agent).get(routes::agents::list_agents))
        .route("/agents/events", get(routes::events::events))
        .route("/agents/invoke", post(routes::agents::invoke_no_id))
        .route("/agents/stream", post(routes::agents::stream_no_id))
        .route("/agents/resume", post(routes::agents::resume_no_id))
        .route("/agents/tools/available", get(routes::agents::tools_available))
        .route("/agents/files/*path", get(routes::files::read_file).put(routes::files::write_file))
        .route("/agents/:id", get(routes::agents::get_agent).delete(routes::agents::delete_agent))
        .route("/agents/:id/invoke", post(routes::agents::invoke_with_id))
        .route("/agents/:id/stream", post(routes::agents::stream_with_id))
        .route("/agents/:id/resume", post(routes::agents::resume_with_id))
        .route("/agents/:id/tools", patch(routes::agents::patch_tools))
        .route("/agents/:id/backend", patch(routes::agents::patch_backend))
        .route("/agents/:id/terminal", get(routes::terminal::terminal))
        .with_state(state)
}

/// Runs the server on an existing listener. Used by tests (bind to
/// `127.0.0.1:0`, then pass the listener so the ephemeral port is known).
pub async fn run_serve_on_listener(listener: TcpListener, state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("warden HTTP server listening on http://{}", addr);
    let app = build_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Runs the server. Listens on `addr` (default `127.0.0.1:8080`).
pub async fn run_serve(addr: Option<&str>, state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = addr.unwrap_or(DEFAULT_BIND_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_serve_on_listener(listener, state).await
}

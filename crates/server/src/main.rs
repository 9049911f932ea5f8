//! Companion Server
//!
//! Session core for conversations with an external agent host.
//! Renderers talk to it over WebSocket (`/ws`) and a small HTTP API.

mod config;
mod error;
mod export;
mod feed;
mod http;
mod logging;
mod paths;
mod permissions;
mod preview;
mod retry;
mod session;
mod session_actor;
mod session_command;
mod session_naming;
mod state;
mod supervisor;
mod transcript;
mod transition;
mod websocket;

use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use companion_connector::{HttpLivenessProbe, WsTransport};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Args;
use crate::state::{AppState, SessionRegistry};
use crate::supervisor::ConnectionSupervisor;
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    paths::init_data_dir(args.data_dir.as_deref()).context("resolve data directory")?;
    paths::ensure_dirs().context("create data directories")?;
    let log_dir = paths::log_dir().context("resolve log directory")?;
    let logging = logging::init_logging(&log_dir)?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        bind = %args.bind,
        agent_url = %args.agent_url,
        "Starting Companion server"
    );

    let transport = Arc::new(WsTransport::new(args.agent_url.clone()));
    let probe = Arc::new(HttpLivenessProbe::new(args.agent_url.clone())?);
    let registry = SessionRegistry::shared();
    let supervisor =
        ConnectionSupervisor::new(registry, transport, probe, args.supervisor_config());
    let state = AppState::new(Arc::clone(&supervisor));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(http::health_handler))
        .route("/api/sessions", get(http::list_sessions))
        .route("/api/sessions/{id}", get(http::get_session))
        .route("/api/sessions/{id}/feed", get(http::get_feed))
        .route("/api/sessions/{id}/export", get(http::export_session))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %args.bind,
        "Listening"
    );

    let shutdown_supervisor = Arc::clone(&supervisor);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(
                    component = "server",
                    event = "server.signal_failed",
                    error = %err,
                    "Failed to listen for ctrl-c"
                );
                std::future::pending::<()>().await;
            }
            info!(
                component = "server",
                event = "server.shutdown",
                "Shutdown signal received"
            );
            shutdown_supervisor.shutdown().await;
        })
        .await
        .context("running server")?;

    Ok(())
}

//! HTTP surface executing jobs call back into.
//!
//! Every `/v1` route sits behind [`require_run_token`]; `/health` is added
//! after the layer and stays open.

mod routes;
mod state;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::require_run_token;
use crate::listener::{Listener, RunHandler};

pub use self::state::CallbackState;

pub fn router(state: CallbackState) -> Router {
    Router::new()
        .route("/v1/runs/status", post(routes::update_run_status))
        .route("/v1/plans/upload", post(routes::upload_plan))
        .route("/v1/logs/stream", post(routes::stream_logs))
        .route("/v1/logs/upload", post(routes::upload_logs))
        .route_layer(axum::middleware::from_fn_with_state(
            state.authorizer.clone(),
            require_run_token,
        ))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn bind(bind: &str) -> Result<TcpListener> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("parse callback bind address {bind}"))?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind callback server to {addr}"))
}

/// Serve the callback router until `shutdown` is cancelled.
pub async fn serve_on(
    listener: TcpListener,
    state: CallbackState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("callback server address")?;
    info!(addr = %addr, "callback server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("serve callback api")?;
    info!("callback server stopped");
    Ok(())
}

/// Feed `listener` events to `handler` with the callback server up.
///
/// `shutdown` stops the listener only. The server keeps answering until the
/// listener has returned, so a job still running at shutdown can report back.
pub async fn listen_with_callbacks<L: Listener>(
    listener: &mut L,
    handler: &dyn RunHandler,
    callbacks: TcpListener,
    state: CallbackState,
    shutdown: CancellationToken,
) -> Result<()> {
    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_on(callbacks, state, server_shutdown.clone()));

    let listened = listener.listen(handler, shutdown).await;
    server_shutdown.cancel();
    server.await.context("join callback server")??;
    listened
}

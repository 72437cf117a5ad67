//! Signalling relay for watch parties: an append-only log of rows keyed by
//! receiver, pushed live to websocket subscribers.

pub mod config;
pub mod store;
mod websocket;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::RelayConfig;
pub use websocket::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub records: usize,
    pub connections: usize,
    pub subscriptions: usize,
}

async fn health_check(State(state): State<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        records: state.store().len().await,
        connections: state.connection_count(),
        subscriptions: state.subscription_count(),
    })
}

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on an already-bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, config: RelayConfig) -> anyhow::Result<()> {
    let state = RelayState::new(config);
    let addr = listener.local_addr()?;
    info!(%addr, "watch-party relay listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

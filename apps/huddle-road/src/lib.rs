//! Relay server for huddle endpoints: hosts the slot relay, the mesh rosters
//! and the connect-request broker behind one WebSocket per endpoint.

pub mod config;
pub mod websocket;

use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use huddle::{InMemoryDirectory, MemoryRelay, RequestBroker};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::RoadConfig;
use crate::websocket::websocket_handler;

/// Shared by every connection.
#[derive(Clone)]
pub struct RoadState {
    pub relay: MemoryRelay,
    pub broker: RequestBroker,
    pub directory: Arc<InMemoryDirectory>,
}

impl RoadState {
    pub fn new(config: &RoadConfig) -> Self {
        let directory = Arc::new(if config.accept_unknown {
            InMemoryDirectory::accepting_unknown()
        } else {
            InMemoryDirectory::new()
        });
        Self {
            relay: MemoryRelay::new(),
            broker: RequestBroker::new(directory.clone(), &config.huddle),
            directory,
        }
    }
}

#[derive(Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

/// GET /health
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// GET /metrics
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        huddle::metrics::gather(),
    )
}

pub fn router(state: RoadState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

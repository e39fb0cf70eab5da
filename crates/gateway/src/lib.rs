//! HTTP API gateway for Attune.
//!
//! Exposes the turn endpoint plus the feedback, knowledge-link,
//! conversation, and audit management API under `/v1`.
//!
//! Built on Axum.

pub mod api_v1;

use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

use attune_assembler::ContextAssembler;
use attune_core::audit::AuditStore;
use attune_core::inference::InferenceService;
use attune_core::ledger::LedgerStore;

/// Shared application state for the gateway.
pub struct ApiState {
    pub assembler: ContextAssembler,
    pub inference: Arc<dyn InferenceService>,
    pub ledger: Arc<dyn LedgerStore>,
    pub examples: Arc<dyn attune_core::ExampleStore>,
    pub links: Arc<dyn attune_core::KnowledgeLinkStore>,
    pub audit: Arc<dyn AuditStore>,
    /// Default export size when the caller gives no limit.
    pub export_limit: usize,
}

pub type SharedState = Arc<ApiState>;

/// Build the full router: health at the root, the API nested under `/v1`,
/// CORS and trace layers on top.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Bind and serve until shutdown.
pub async fn serve(
    state: SharedState,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

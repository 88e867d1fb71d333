//! Router construction: one generic sub-resource per registered entity
//! endpoint, plus health/version.

use crate::handlers::{create, delete as delete_handler, read, update};
use crate::state::AppState;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Routes without state: GET /health, GET /version.
pub fn common_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
}

/// Entity CRUD routes. The path segment selects the entity; handlers resolve
/// it against the registry.
pub fn entity_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/:endpoint",
            get(read).put(create).patch(update).delete(delete_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

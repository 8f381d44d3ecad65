//! Discovery endpoints
//!
//! - /.well-known/nodeinfo
//! - /api/v1/nodeinfo

use axum::{Router, extract::State, response::Json, routing::get};

use crate::AppState;
use crate::error::AppError;
use crate::federation::nodeinfo::{local_nodeinfo_document, local_well_known_document};
use crate::metrics::HTTP_REQUESTS_TOTAL;

/// Create discovery router
///
/// Routes:
/// - GET /.well-known/nodeinfo
/// - GET /api/v1/nodeinfo
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/api/v1/nodeinfo", get(nodeinfo))
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents.
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/.well-known/nodeinfo", "200"])
        .inc();
    Json(local_well_known_document(&state.config.server.base_url()))
}

/// GET /api/v1/nodeinfo
///
/// Returns the NodeInfo 2.1 document other forges use to detect software.
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let users_total = state.db.count_local_users().await?;
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/api/v1/nodeinfo", "200"])
        .inc();
    Ok(Json(local_nodeinfo_document(
        env!("CARGO_PKG_VERSION"),
        users_total,
    )))
}

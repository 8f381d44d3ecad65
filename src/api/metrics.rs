//! Prometheus scrape endpoint
//!
//! Counters are updated where things happen; queue depths are read from the
//! job table at scrape time.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::metrics::{QUEUE_DEPTH, REGISTRY};

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.federation.queue_depths().await {
        Ok(depths) => {
            for (queue, depth) in depths {
                QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
            }
        }
        // serve the last known depths
        Err(e) => tracing::warn!(error = %e, "Failed to read queue depths"),
    }

    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&REGISTRY.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}

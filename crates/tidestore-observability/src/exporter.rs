//! Metrics Endpoint
//!
//! The ingest binary serves [`REGISTRY`] on `GET /metrics` so a scraper can
//! follow commits, generation rebuilds, dropped messages and deletes while
//! the pipeline runs. Rendering is split from the HTTP handler so the text
//! form can also be logged or inspected in tests.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// Content type of the Prometheus text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Every registered ingest metric in the text exposition format.
pub fn render() -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

async fn scrape() -> Response {
    match render() {
        Ok(text) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], text).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to render ingest metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to encode metrics: {}", e))
                .into_response()
        }
    }
}

/// Router serving `GET /metrics`
pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(scrape))
}

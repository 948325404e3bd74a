//! Liveness probe endpoint.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// `GET /healthz` — liveness only, no dependencies, never blocks.
///
/// Readiness (backends reachable, credentials valid) is a different
/// question; use `/models/detected` and `/router/stats` for that.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

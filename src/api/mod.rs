//! HTTP control surface.
//!
//! One axum router carries the whole public API: the routing endpoints
//! (`/router/*`, `/models/*`) and the conversation API (`/api/v1/*`).
//! Middleware order, outermost first: trace → request-id → rate spacing.
//! CORS is attached only when an allow-list is configured.

pub mod conversations;
pub mod health;
pub mod rate_limit;
pub mod request_id;
pub mod router;

use std::sync::Arc;

use axum::{
    http::HeaderValue,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::{config::Config, facade::RouterFacade};

/// Build the public axum router.
pub fn router(facade: Arc<RouterFacade>) -> Router {
    let cors = cors_layer(&facade.config());

    let mut app = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/router/query", post(router::query))
        .route("/router/stats", get(router::stats))
        .route("/router/config/reload", post(router::reload))
        .route("/models/scan", post(router::scan))
        .route("/models/detected", get(router::detected))
        .route(
            "/api/v1/conversations",
            get(conversations::list).post(conversations::create),
        )
        .route(
            "/api/v1/conversations/{id}",
            get(conversations::show)
                .put(conversations::update)
                .delete(conversations::delete),
        )
        .route(
            "/api/v1/conversations/{id}/messages",
            get(conversations::messages).post(conversations::append),
        )
        .route("/api/v1/search", get(conversations::search))
        .route("/api/v1/export", post(conversations::export))
        .route("/api/v1/import", post(conversations::import))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&facade),
            rate_limit::rate_limit_middleware,
        ))
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .with_state(facade);

    if let Some(cors) = cors {
        app = app.layer(cors);
    }
    app
}

/// CORS layer from the configured allow-list; `None` disables CORS entirely.
fn cors_layer(config: &Config) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = config
        .server
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

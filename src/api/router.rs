//! Routing control surface — query, stats, reload, and model discovery.
//!
//! Handlers here are intentionally thin: all routing logic lives in
//! [`crate::facade`]. They translate HTTP concerns (status codes, JSON
//! bodies) into facade calls and back.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    backends::ImagePayload,
    config::ModelRef,
    error::AppError,
    facade::{FacadeError, RouterFacade, RouterRequest},
};

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub input: String,
    #[serde(default)]
    pub force_model: Option<String>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub session_id: Option<i64>,
    #[serde(default)]
    pub image: Option<ImagePayload>,
}

/// `POST /router/query` — route one request through triage and the chain.
pub async fn query(
    State(facade): State<Arc<RouterFacade>>,
    Json(body): Json<QueryBody>,
) -> Result<impl IntoResponse, AppError> {
    let force_model_ref = body
        .force_model
        .as_deref()
        .map(|s| s.parse::<ModelRef>())
        .transpose()
        .map_err(|e| AppError::bad_request(format!("invalid force_model: {e}")))?;

    let request = RouterRequest {
        input: body.input,
        image: body.image,
        session_id: body.session_id,
        force_model_ref,
        extra_context: body.context,
    };

    let routed = match facade.handle(request).await {
        Ok(routed) => routed,
        Err(e) => return Err(facade_error(e)),
    };

    let metadata = json!({
        "conversation_id": routed.conversation_id,
        "origin": routed.decision.origin,
        "confidence": routed.decision.confidence,
        "reason": routed.decision.reason,
        "attempts": routed.outcome.attempts,
        "cost_warning": routed.outcome.cost_warning,
        "store_warning": routed.store_warning,
        "elapsed_ms": routed.elapsed_ms,
    });

    if let Some(completion) = &routed.outcome.response {
        Ok((
            StatusCode::OK,
            Json(json!({
                "success": true,
                "model": completion.model_ref.to_string(),
                "response": completion.text,
                "metadata": metadata,
            })),
        ))
    } else {
        // Every chain step failed terminally; list the failures.
        let failures: Vec<Value> = routed
            .outcome
            .attempts
            .iter()
            .map(|a| {
                json!({
                    "model": a.model_ref.to_string(),
                    "outcome": a.outcome,
                    "error_kind": a.error_kind,
                    "error": a.error,
                })
            })
            .collect();
        Ok((
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "success": false,
                "error": "all backends failed",
                "failures": failures,
                "metadata": metadata,
            })),
        ))
    }
}

fn facade_error(e: FacadeError) -> AppError {
    let status = match &e {
        FacadeError::EmptyInput => StatusCode::BAD_REQUEST,
        FacadeError::Busy => StatusCode::TOO_MANY_REQUESTS,
        FacadeError::NoBackendsAvailable => StatusCode::SERVICE_UNAVAILABLE,
        FacadeError::ContextTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        FacadeError::UnknownSession(_) => StatusCode::NOT_FOUND,
        FacadeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    AppError::status(status, e)
}

/// `GET /router/stats` — current counter snapshot plus uptime.
pub async fn stats(State(facade): State<Arc<RouterFacade>>) -> impl IntoResponse {
    let snapshot = facade.stats();
    Json(json!({
        "uptime_secs": facade.started_at.elapsed().as_secs(),
        "stats": snapshot,
    }))
}

/// `POST /router/config/reload` — re-parse the config file and swap it in.
pub async fn reload(
    State(facade): State<Arc<RouterFacade>>,
) -> Result<impl IntoResponse, AppError> {
    facade.reload_config()?;
    Ok(Json(json!({ "status": "reloaded" })))
}

/// `POST /models/scan` — trigger a registry refresh in the background.
pub async fn scan(State(facade): State<Arc<RouterFacade>>) -> impl IntoResponse {
    let registry = Arc::clone(&facade.registry);
    let config = facade.config();
    tokio::spawn(async move {
        registry.refresh(&config).await;
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "scan-started" })))
}

/// `GET /models/detected` — current registry contents.
pub async fn detected(State(facade): State<Arc<RouterFacade>>) -> impl IntoResponse {
    let snapshot = facade.registry.snapshot();
    let models: Vec<Value> = snapshot
        .list_all()
        .into_iter()
        .map(|e| {
            json!({
                "ref": e.model_ref().to_string(),
                "display_name": e.display_name,
                "provider": e.provider,
                "capabilities": e.capabilities,
                "context_tokens": e.context_tokens,
                "pricing": e.pricing,
                "runtime": e.runtime,
            })
        })
        .collect();
    Json(json!({
        "models": models,
        "last_scan": snapshot.last_scan_at,
        "cache_valid": !snapshot.is_stale(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use serde_json::json;
    use std::path::PathBuf;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::{config::Config, registry::Registry, store::ConversationStore};

    async fn facade_with_runtime(server: &MockServer) -> Arc<RouterFacade> {
        let yaml = format!(
            r#"
            models:
              local:
                endpoint: {uri}
                kind: ollama
                model: qwen3-4b
              cloud:
                provider: anthropic
                model: claude-sonnet-4
            fallback:
              chain: ["local", "cloud"]
            executor:
              max_attempts: 2
              base_delay_ms: 5
              request_timeout_ms: 5000
              deadline_ms: 8000
            "#,
            uri = server.uri()
        );
        let config: Arc<Config> = Arc::new(serde_yaml::from_str(&yaml).unwrap());
        let registry = Arc::new(Registry::new(None));
        registry.refresh(&config).await;
        let store = Arc::new(ConversationStore::open_in_memory().unwrap());
        Arc::new(RouterFacade::new(config, PathBuf::from("config.yaml"), registry, store))
    }

    async fn mock_runtime(reply: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{ "name": "qwen3-4b" }],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": { "role": "assistant", "content": reply },
            })))
            .mount(&server)
            .await;
        server
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn query_returns_success_shape() {
        let server = mock_runtime("routed!").await;
        let facade = facade_with_runtime(&server).await;
        let app = crate::api::router(facade);

        let req = Request::post("/router/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"input": "hello"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["model"], "local:qwen3-4b");
        assert_eq!(json["response"], "routed!");
        assert!(json["metadata"]["conversation_id"].is_i64());
        assert_eq!(json["metadata"]["attempts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn query_rejects_empty_input_with_400() {
        let server = mock_runtime("x").await;
        let facade = facade_with_runtime(&server).await;
        let app = crate::api::router(facade);

        let req = Request::post("/router/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"input": "  "}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn query_rejects_bad_force_model_with_400() {
        let server = mock_runtime("x").await;
        let facade = facade_with_runtime(&server).await;
        let app = crate::api::router(facade);

        let req = Request::post("/router/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"input": "hi", "force_model": "not a ref"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_routing_returns_structured_502() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{ "name": "qwen3-4b" }],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(401).set_body_string("denied"))
            .mount(&server)
            .await;

        // A local-only chain keeps the failure contained to the mock.
        let yaml = format!(
            r#"
            models:
              local:
                endpoint: {uri}
                kind: ollama
                model: qwen3-4b
              cloud:
                provider: anthropic
                model: claude-sonnet-4
            fallback:
              chain: ["local"]
            executor:
              max_attempts: 2
              base_delay_ms: 5
              request_timeout_ms: 5000
              deadline_ms: 8000
            "#,
            uri = server.uri()
        );
        let config: Arc<crate::config::Config> = Arc::new(serde_yaml::from_str(&yaml).unwrap());
        let registry = Arc::new(crate::registry::Registry::new(None));
        registry.refresh(&config).await;
        let store = Arc::new(crate::store::ConversationStore::open_in_memory().unwrap());
        let facade = Arc::new(RouterFacade::new(
            config,
            std::path::PathBuf::from("config.yaml"),
            registry,
            store,
        ));
        let app = crate::api::router(facade);

        let req = Request::post("/router/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"input": "will fail"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        let failures = json["failures"].as_array().unwrap();
        assert!(!failures.is_empty());
        assert_eq!(failures[0]["error_kind"], "auth");
    }

    #[tokio::test]
    async fn stats_exposes_counters() {
        let server = mock_runtime("counted").await;
        let facade = facade_with_runtime(&server).await;
        let app = crate::api::router(Arc::clone(&facade));

        let req = Request::post("/router/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"input": "count me"}"#))
            .unwrap();
        app.clone().oneshot(req).await.unwrap();

        let resp = app
            .oneshot(Request::get("/router/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["stats"]["total_requests"], 1);
        assert_eq!(json["stats"]["local_used"], 1);
    }

    #[tokio::test]
    async fn scan_returns_202_and_refreshes_in_background() {
        let server = mock_runtime("x").await;
        let facade = facade_with_runtime(&server).await;
        let app = crate::api::router(Arc::clone(&facade));

        let resp = app
            .oneshot(Request::post("/models/scan").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn detected_lists_registry_contents() {
        let server = mock_runtime("x").await;
        let facade = facade_with_runtime(&server).await;
        let app = crate::api::router(facade);

        let resp = app
            .oneshot(Request::get("/models/detected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["cache_valid"], true);
        let models = json["models"].as_array().unwrap();
        assert!(models.iter().any(|m| m["ref"] == "local:qwen3-4b"));
    }

    #[tokio::test]
    async fn healthz_always_ok() {
        let server = mock_runtime("x").await;
        let facade = facade_with_runtime(&server).await;
        let app = crate::api::router(facade);

        let resp = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

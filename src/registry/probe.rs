//! Runtime discovery probes.
//!
//! A probe speaks one runtime's "list models" dialect over HTTP and returns a
//! normalized report. Probes are pure: they never touch shared state, so the
//! registry can run them concurrently and decide what to do with the results.
//!
//! Every OpenAI-compatible runtime (LM Studio, llama.cpp, koboldcpp, Jan,
//! GPT4All, vLLM, and anything generic) answers `GET /v1/models`; Ollama
//! answers its native `GET /api/tags`.

use chrono::{DateTime, Utc};
use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RuntimeKind;

/// Maximum probes in flight at once. Probing sits on the startup and refresh
/// critical path, so fan-out is bounded rather than unbounded.
const MAX_IN_FLIGHT: usize = 8;

/// A local LLM endpoint as the registry tracks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub kind: RuntimeKind,
    pub base_url: String,
    pub reachable: bool,
    pub last_probed_at: DateTime<Utc>,
}

/// Why a probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeFailure {
    ConnectionRefused,
    Timeout,
    /// Non-2xx status or a body the dialect parser could not understand.
    BadResponse,
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ConnectionRefused => "connection-refused",
            Self::Timeout => "timeout",
            Self::BadResponse => "bad-response",
        })
    }
}

/// A model as reported by a runtime, before the registry enriches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStub {
    pub id: String,
    pub display_name: String,
    pub capabilities: Vec<Capability>,
}

/// What a model can do, inferred from its id when the runtime doesn't say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Vision,
    Reasoning,
    Tools,
}

/// Outcome of probing one endpoint.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub kind: RuntimeKind,
    pub base_url: String,
    pub reachable: bool,
    pub models: Vec<ModelStub>,
    pub probed_at: DateTime<Utc>,
    pub failure: Option<ProbeFailure>,
}

impl ProbeReport {
    fn failed(kind: RuntimeKind, base_url: &str, failure: ProbeFailure) -> Self {
        Self {
            kind,
            base_url: base_url.to_string(),
            reachable: false,
            models: Vec::new(),
            probed_at: Utc::now(),
            failure: Some(failure),
        }
    }

    pub fn descriptor(&self) -> RuntimeDescriptor {
        RuntimeDescriptor {
            kind: self.kind,
            base_url: self.base_url.clone(),
            reachable: self.reachable,
            last_probed_at: self.probed_at,
        }
    }
}

/// Probe one runtime endpoint for its loaded models.
pub async fn probe(
    client: &reqwest::Client,
    kind: RuntimeKind,
    base_url: &str,
    timeout: std::time::Duration,
) -> ProbeReport {
    let url = match kind {
        RuntimeKind::Ollama => format!("{base_url}/api/tags"),
        _ => format!("{base_url}/v1/models"),
    };

    let response = match client.get(&url).timeout(timeout).send().await {
        Ok(r) => r,
        Err(e) => {
            let failure = if e.is_timeout() {
                ProbeFailure::Timeout
            } else {
                ProbeFailure::ConnectionRefused
            };
            debug!(%url, %failure, "probe failed");
            return ProbeReport::failed(kind, base_url, failure);
        }
    };

    if !response.status().is_success() {
        debug!(%url, status = %response.status(), "probe got non-2xx");
        return ProbeReport::failed(kind, base_url, ProbeFailure::BadResponse);
    }

    let body: Value = match response.json().await {
        Ok(v) => v,
        Err(_) => return ProbeReport::failed(kind, base_url, ProbeFailure::BadResponse),
    };

    let models = match parse_model_list(kind, &body) {
        Some(m) => m,
        None => return ProbeReport::failed(kind, base_url, ProbeFailure::BadResponse),
    };

    ProbeReport {
        kind,
        base_url: base_url.to_string(),
        reachable: true,
        models,
        probed_at: Utc::now(),
        failure: None,
    }
}

/// Probe many endpoints concurrently, at most [`MAX_IN_FLIGHT`] at a time.
/// Result order matches input order.
pub async fn probe_all(
    client: &reqwest::Client,
    endpoints: &[(RuntimeKind, String)],
    per_probe_timeout: std::time::Duration,
) -> Vec<ProbeReport> {
    futures_util::stream::iter(endpoints.iter().cloned())
        .map(|(kind, url)| async move { probe(client, kind, &url, per_probe_timeout).await })
        .buffered(MAX_IN_FLIGHT)
        .collect()
        .await
}

/// Normalize a dialect-specific model listing into [`ModelStub`]s.
fn parse_model_list(kind: RuntimeKind, body: &Value) -> Option<Vec<ModelStub>> {
    let ids: Vec<String> = match kind {
        // Ollama: {"models": [{"name": "qwen3:4b", ...}, ...]}
        RuntimeKind::Ollama => body
            .get("models")?
            .as_array()?
            .iter()
            .filter_map(|m| m.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
        // OpenAI dialect: {"object": "list", "data": [{"id": "..."}, ...]}
        _ => body
            .get("data")?
            .as_array()?
            .iter()
            .filter_map(|m| m.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
    };

    Some(
        ids.into_iter()
            .map(|id| ModelStub {
                display_name: display_name_for(&id),
                capabilities: infer_capabilities(&id),
                id,
            })
            .collect(),
    )
}

/// Human-friendly name: strip path-ish prefixes, keep the tag.
fn display_name_for(id: &str) -> String {
    id.rsplit('/').next().unwrap_or(id).to_string()
}

/// Infer capabilities from well-known id substrings. Every model gets `text`.
pub fn infer_capabilities(id: &str) -> Vec<Capability> {
    let lower = id.to_lowercase();
    let mut caps = vec![Capability::Text];
    if lower.contains("vision") || lower.contains("-vl") || lower.contains("vl-")
        || lower.contains("llava") || lower.contains(":vl")
    {
        caps.push(Capability::Vision);
    }
    if lower.contains("r1") || lower.contains("think") || lower.contains("reason") {
        caps.push(Capability::Reasoning);
    }
    if lower.contains("tool") || lower.contains("-fc") {
        caps.push(Capability::Tools);
    }
    caps
}

/// SSRF guard: only loopback hosts and explicitly allow-listed hosts may be
/// probed or routed to. Everything else is dropped by the caller.
pub fn host_allowed(base_url: &str, allowed_hosts: &[String]) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    if host == "localhost" || host == "::1" || host.starts_with("127.") {
        return true;
    }
    if allowed_hosts.iter().any(|h| h == host) {
        return true;
    }
    warn!(%base_url, "endpoint host is neither loopback nor allow-listed — dropping");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    // -----------------------------------------------------------------------
    // Dialect parsing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn openai_dialect_probe_lists_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [{ "id": "qwen3-4b" }, { "id": "llava-7b-vision" }],
            })))
            .mount(&server)
            .await;

        let report = probe(&client(), RuntimeKind::LmStudio, &server.uri(), Duration::from_secs(3)).await;
        assert!(report.reachable);
        assert_eq!(report.models.len(), 2);
        assert_eq!(report.models[0].id, "qwen3-4b");
        assert!(report.models[1].capabilities.contains(&Capability::Vision));
    }

    #[tokio::test]
    async fn ollama_dialect_probe_uses_api_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{ "name": "qwen3:4b" }, { "name": "nomic-embed-text" }],
            })))
            .mount(&server)
            .await;

        let report = probe(&client(), RuntimeKind::Ollama, &server.uri(), Duration::from_secs(3)).await;
        assert!(report.reachable);
        assert_eq!(report.models[0].id, "qwen3:4b");
    }

    #[tokio::test]
    async fn non_2xx_yields_bad_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let report = probe(&client(), RuntimeKind::Vllm, &server.uri(), Duration::from_secs(3)).await;
        assert!(!report.reachable);
        assert_eq!(report.failure, Some(ProbeFailure::BadResponse));
        assert!(report.models.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_yields_bad_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
            .mount(&server)
            .await;

        let report = probe(&client(), RuntimeKind::Jan, &server.uri(), Duration::from_secs(3)).await;
        assert_eq!(report.failure, Some(ProbeFailure::BadResponse));
    }

    #[tokio::test]
    async fn unreachable_endpoint_yields_connection_refused() {
        // Port 1 is essentially never listening.
        let report = probe(
            &client(),
            RuntimeKind::Ollama,
            "http://127.0.0.1:1",
            Duration::from_secs(3),
        )
        .await;
        assert!(!report.reachable);
        assert_eq!(report.failure, Some(ProbeFailure::ConnectionRefused));
    }

    #[tokio::test]
    async fn probe_all_preserves_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .mount(&server)
            .await;

        let endpoints = vec![
            (RuntimeKind::LmStudio, server.uri()),
            (RuntimeKind::Ollama, "http://127.0.0.1:1".to_string()),
            (RuntimeKind::Vllm, server.uri()),
        ];
        let reports = probe_all(&client(), &endpoints, Duration::from_secs(3)).await;
        assert_eq!(reports.len(), 3);
        assert!(reports[0].reachable);
        assert!(!reports[1].reachable);
        assert!(reports[2].reachable);
    }

    // -----------------------------------------------------------------------
    // Capability inference
    // -----------------------------------------------------------------------

    #[test]
    fn every_model_can_do_text() {
        assert!(infer_capabilities("qwen3-4b").contains(&Capability::Text));
    }

    #[test]
    fn vision_inferred_from_id_substrings() {
        assert!(infer_capabilities("llava-7b").contains(&Capability::Vision));
        assert!(infer_capabilities("qwen2.5-vl-7b").contains(&Capability::Vision));
        assert!(infer_capabilities("gemma-vision-2b").contains(&Capability::Vision));
        assert!(!infer_capabilities("qwen3-4b").contains(&Capability::Vision));
    }

    #[test]
    fn reasoning_inferred_from_id_substrings() {
        assert!(infer_capabilities("deepseek-r1-8b").contains(&Capability::Reasoning));
        assert!(infer_capabilities("qwen3-4b-thinking").contains(&Capability::Reasoning));
    }

    // -----------------------------------------------------------------------
    // Host allow-list
    // -----------------------------------------------------------------------

    #[test]
    fn loopback_hosts_are_always_allowed() {
        assert!(host_allowed("http://127.0.0.1:11434", &[]));
        assert!(host_allowed("http://localhost:1234", &[]));
    }

    #[test]
    fn lan_host_requires_allow_list_entry() {
        assert!(!host_allowed("http://gpu-box.lan:8000", &[]));
        assert!(host_allowed(
            "http://gpu-box.lan:8000",
            &["gpu-box.lan".to_string()]
        ));
    }

    #[test]
    fn unparseable_url_is_rejected() {
        assert!(!host_allowed("not a url", &[]));
    }
}

//! Anthropic Messages API adapter.
//!
//! Translates between the router's native request shape and Anthropic's
//! [`/v1/messages`](https://docs.anthropic.com/en/api/messages) API.
//!
//! # Protocol differences handled here
//!
//! | Concern | Router-native | Anthropic |
//! |---|---|---|
//! | System prompt | A message with `role: system` | Top-level `system` field |
//! | Max tokens | Optional | **Required** (`max_tokens`) |
//! | Images | `ChatRequest::image` | `content[]` base64 source block |
//! | Response shape | plain text | `content[].text` blocks |
//! | Auth header | `Authorization: Bearer …` | `x-api-key: …` |

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{classify_http_error, parse_retry_after, ChatRequest, RawCompletion, Role};
use crate::error::{BackendError, ErrorKind};

/// Default max_tokens when the caller omits it. Required by Anthropic;
/// sensible ceiling for most conversational use-cases.
const DEFAULT_MAX_TOKENS: u64 = 8_192;

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Model used for the cheap credential probe.
const PROBE_MODEL: &str = "claude-haiku-4-5";

/// Adapter for the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    /// Build an Anthropic adapter with the given API key.
    pub fn new(base_url: String, timeout_ms: u64, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(&api_key)
                .expect("Anthropic API key contains invalid header characters"),
        );
        headers.insert(
            "anthropic-version",
            header::HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Translate and send to `POST /v1/messages`, then extract the text.
    pub async fn generate(&self, request: &ChatRequest) -> Result<RawCompletion, BackendError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = to_messages_body(request);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                BackendError::new(ErrorKind::from_transport(&e), &self.base_url, e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            let kind = classify_http_error(status, &text);
            return Err(BackendError::new(
                kind,
                &self.base_url,
                format!("HTTP {status}: {text}"),
            )
            .with_retry_after(retry_after));
        }

        let body: Value = response.json().await.map_err(|e| {
            BackendError::new(ErrorKind::MalformedResponse, &self.base_url, e.to_string())
        })?;

        // Responses contain a `content` array of typed blocks; take the first
        // text block. Tool-use blocks are out of scope for the router.
        let text = body["content"]
            .as_array()
            .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
            .and_then(|b| b["text"].as_str())
            .ok_or_else(|| {
                BackendError::new(
                    ErrorKind::MalformedResponse,
                    &self.base_url,
                    "no text block in response content array",
                )
            })?
            .to_string();

        Ok(RawCompletion {
            text,
            tokens_in: body.pointer("/usage/input_tokens").and_then(Value::as_u64),
            tokens_out: body.pointer("/usage/output_tokens").and_then(Value::as_u64),
        })
    }

    /// Probe with a minimal 1-token request. A cheap inference call is the
    /// reliable way to verify auth + connectivity on this API.
    pub async fn validate_credentials(&self) -> bool {
        let probe = json!({
            "model": PROBE_MODEL,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });
        let url = format!("{}/v1/messages", self.base_url);
        match self.client.post(&url).json(&probe).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Convert the router's native request to the Messages body.
///
/// System content moves to the top-level `system` field (multiple system
/// messages are concatenated). An attached image becomes a base64 source
/// block alongside the final user message's text.
fn to_messages_body(request: &ChatRequest) -> Value {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len());
    let last_user = request.messages.iter().rposition(|m| m.role == Role::User);

    for (i, msg) in request.messages.iter().enumerate() {
        match msg.role {
            Role::System => system_parts.push(&msg.content),
            role => {
                let content = match &request.image {
                    Some(image) if Some(i) == last_user => json!([
                        {
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": image.media_type,
                                "data": image.data,
                            },
                        },
                        { "type": "text", "text": msg.content },
                    ]),
                    _ => json!(msg.content),
                };
                messages.push(json!({ "role": role.as_str(), "content": content }));
            }
        }
    }

    let mut body = json!({
        "model": request.model_id,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system_parts.is_empty() {
        body["system"] = Value::String(system_parts.join("\n\n"));
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

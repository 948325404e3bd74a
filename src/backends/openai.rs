//! OpenAI-compatible chat completions adapter.
//!
//! Handles every backend that speaks the OpenAI `/v1/chat/completions`
//! protocol — OpenAI itself, OpenRouter, Moonshot, Google's compatibility
//! endpoint, and the local runtimes (LM Studio, llama.cpp, koboldcpp, Jan,
//! GPT4All, vLLM). The request is built from the router's native shape; no
//! passthrough of caller JSON happens here.

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{classify_http_error, parse_retry_after, ChatRequest, RawCompletion, Role};
use crate::error::{BackendError, ErrorKind};

/// Adapter for any OpenAI-compatible backend.
///
/// [`Client`] is cheaply clonable internally (it wraps an `Arc`), so building
/// one per routing attempt has no meaningful overhead.
#[derive(Debug)]
pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
}

impl OpenAiAdapter {
    /// Build an adapter for the given base URL and optional bearer token.
    pub fn new(base_url: String, timeout_ms: u64, api_key: Option<String>) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = format!("Bearer {key}");
            // Panics on invalid header bytes — surfaces misconfiguration at
            // startup, not at request time.
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .expect("API key contains invalid Authorization header characters"),
            );
        }

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

    /// `POST /v1/chat/completions` and extract the generation.
    pub async fn generate(&self, request: &ChatRequest) -> Result<RawCompletion, BackendError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = build_request_body(request);

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

        let text = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BackendError::new(
                    ErrorKind::MalformedResponse,
                    &self.base_url,
                    "no message content in response",
                )
            })?
            .to_string();

        Ok(RawCompletion {
            text,
            tokens_in: body.pointer("/usage/prompt_tokens").and_then(Value::as_u64),
            tokens_out: body.pointer("/usage/completion_tokens").and_then(Value::as_u64),
        })
    }

    /// `GET /v1/models` — succeeds iff the credential (when any) is accepted.
    pub async fn validate_credentials(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match self.client.get(&url).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Assemble the wire body. An attached image turns the final user message
/// into a multi-part content array with a data-URI image block.
fn build_request_body(request: &ChatRequest) -> Value {
    let mut messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();

    if let Some(image) = &request.image {
        if let Some(last_user) = request
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
        {
            let text = request.messages[last_user].content.clone();
            messages[last_user] = json!({
                "role": "user",
                "content": [
                    { "type": "text", "text": text },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", image.media_type, image.data),
                        },
                    },
                ],
            });
        }
    }

    let mut body = json!({
        "model": request.model_id,
        "messages": messages,
        "stream": false,
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

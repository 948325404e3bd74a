//! Ollama adapter.
//!
//! Uses Ollama's native `POST /api/chat` rather than the OpenAI compat layer:
//! the native path reports `prompt_eval_count` / `eval_count` token usage and
//! takes base64 images directly on a message. Health probing uses the root
//! `/` endpoint, which answers `"Ollama is running"`.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use super::{classify_http_error, parse_retry_after, ChatRequest, RawCompletion, Role};
use crate::error::{BackendError, ErrorKind};

/// Adapter for a locally-running Ollama instance. No API key is required for
/// typical local deployments.
#[derive(Debug)]
pub struct OllamaAdapter {
    client: Client,
    base_url: String,
}

impl OllamaAdapter {
    pub fn new(base_url: String, timeout_ms: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `POST /api/chat` with `stream: false` and extract the reply.
    pub async fn generate(&self, request: &ChatRequest) -> Result<RawCompletion, BackendError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = build_chat_body(request);

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
            .pointer("/message/content")
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
            tokens_in: body.get("prompt_eval_count").and_then(Value::as_u64),
            tokens_out: body.get("eval_count").and_then(Value::as_u64),
        })
    }

    /// `GET /` — returns `"Ollama is running"` on a live instance.
    pub async fn validate_credentials(&self) -> bool {
        let url = format!("{}/", self.base_url);
        match self.client.get(&url).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Assemble the native chat body. An attached image rides on the final user
/// message's `images` array.
fn build_chat_body(request: &ChatRequest) -> Value {
    let last_user = request.messages.iter().rposition(|m| m.role == Role::User);
    let messages: Vec<Value> = request
        .messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let mut msg = json!({ "role": m.role.as_str(), "content": m.content });
            if let Some(image) = &request.image {
                if Some(i) == last_user {
                    msg["images"] = json!([image.data]);
                }
            }
            msg
        })
        .collect();

    let mut body = json!({
        "model": request.model_id,
        "messages": messages,
        "stream": false,
    });
    if let Some(temperature) = request.temperature {
        body["options"] = json!({ "temperature": temperature });
    }
    body
}

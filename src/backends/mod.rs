//! Backend adapters and the unified dispatch interface.
//!
//! [`BackendClient`] wraps a concrete provider adapter chosen at construction
//! time from a registry entry. All routing code interacts with the same small
//! API (`generate`, `count_tokens`, `validate_credentials`); protocol
//! differences — schema translation, auth headers, endpoint paths — are fully
//! encapsulated in the adapter modules.
//!
//! Cost accounting happens here, at the adapter boundary: the raw token
//! counts from the provider (or a tiktoken estimate when the provider omits
//! usage) are priced with the configured per-model table and FX rate. Local
//! completions cost zero but still carry the would-have-been cloud cost so
//! the savings statistic has something to add up.

mod anthropic;
mod ollama;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::{
    config::{Config, ModelRef, Pricing, Provider, RuntimeKind},
    error::{BackendError, ErrorKind},
    registry::ModelEntry,
};

/// Message role, shared by the wire format and the conversation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            other => anyhow::bail!("unknown role `{other}`"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
}

/// An attached image, passed through to vision-capable backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// The provider-agnostic request shape adapters translate from.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider-native model id.
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub image: Option<ImagePayload>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
}

impl ChatRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            image: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// What an adapter extracts from a provider response. Token counts are
/// `None` when the provider did not report usage.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub text: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
}

/// The unified response shape handed to the executor.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub text: String,
    pub model_ref: ModelRef,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Actual cost of this completion (zero for local models).
    pub cost: f64,
    /// For local completions: what the default cloud model would have cost.
    pub saved_cost: f64,
}

/// Unified backend client — enum dispatch over concrete provider adapters.
#[derive(Debug)]
pub struct BackendClient {
    adapter: Adapter,
    model_ref: ModelRef,
    pricing: Pricing,
    /// Default cloud pricing, used to compute the savings column for local runs.
    cloud_pricing: Pricing,
    fx_rate: f64,
    is_local: bool,
}

#[derive(Debug)]
enum Adapter {
    OpenAi(OpenAiAdapter),
    Anthropic(AnthropicAdapter),
    Ollama(OllamaAdapter),
}

impl BackendClient {
    /// Build a client for a resolved registry entry.
    ///
    /// # Errors
    /// Returns an `auth` error when a cloud provider's credential is missing —
    /// this is terminal and never retried.
    pub fn for_entry(
        entry: &ModelEntry,
        config: &Config,
        timeout_ms: u64,
    ) -> Result<Self, BackendError> {
        let backend_name = entry.provider.to_string();
        let adapter = match entry.provider {
            Provider::Local => {
                let runtime = entry.runtime.as_ref().ok_or_else(|| {
                    BackendError::new(
                        ErrorKind::ModelNotLoaded,
                        &backend_name,
                        "local entry has no runtime descriptor",
                    )
                })?;
                match runtime.kind {
                    RuntimeKind::Ollama => {
                        Adapter::Ollama(OllamaAdapter::new(runtime.base_url.clone(), timeout_ms))
                    }
                    _ => Adapter::OpenAi(OpenAiAdapter::new(
                        runtime.base_url.clone(),
                        timeout_ms,
                        None,
                    )),
                }
            }
            Provider::Anthropic => {
                let key = require_key(entry.provider)?;
                Adapter::Anthropic(AnthropicAdapter::new(
                    cloud_base_url(entry, config),
                    timeout_ms,
                    key,
                ))
            }
            Provider::OpenAi | Provider::OpenRouter | Provider::Moonshot | Provider::Google => {
                let key = require_key(entry.provider)?;
                Adapter::OpenAi(OpenAiAdapter::new(
                    cloud_base_url(entry, config),
                    timeout_ms,
                    Some(key),
                ))
            }
        };

        let cloud_pricing = config
            .pricing_for(&config.models.cloud.model)
            .copied()
            .unwrap_or(Pricing { input: 3.0, output: 15.0 });

        Ok(Self {
            adapter,
            model_ref: entry.model_ref(),
            pricing: entry.pricing,
            cloud_pricing,
            fx_rate: config.cost.fx_rate,
            is_local: entry.is_local(),
        })
    }

    /// Run one generation against the backend and price the result.
    pub async fn generate(&self, request: &ChatRequest) -> Result<Completion, BackendError> {
        let raw = match &self.adapter {
            Adapter::OpenAi(a) => a.generate(request).await?,
            Adapter::Anthropic(a) => a.generate(request).await?,
            Adapter::Ollama(a) => a.generate(request).await?,
        };

        let tokens_in = raw
            .tokens_in
            .unwrap_or_else(|| estimate_request_tokens(request));
        let tokens_out = raw
            .tokens_out
            .unwrap_or_else(|| count_tokens(&raw.text) as u64);

        let (cost, saved_cost) = if self.is_local {
            (0.0, price(tokens_in, tokens_out, &self.cloud_pricing) * self.fx_rate)
        } else {
            (price(tokens_in, tokens_out, &self.pricing) * self.fx_rate, 0.0)
        };

        Ok(Completion {
            text: raw.text,
            model_ref: self.model_ref.clone(),
            tokens_in,
            tokens_out,
            cost,
            saved_cost,
        })
    }

    /// Cheaply verify that the backend accepts our credentials.
    pub async fn validate_credentials(&self) -> bool {
        match &self.adapter {
            Adapter::OpenAi(a) => a.validate_credentials().await,
            Adapter::Anthropic(a) => a.validate_credentials().await,
            Adapter::Ollama(a) => a.validate_credentials().await,
        }
    }
}

fn require_key(provider: Provider) -> Result<String, BackendError> {
    provider.api_key().ok_or_else(|| {
        BackendError::new(
            ErrorKind::Auth,
            provider.to_string(),
            format!(
                "no API key; set the {} environment variable",
                provider.api_key_env().unwrap_or("provider key")
            ),
        )
    })
}

/// Base URL for a cloud entry: the configured default-cloud override when
/// this entry is the default cloud model, otherwise the provider's own URL.
fn cloud_base_url(entry: &ModelEntry, config: &Config) -> String {
    let cloud = &config.models.cloud;
    if entry.provider == cloud.provider && entry.id == cloud.model {
        if let Some(endpoint) = &cloud.endpoint {
            return endpoint.trim_end_matches('/').to_string();
        }
    }
    entry
        .provider
        .default_base_url()
        .expect("cloud provider has a default base URL")
        .to_string()
}

fn price(tokens_in: u64, tokens_out: u64, pricing: &Pricing) -> f64 {
    (tokens_in as f64 / 1e6) * pricing.input + (tokens_out as f64 / 1e6) * pricing.output
}

/// Token count for a text, via the shared tiktoken encoder.
///
/// The cl100k encoding is an approximation for non-OpenAI models; it is only
/// used when the provider response omits usage numbers.
pub fn count_tokens(text: &str) -> usize {
    static ENCODER: OnceLock<tiktoken_rs::CoreBPE> = OnceLock::new();
    let bpe = ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k tables load"));
    bpe.encode_with_special_tokens(text).len()
}

fn estimate_request_tokens(request: &ChatRequest) -> u64 {
    request
        .messages
        .iter()
        .map(|m| count_tokens(&m.content) as u64 + 4)
        .sum()
}

/// Refine an HTTP error using the response body, catching the provider-specific
/// phrasings for context overflow and missing models.
pub(crate) fn classify_http_error(status: reqwest::StatusCode, body: &str) -> ErrorKind {
    let lower = body.to_lowercase();
    if lower.contains("context length")
        || lower.contains("context_length")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
    {
        return ErrorKind::ContextTooLarge;
    }
    if status == reqwest::StatusCode::NOT_FOUND
        && (lower.contains("model") && (lower.contains("not found") || lower.contains("no such")))
    {
        return ErrorKind::ModelNotLoaded;
    }
    ErrorKind::from_status(status)
}

/// Parse a `Retry-After` header value (seconds form only).
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

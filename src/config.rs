//! Configuration types for llm-router.
//!
//! Config is loaded once at startup from a YAML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. Environment variables
//! override the file for deployment-specific values (bind address, storage
//! path, CORS origins, rate limiting); provider credentials are only ever
//! read from the environment.
//!
//! # Example
//! ```yaml
//! models:
//!   local:
//!     endpoint: http://127.0.0.1:11434
//!     kind: ollama
//!     model: qwen3-4b
//!   cloud:
//!     provider: anthropic
//!     model: claude-sonnet-4
//! routing:
//!   hard_rules:
//!     - triggers: ["見積", "estimate"]
//!       model: "anthropic:claude-sonnet-4"
//!       reason: "cost analysis needs the strong model"
//! fallback:
//!   chain: ["local", "cloud"]
//! ```

use std::{collections::HashMap, path::{Path, PathBuf}, str::FromStr};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which party hosts a model.
///
/// `Local` entries live on a runtime from the scanner's endpoint list; the
/// cloud variants each map to a backend adapter and a credential env var.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Local,
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Google,
    OpenRouter,
    Moonshot,
}

impl Provider {
    /// Name of the environment variable holding this provider's API key.
    pub fn api_key_env(self) -> Option<&'static str> {
        match self {
            Self::Local => None,
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Google => Some("GOOGLE_API_KEY"),
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Moonshot => Some("MOONSHOT_API_KEY"),
        }
    }

    /// Resolve the API key from the environment. `None` for local models and
    /// for cloud providers whose variable is unset or empty.
    pub fn api_key(self) -> Option<String> {
        self.api_key_env()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }

    /// Default API base URL for cloud providers.
    pub fn default_base_url(self) -> Option<&'static str> {
        match self {
            Self::Local => None,
            Self::Anthropic => Some("https://api.anthropic.com"),
            Self::OpenAi => Some("https://api.openai.com"),
            Self::Google => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            Self::OpenRouter => Some("https://openrouter.ai/api"),
            Self::Moonshot => Some("https://api.moonshot.ai"),
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Google => "google",
            Self::OpenRouter => "openrouter",
            Self::Moonshot => "moonshot",
        })
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "local" => Self::Local,
            "anthropic" => Self::Anthropic,
            "openai" => Self::OpenAi,
            "google" => Self::Google,
            "openrouter" => Self::OpenRouter,
            "moonshot" => Self::Moonshot,
            other => anyhow::bail!("unknown provider `{other}`"),
        })
    }
}

/// A reference to a model, as written in config files and API requests.
///
/// Three forms:
/// - `local` — the first reachable local entry (preferring the configured id)
/// - `cloud` or `claude` — the configured default cloud entry
/// - `provider:id` — an exact entry, e.g. `anthropic:claude-sonnet-4`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelRef {
    Local,
    Cloud,
    Exact { provider: Provider, id: String },
}

impl ModelRef {
    pub fn exact(provider: Provider, id: impl Into<String>) -> Self {
        Self::Exact { provider, id: id.into() }
    }

    /// Whether the reference can only resolve to a local model.
    pub fn is_local_hint(&self) -> bool {
        match self {
            Self::Local => true,
            Self::Cloud => false,
            Self::Exact { provider, .. } => provider.is_local(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Cloud => f.write_str("cloud"),
            Self::Exact { provider, id } => write!(f, "{provider}:{id}"),
        }
    }
}

impl FromStr for ModelRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => anyhow::bail!("empty model reference"),
            "local" => Ok(Self::Local),
            "cloud" | "claude" => Ok(Self::Cloud),
            other => match other.split_once(':') {
                Some((provider, id)) if !id.is_empty() => Ok(Self::Exact {
                    provider: provider.parse()?,
                    id: id.to_string(),
                }),
                _ => anyhow::bail!(
                    "model reference `{other}` is neither `local`, `cloud`, nor `provider:id`"
                ),
            },
        }
    }
}

impl Serialize for ModelRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModelRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Runtime dialects the probe can speak.
///
/// Everything except `Ollama` exposes an OpenAI-style `GET /v1/models`;
/// Ollama uses its native `GET /api/tags`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    #[serde(rename = "lmstudio")]
    LmStudio,
    Ollama,
    #[serde(rename = "llamacpp")]
    LlamaCpp,
    #[serde(rename = "koboldcpp")]
    KoboldCpp,
    Jan,
    #[serde(rename = "gpt4all")]
    Gpt4All,
    Vllm,
    #[default]
    #[serde(rename = "generic-openai")]
    GenericOpenai,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::LmStudio => "lmstudio",
            Self::Ollama => "ollama",
            Self::LlamaCpp => "llamacpp",
            Self::KoboldCpp => "koboldcpp",
            Self::Jan => "jan",
            Self::Gpt4All => "gpt4all",
            Self::Vllm => "vllm",
            Self::GenericOpenai => "generic-openai",
        })
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub models: ModelsConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    pub fallback: FallbackConfig,

    #[serde(default)]
    pub cost: CostConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Config {
    /// Load, apply environment overrides, and validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&content).context("parsing config YAML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override the file for deployment-shaped values.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("ROUTER_API_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Some(port) = std::env::var("ROUTER_API_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            self.server.port = port;
        }
        if let Ok(path) = std::env::var("ROUTER_STORAGE_PATH") {
            if !path.is_empty() {
                self.database.path = PathBuf::from(path);
            }
        }
        if let Ok(origins) = std::env::var("ROUTER_ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(ms) = std::env::var("ROUTER_RATE_LIMIT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.server.rate_limit_ms = Some(ms);
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.fallback.chain.is_empty(),
            "fallback.chain must contain at least one model reference"
        );

        anyhow::ensure!(
            !self.models.cloud.model.is_empty(),
            "models.cloud.model must not be empty"
        );
        anyhow::ensure!(
            !self.models.cloud.provider.is_local(),
            "models.cloud.provider must be a cloud provider"
        );

        if self.routing.intelligent_routing.enabled {
            let t = self.routing.intelligent_routing.confidence_threshold;
            anyhow::ensure!(
                (0.0..=1.0).contains(&t),
                "routing.intelligent_routing.confidence_threshold must be in [0, 1], got {t}"
            );
            anyhow::ensure!(
                self.routing.intelligent_routing.triage_prompt.contains("{input}"),
                "routing.intelligent_routing.triage_prompt must contain the `{{input}}` placeholder"
            );
        }

        // Warnings, not errors: the config still loads.
        for rule in &self.routing.hard_rules {
            if rule.triggers.is_empty() {
                warn!(model = %rule.model, "hard rule has an empty trigger list and will match every request");
            }
        }
        let known: Vec<&str> = self.referenced_model_ids().collect();
        for model_id in self.cost.pricing.keys() {
            if !known.contains(&model_id.as_str()) {
                warn!(model = %model_id, "pricing entry refers to a model no rule, chain, or default references");
            }
        }

        Ok(())
    }

    /// Every model id named anywhere in the config (for pricing sanity checks).
    fn referenced_model_ids(&self) -> impl Iterator<Item = &str> {
        let chain = self.fallback.chain.iter();
        let rules = self.routing.hard_rules.iter().map(|r| &r.model);
        chain
            .chain(rules)
            .filter_map(|r| match r {
                ModelRef::Exact { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .chain(std::iter::once(self.models.cloud.model.as_str()))
            .chain(self.models.local.model.as_deref())
    }

    /// Pricing per million tokens for a model id, if configured.
    pub fn pricing_for(&self, model_id: &str) -> Option<&Pricing> {
        self.cost.pricing.get(model_id)
    }

    /// The configured default cloud reference.
    pub fn default_cloud_ref(&self) -> ModelRef {
        ModelRef::exact(self.models.cloud.provider, self.models.cloud.model.clone())
    }

    /// Directory holding the store, registry snapshot, priority override, and logs.
    pub fn data_dir(&self) -> PathBuf {
        self.database
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// The fallback chain, after applying the operator-edited
    /// `fallback_priority.json` override when one exists in the data directory.
    ///
    /// An unreadable or unparseable override file is a warning; the config's
    /// own chain is kept.
    pub fn effective_chain(&self) -> Vec<ModelRef> {
        let override_path = self.data_dir().join("fallback_priority.json");
        match std::fs::read_to_string(&override_path) {
            Ok(content) => match serde_json::from_str::<Vec<ModelRef>>(&content) {
                Ok(chain) if !chain.is_empty() => {
                    tracing::info!(path = %override_path.display(), "using operator fallback priority override");
                    chain
                }
                Ok(_) => {
                    warn!(path = %override_path.display(), "fallback priority override is empty — ignoring");
                    self.fallback.chain.clone()
                }
                Err(e) => {
                    warn!(path = %override_path.display(), error = %e, "invalid fallback priority override — ignoring");
                    self.fallback.chain.clone()
                }
            },
            Err(_) => self.fallback.chain.clone(),
        }
    }

    /// Descriptors to probe: the primary local endpoint plus any extra
    /// scanner entries, deduplicated by base URL.
    pub fn runtime_endpoints(&self) -> Vec<(RuntimeKind, String)> {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        let primary = (
            self.models.local.kind,
            self.models.local.endpoint.trim_end_matches('/').to_string(),
        );
        for (kind, url) in std::iter::once(primary).chain(
            self.scanner
                .runtimes
                .iter()
                .map(|r| (r.kind, r.base_url.trim_end_matches('/').to_string())),
        ) {
            if !seen.contains(&url) {
                seen.push(url.clone());
                out.push((kind, url));
            }
        }
        out
    }
}

/// Default local and cloud model selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsConfig {
    pub local: LocalModelConfig,
    pub cloud: CloudModelConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalModelConfig {
    /// Base URL of the primary local runtime.
    #[serde(default = "defaults::local_endpoint")]
    pub endpoint: String,

    /// Dialect spoken by the primary runtime.
    #[serde(default)]
    pub kind: RuntimeKind,

    /// Preferred model id when the runtime has more than one loaded.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudModelConfig {
    pub provider: Provider,
    pub model: String,
    /// Base URL override for the default cloud provider, e.g. a corporate
    /// proxy in front of the vendor API. Unset uses the provider's own URL.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Triage rules.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub hard_rules: Vec<HardRule>,

    #[serde(default)]
    pub intelligent_routing: IntelligentRoutingConfig,
}

/// A deterministic trigger-substring rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HardRule {
    /// Case-sensitive substrings; any match selects this rule.
    /// An empty list makes the rule unconditional (accepted with a warning).
    pub triggers: Vec<String>,
    pub model: ModelRef,
    /// Operator-facing justification, copied into the triage decision.
    pub reason: String,
}

/// Delegated-classifier settings for the soft routing layer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntelligentRoutingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Below this confidence, a local recommendation is upgraded to cloud.
    #[serde(default = "defaults::confidence_threshold")]
    pub confidence_threshold: f64,

    /// Prompt template; `{input}` is replaced with the request text.
    #[serde(default = "defaults::triage_prompt")]
    pub triage_prompt: String,

    /// Which model answers the classification prompt.
    #[serde(default = "defaults::classifier_model")]
    pub classifier_model: ModelRef,

    /// Classifier call timeout in milliseconds.
    #[serde(default = "defaults::classifier_timeout_ms")]
    pub classifier_timeout_ms: u64,
}

impl Default for IntelligentRoutingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: defaults::confidence_threshold(),
            triage_prompt: defaults::triage_prompt(),
            classifier_model: defaults::classifier_model(),
            classifier_timeout_ms: defaults::classifier_timeout_ms(),
        }
    }
}

/// Ordered fallback chain; the first element is the default primary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    pub chain: Vec<ModelRef>,
}

/// Pricing table and display currency.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CostConfig {
    /// model id → price per million tokens.
    #[serde(default)]
    pub pricing: HashMap<String, Pricing>,

    /// Currency multiplier applied to every computed cost.
    #[serde(default = "defaults::fx_rate")]
    pub fx_rate: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
}

impl Pricing {
    pub const ZERO: Pricing = Pricing { input: 0.0, output: 0.0 };

    pub fn is_zero(&self) -> bool {
        self.input == 0.0 && self.output == 0.0
    }
}

/// Runtime discovery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    /// Registry refresh interval in seconds.
    #[serde(default = "defaults::cache_ttl")]
    pub cache_ttl: u64,

    /// Per-probe timeout in milliseconds. Kept short: probes sit on the
    /// startup and refresh critical path.
    #[serde(default = "defaults::probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Additional runtime endpoints beyond `models.local.endpoint`.
    #[serde(default)]
    pub runtimes: Vec<RuntimeEndpoint>,

    /// Non-loopback hosts that may be probed and routed to. Anything else
    /// outside the loopback set is dropped with a warning.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: defaults::cache_ttl(),
            probe_timeout_ms: defaults::probe_timeout_ms(),
            runtimes: Vec::new(),
            allowed_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeEndpoint {
    #[serde(default)]
    pub kind: RuntimeKind,
    pub base_url: String,
}

/// Conversation store location.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "defaults::database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: defaults::database_path() }
    }
}

/// HTTP control-surface settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::host")]
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    /// CORS allow-list. Empty means same-origin only.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Minimum spacing between requests from one source, in milliseconds.
    /// Unset disables the limiter.
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,

    /// Cap on concurrently-executing routed requests. Callers over the limit
    /// get an immediate busy error.
    #[serde(default = "defaults::max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            allowed_origins: Vec::new(),
            rate_limit_ms: None,
            max_concurrent_requests: defaults::max_concurrent_requests(),
        }
    }
}

/// Retry and deadline policy for the fallback executor.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Attempts per chain candidate.
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential backoff base.
    #[serde(default = "defaults::backoff_base")]
    pub backoff_base: f64,

    /// Per-backend-call timeout in milliseconds.
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Whole-request deadline in milliseconds.
    #[serde(default = "defaults::deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            backoff_base: defaults::backoff_base(),
            request_timeout_ms: defaults::request_timeout_ms(),
            deadline_ms: defaults::deadline_ms(),
        }
    }
}

mod defaults {
    use super::ModelRef;
    use std::path::PathBuf;

    pub fn local_endpoint() -> String { "http://127.0.0.1:11434".into() }
    pub fn confidence_threshold() -> f64 { 0.75 }
    pub fn triage_prompt() -> String {
        "Decide whether this request needs a large cloud model or a small local one. \
         Answer as JSON {\"model\": \"local\"|\"cloud\", \"confidence\": 0.0-1.0, \"reason\": \"...\"}.\n\
         Request: {input}"
            .into()
    }
    pub fn classifier_model() -> ModelRef { ModelRef::Local }
    pub fn classifier_timeout_ms() -> u64 { 10_000 }
    pub fn fx_rate() -> f64 { 1.0 }
    pub fn cache_ttl() -> u64 { 300 }
    pub fn probe_timeout_ms() -> u64 { 3_000 }
    pub fn database_path() -> PathBuf { PathBuf::from("data/conversations.db") }
    pub fn host() -> String { "127.0.0.1".into() }
    pub fn port() -> u16 { 8080 }
    pub fn max_concurrent_requests() -> usize { 16 }
    pub fn max_attempts() -> u32 { 3 }
    pub fn base_delay_ms() -> u64 { 1_000 }
    pub fn max_delay_ms() -> u64 { 30_000 }
    pub fn backoff_base() -> f64 { 2.0 }
    pub fn request_timeout_ms() -> u64 { 120_000 }
    pub fn deadline_ms() -> u64 { 300_000 }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn minimal_config() -> Config {
        serde_yaml::from_str(
            r#"
            models:
              local:
                endpoint: http://127.0.0.1:11434
                kind: ollama
                model: qwen3-4b
              cloud:
                provider: anthropic
                model: claude-sonnet-4
            fallback:
              chain: ["local", "cloud"]
            "#,
        )
        .expect("minimal config should parse")
    }

    // -----------------------------------------------------------------------
    // Parsing & validation
    // -----------------------------------------------------------------------

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.yaml");
        let config: Config = serde_yaml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn minimal_config_validates_and_applies_defaults() {
        let config = minimal_config();
        config.validate().expect("should validate");
        assert_eq!(config.scanner.cache_ttl, 300);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_concurrent_requests, 16);
        assert_eq!(config.executor.max_attempts, 3);
        assert!((config.cost.fx_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn validation_rejects_empty_chain() {
        let mut config = minimal_config();
        config.fallback.chain.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_local_as_cloud_provider() {
        let config: Result<Config, _> = serde_yaml::from_str(
            r#"
            models:
              local: { endpoint: "http://127.0.0.1:11434" }
              cloud: { provider: local, model: whatever }
            fallback:
              chain: ["local"]
            "#,
        );
        // Parses, but validation rejects it.
        assert!(config.unwrap().validate().is_err());
    }

    #[test]
    fn validation_rejects_triage_prompt_without_placeholder() {
        let mut config = minimal_config();
        config.routing.intelligent_routing.enabled = true;
        config.routing.intelligent_routing.triage_prompt = "no placeholder here".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_provider_fails_at_parse_time() {
        let result: Result<Config, _> = serde_yaml::from_str(
            r#"
            models:
              local: { endpoint: "http://127.0.0.1:11434" }
              cloud: { provider: frontier-labs, model: x }
            fallback:
              chain: ["local"]
            "#,
        );
        assert!(result.is_err());
    }

    // -----------------------------------------------------------------------
    // ModelRef parsing
    // -----------------------------------------------------------------------

    #[test]
    fn model_ref_parses_all_three_forms() {
        assert_eq!("local".parse::<ModelRef>().unwrap(), ModelRef::Local);
        assert_eq!("cloud".parse::<ModelRef>().unwrap(), ModelRef::Cloud);
        assert_eq!("claude".parse::<ModelRef>().unwrap(), ModelRef::Cloud);
        assert_eq!(
            "anthropic:claude-sonnet-4".parse::<ModelRef>().unwrap(),
            ModelRef::exact(Provider::Anthropic, "claude-sonnet-4")
        );
    }

    #[test]
    fn model_ref_rejects_garbage() {
        assert!("".parse::<ModelRef>().is_err());
        assert!("anthropic:".parse::<ModelRef>().is_err());
        assert!("frontier-labs:gpt-99".parse::<ModelRef>().is_err());
        assert!("justaword".parse::<ModelRef>().is_err());
    }

    #[test]
    fn model_ref_display_round_trips() {
        for s in ["local", "cloud", "anthropic:claude-sonnet-4", "openai:gpt-4o-mini"] {
            let parsed: ModelRef = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn model_ref_id_may_contain_colons() {
        // Ollama tags like `qwen3:4b` produce ids with a colon.
        let parsed: ModelRef = "local:qwen3:4b".parse().unwrap();
        assert_eq!(parsed, ModelRef::exact(Provider::Local, "qwen3:4b"));
    }

    // -----------------------------------------------------------------------
    // Env overrides
    // -----------------------------------------------------------------------

    #[test]
    fn env_overrides_replace_server_and_storage_settings() {
        let mut config = minimal_config();
        // SAFETY: test-local env mutation with unique names.
        unsafe {
            std::env::set_var("ROUTER_API_PORT", "9191");
            std::env::set_var("ROUTER_STORAGE_PATH", "/tmp/router-test/conv.db");
            std::env::set_var("ROUTER_RATE_LIMIT_MS", "250");
        }
        config.apply_env_overrides();
        unsafe {
            std::env::remove_var("ROUTER_API_PORT");
            std::env::remove_var("ROUTER_STORAGE_PATH");
            std::env::remove_var("ROUTER_RATE_LIMIT_MS");
        }
        assert_eq!(config.server.port, 9191);
        assert_eq!(config.database.path, PathBuf::from("/tmp/router-test/conv.db"));
        assert_eq!(config.server.rate_limit_ms, Some(250));
    }

    // -----------------------------------------------------------------------
    // Chain override & endpoints
    // -----------------------------------------------------------------------

    #[test]
    fn effective_chain_uses_config_when_no_override_file() {
        let mut config = minimal_config();
        config.database.path = PathBuf::from("/nonexistent-dir-xyz/conv.db");
        assert_eq!(config.effective_chain(), config.fallback.chain);
    }

    #[test]
    fn effective_chain_prefers_valid_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = minimal_config();
        config.database.path = dir.path().join("conv.db");
        std::fs::write(
            dir.path().join("fallback_priority.json"),
            r#"["cloud", "local"]"#,
        )
        .unwrap();
        assert_eq!(config.effective_chain(), vec![ModelRef::Cloud, ModelRef::Local]);
    }

    #[test]
    fn effective_chain_ignores_corrupt_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = minimal_config();
        config.database.path = dir.path().join("conv.db");
        std::fs::write(dir.path().join("fallback_priority.json"), "{not json").unwrap();
        assert_eq!(config.effective_chain(), config.fallback.chain);
    }

    #[test]
    fn runtime_endpoints_dedupe_by_url() {
        let mut config = minimal_config();
        config.scanner.runtimes.push(RuntimeEndpoint {
            kind: RuntimeKind::Ollama,
            base_url: "http://127.0.0.1:11434/".into(), // same as primary, trailing slash
        });
        config.scanner.runtimes.push(RuntimeEndpoint {
            kind: RuntimeKind::LmStudio,
            base_url: "http://127.0.0.1:1234".into(),
        });
        let endpoints = config.runtime_endpoints();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].1, "http://127.0.0.1:11434");
        assert_eq!(endpoints[1].1, "http://127.0.0.1:1234");
    }
}

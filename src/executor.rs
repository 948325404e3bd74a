//! The fallback executor — drives the priority chain.
//!
//! Given a preferred model reference, the executor builds the try order
//! `[preferred] ++ (chain \ {preferred})` and walks it. Within each
//! candidate a retry loop handles transient failures with exponential
//! backoff and ±25% jitter; rate-limit responses override the computed
//! delay with the server's `Retry-After`. Terminal errors (auth, other 4xx)
//! abort a candidate immediately and step the chain.
//!
//! Every individual try produces an [`AttemptRecord`]; nothing is swallowed.
//! A candidate whose retries are exhausted gets a final `terminal-failure`
//! record, so on a fully-failed request every candidate's last record is
//! terminal and the caller can render the complete failure story.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    backends::{BackendClient, ChatMessage, Completion, ImagePayload, ChatRequest},
    config::{Config, ModelRef},
    error::{BackendError, ErrorKind},
    registry::RegistrySnapshot,
};

/// Outcome of one execution try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    /// Failed, but the retry loop tried (or would have tried) again.
    TransientFailure,
    /// Failed for good on this candidate: non-retryable error, or retries
    /// exhausted.
    TerminalFailure,
    /// The reference did not resolve against the registry.
    Skipped,
}

/// One execution try against one backend.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub model_ref: ModelRef,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

impl AttemptRecord {
    fn skipped(model_ref: ModelRef, detail: String) -> Self {
        Self {
            model_ref,
            started_at: Utc::now(),
            elapsed_ms: 0,
            outcome: AttemptOutcome::Skipped,
            error_kind: None,
            error: Some(detail),
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
        }
    }

    fn failure(
        model_ref: ModelRef,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
        outcome: AttemptOutcome,
        err: &BackendError,
    ) -> Self {
        Self {
            model_ref,
            started_at,
            elapsed_ms,
            outcome,
            error_kind: Some(err.kind),
            error: Some(err.to_string()),
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
        }
    }
}

/// What the executor hands back to the facade.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    /// Reference of the successful attempt, if any.
    pub model_ref: Option<ModelRef>,
    pub response: Option<Completion>,
    pub attempts: Vec<AttemptRecord>,
    /// True when the preferred target was local but a cloud backend ended up
    /// answering — the caller may want to tell the operator money was spent.
    pub cost_warning: bool,
}

impl RequestOutcome {
    pub fn succeeded(&self) -> bool {
        self.model_ref.is_some()
    }

    /// True when every chain step was skipped — there was nothing to try.
    pub fn nothing_available(&self) -> bool {
        self.attempts.iter().all(|a| a.outcome == AttemptOutcome::Skipped)
    }
}

/// The conversation content to run, independent of any one backend.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub messages: Vec<ChatMessage>,
    pub image: Option<ImagePayload>,
}

/// Walk the chain, retrying transient failures per candidate.
///
/// `deadline` bounds the whole walk: when it passes, the current attempt is
/// the last — a `deadline-exceeded` terminal record is appended and the
/// remaining candidates are not tried.
pub async fn execute(
    request: &ExecRequest,
    preferred: &ModelRef,
    deadline: Instant,
    config: &Config,
    snapshot: &RegistrySnapshot,
) -> RequestOutcome {
    let mut attempts: Vec<AttemptRecord> = Vec::new();

    for candidate in try_order(preferred, &config.effective_chain()) {
        let Some(entry) = snapshot.lookup(&candidate) else {
            warn!(model = %candidate, "chain reference does not resolve — skipping");
            attempts.push(AttemptRecord::skipped(
                candidate.clone(),
                "unresolved model reference".into(),
            ));
            continue;
        };

        let client = match BackendClient::for_entry(entry, config, config.executor.request_timeout_ms) {
            Ok(c) => c,
            Err(e) => {
                attempts.push(AttemptRecord::failure(
                    entry.model_ref(),
                    Utc::now(),
                    0,
                    AttemptOutcome::TerminalFailure,
                    &e,
                ));
                continue;
            }
        };

        let chat = ChatRequest {
            model_id: entry.id.clone(),
            messages: request.messages.clone(),
            image: request.image.clone(),
            max_tokens: None,
            temperature: None,
        };

        match run_candidate(&client, &chat, entry.model_ref(), deadline, config, &mut attempts).await {
            CandidateResult::Success(completion) => {
                let had_failures = attempts
                    .iter()
                    .any(|a| matches!(a.outcome, AttemptOutcome::TransientFailure | AttemptOutcome::TerminalFailure));
                let cost_warning = had_failures
                    && preferred.is_local_hint()
                    && !completion.model_ref.is_local_hint();
                let model_ref = completion.model_ref.clone();
                return RequestOutcome {
                    model_ref: Some(model_ref),
                    response: Some(completion),
                    attempts,
                    cost_warning,
                };
            }
            CandidateResult::Exhausted => continue,
            CandidateResult::DeadlineExceeded => break,
        }
    }

    RequestOutcome {
        model_ref: None,
        response: None,
        attempts,
        cost_warning: false,
    }
}

enum CandidateResult {
    Success(Completion),
    /// This candidate failed for good; try the next one.
    Exhausted,
    /// The request deadline passed; stop the chain walk entirely.
    DeadlineExceeded,
}

/// The per-candidate retry loop.
async fn run_candidate(
    client: &BackendClient,
    chat: &ChatRequest,
    model_ref: ModelRef,
    deadline: Instant,
    config: &Config,
    attempts: &mut Vec<AttemptRecord>,
) -> CandidateResult {
    let max_attempts = config.executor.max_attempts.max(1);
    let mut prior: u32 = 0;

    loop {
        let now = Instant::now();
        if now >= deadline {
            attempts.push(AttemptRecord::failure(
                model_ref.clone(),
                Utc::now(),
                0,
                AttemptOutcome::TerminalFailure,
                &BackendError::new(
                    ErrorKind::DeadlineExceeded,
                    model_ref.to_string(),
                    "request deadline exceeded before attempt",
                ),
            ));
            return CandidateResult::DeadlineExceeded;
        }

        let started_at = Utc::now();
        let t0 = std::time::Instant::now();
        let remaining = deadline - now;

        // The adapter carries its own per-call timeout; this outer timeout
        // interrupts an in-flight call when the request deadline lands first.
        let result = match tokio::time::timeout(remaining, client.generate(chat)).await {
            Ok(r) => r,
            Err(_) => {
                let elapsed_ms = t0.elapsed().as_millis() as u64;
                attempts.push(AttemptRecord::failure(
                    model_ref.clone(),
                    started_at,
                    elapsed_ms,
                    AttemptOutcome::TerminalFailure,
                    &BackendError::new(
                        ErrorKind::DeadlineExceeded,
                        model_ref.to_string(),
                        "request deadline exceeded mid-attempt",
                    ),
                ));
                return CandidateResult::DeadlineExceeded;
            }
        };
        let elapsed_ms = t0.elapsed().as_millis() as u64;

        match result {
            Ok(completion) => {
                attempts.push(AttemptRecord {
                    model_ref: model_ref.clone(),
                    started_at,
                    elapsed_ms,
                    outcome: AttemptOutcome::Success,
                    error_kind: None,
                    error: None,
                    tokens_in: completion.tokens_in,
                    tokens_out: completion.tokens_out,
                    cost: completion.cost,
                });
                return CandidateResult::Success(completion);
            }
            Err(err) => {
                let retryable = err.kind.is_retryable(prior) && prior + 1 < max_attempts;
                if !retryable {
                    debug!(model = %model_ref, kind = %err.kind, "candidate failed terminally");
                    attempts.push(AttemptRecord::failure(
                        model_ref.clone(),
                        started_at,
                        elapsed_ms,
                        AttemptOutcome::TerminalFailure,
                        &err,
                    ));
                    return CandidateResult::Exhausted;
                }

                attempts.push(AttemptRecord::failure(
                    model_ref.clone(),
                    started_at,
                    elapsed_ms,
                    AttemptOutcome::TransientFailure,
                    &err,
                ));

                let delay = err
                    .retry_after
                    .map(std::time::Duration::from_secs)
                    .unwrap_or_else(|| backoff_delay(config, prior));
                debug!(model = %model_ref, attempt = prior + 1, ?delay, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                prior += 1;
            }
        }
    }
}

/// `[preferred] ++ (chain \ {preferred})`.
fn try_order(preferred: &ModelRef, chain: &[ModelRef]) -> Vec<ModelRef> {
    let mut order = vec![preferred.clone()];
    for link in chain {
        if link != preferred {
            order.push(link.clone());
        }
    }
    order
}

/// `min(base_delay × base^attempt, max_delay)`, jittered ±25%.
fn backoff_delay(config: &Config, attempt: u32) -> std::time::Duration {
    let exec = &config.executor;
    let exp = exec.base_delay_ms as f64 * exec.backoff_base.powi(attempt as i32);
    let capped = exp.min(exec.max_delay_ms as f64);
    let jitter = 0.75 + rand::random::<f64>() * 0.5;
    std::time::Duration::from_millis((capped * jitter).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Pricing, Provider, RuntimeKind};
    use crate::registry::{probe::{Capability, RuntimeDescriptor}, ModelEntry, RegistrySnapshot};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> Config {
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
            cost:
              pricing:
                claude-sonnet-4: { input: 3.0, output: 15.0 }
            executor:
              max_attempts: 3
              base_delay_ms: 5
              max_delay_ms: 20
              request_timeout_ms: 5000
              deadline_ms: 10000
            "#,
        )
        .unwrap()
    }

    fn local_entry(base_url: &str) -> ModelEntry {
        ModelEntry {
            id: "qwen3-4b".into(),
            display_name: "qwen3-4b".into(),
            provider: Provider::Local,
            runtime: Some(RuntimeDescriptor {
                kind: RuntimeKind::LmStudio,
                base_url: base_url.to_string(),
                reachable: true,
                last_probed_at: Utc::now(),
            }),
            capabilities: vec![Capability::Text],
            context_tokens: 8192,
            pricing: Pricing::ZERO,
        }
    }

    /// A "cloud" entry that is actually served by a wiremock OpenAI endpoint.
    /// Moonshot speaks the OpenAI dialect, so its adapter accepts any base —
    /// we point the provider default at the mock via a local runtime instead.
    fn cloud_entry_backed_by(base_url: &str) -> ModelEntry {
        // Cloud adapters dial the provider's fixed base URL, which a unit test
        // cannot redirect; model the cloud step as a second local runtime with
        // a distinct id. The executor only sees ModelRef + adapter behavior.
        ModelEntry {
            id: "cloud-stand-in".into(),
            display_name: "cloud-stand-in".into(),
            provider: Provider::Local,
            runtime: Some(RuntimeDescriptor {
                kind: RuntimeKind::LmStudio,
                base_url: base_url.to_string(),
                reachable: true,
                last_probed_at: Utc::now(),
            }),
            capabilities: vec![Capability::Text],
            context_tokens: 200_000,
            pricing: Pricing::ZERO,
        }
    }

    fn snapshot_with(entries: Vec<ModelEntry>) -> RegistrySnapshot {
        let mut map = BTreeMap::new();
        for e in entries {
            map.insert(e.key(), e);
        }
        RegistrySnapshot {
            entries: map,
            last_scan_at: Utc::now(),
            ttl_seconds: 300,
            preferred_local_id: Some("qwen3-4b".into()),
            default_cloud_key: "anthropic:claude-sonnet-4".into(),
        }
    }

    fn exec_request() -> ExecRequest {
        ExecRequest {
            messages: vec![ChatMessage::user("hello")],
            image: None,
        }
    }

    fn deadline(config: &Config) -> Instant {
        Instant::now() + Duration::from_millis(config.executor.deadline_ms)
    }

    async fn mock_success(server: &MockServer, content: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": content } }],
                "usage": { "prompt_tokens": 5, "completion_tokens": 7 },
            })))
            .mount(server)
            .await;
    }

    // -----------------------------------------------------------------------
    // Straight-through success
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn preferred_success_is_a_single_attempt() {
        let server = MockServer::start().await;
        mock_success(&server, "direct answer").await;

        let config = fast_config();
        let snapshot = snapshot_with(vec![local_entry(&server.uri())]);
        let preferred: ModelRef = "local:qwen3-4b".parse().unwrap();

        let outcome = execute(&exec_request(), &preferred, deadline(&config), &config, &snapshot).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Success);
        assert!(!outcome.cost_warning);
        assert_eq!(outcome.response.unwrap().text, "direct answer");
    }

    // -----------------------------------------------------------------------
    // Chain fallback on 500
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn local_500s_exhaust_retries_then_cloud_succeeds() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
            .expect(3)
            .mount(&failing)
            .await;

        let succeeding = MockServer::start().await;
        mock_success(&succeeding, "cloud answer").await;

        let mut config = fast_config();
        config.fallback.chain =
            vec!["local:qwen3-4b".parse().unwrap(), "local:cloud-stand-in".parse().unwrap()];
        let snapshot = snapshot_with(vec![
            local_entry(&failing.uri()),
            cloud_entry_backed_by(&succeeding.uri()),
        ]);

        let preferred: ModelRef = "local:qwen3-4b".parse().unwrap();
        let outcome = execute(&exec_request(), &preferred, deadline(&config), &config, &snapshot).await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.model_ref, Some("local:cloud-stand-in".parse().unwrap()));
        // 2 transient + 1 terminal against the preferred, then 1 success.
        assert_eq!(outcome.attempts.len(), 4);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::TransientFailure);
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::TransientFailure);
        assert_eq!(outcome.attempts[2].outcome, AttemptOutcome::TerminalFailure);
        assert_eq!(outcome.attempts[2].error_kind, Some(ErrorKind::Http5xx));
        assert_eq!(outcome.attempts[3].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn cost_warning_set_when_local_preference_lands_on_cloud() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing)
            .await;

        let cloud_mock = MockServer::start().await;
        mock_success(&cloud_mock, "expensive but working").await;

        // Moonshot speaks the OpenAI dialect; pointing the default-cloud
        // endpoint override at the mock makes the cloud step reachable.
        // SAFETY: test-local env mutation.
        unsafe { std::env::set_var("MOONSHOT_API_KEY", "test-key-cost-warning") };
        let mut config = fast_config();
        config.models.cloud = crate::config::CloudModelConfig {
            provider: Provider::Moonshot,
            model: "kimi-k2".into(),
            endpoint: Some(cloud_mock.uri()),
        };
        config.fallback.chain = vec![ModelRef::Local, ModelRef::Cloud];

        let cloud_entry = ModelEntry {
            id: "kimi-k2".into(),
            display_name: "kimi-k2".into(),
            provider: Provider::Moonshot,
            runtime: None,
            capabilities: vec![Capability::Text],
            context_tokens: 128_000,
            pricing: Pricing { input: 1.0, output: 2.0 },
        };
        let mut snapshot = snapshot_with(vec![local_entry(&failing.uri()), cloud_entry]);
        snapshot.default_cloud_key = "moonshot:kimi-k2".into();

        let outcome =
            execute(&exec_request(), &ModelRef::Local, deadline(&config), &config, &snapshot).await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.model_ref, Some("moonshot:kimi-k2".parse().unwrap()));
        assert!(outcome.cost_warning, "local→cloud fallback must raise the cost warning");
        // Cloud completion is priced: 5 in + 7 out at 1.0/2.0 per M tokens.
        let response = outcome.response.unwrap();
        assert!(response.cost > 0.0);
        assert_eq!(response.saved_cost, 0.0);
    }

    // -----------------------------------------------------------------------
    // Rate limiting honors Retry-After
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn retry_after_header_overrides_backoff_delay() {
        let server = MockServer::start().await;
        // First call: 429 with Retry-After: 2. Later calls: success.
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "2")
                    .set_body_string("slow down"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mock_success(&server, "after the wait").await;

        let config = fast_config();
        let snapshot = snapshot_with(vec![local_entry(&server.uri())]);
        let preferred: ModelRef = "local:qwen3-4b".parse().unwrap();

        let t0 = std::time::Instant::now();
        let outcome = execute(&exec_request(), &preferred, deadline(&config), &config, &snapshot).await;
        let elapsed = t0.elapsed();

        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].error_kind, Some(ErrorKind::RateLimited));
        assert!(
            elapsed >= Duration::from_secs(2),
            "second attempt must wait out Retry-After, waited {elapsed:?}"
        );
    }

    // -----------------------------------------------------------------------
    // Terminal errors abort the retry loop
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = fast_config();
        config.fallback.chain = vec!["local:qwen3-4b".parse().unwrap()];
        let snapshot = snapshot_with(vec![local_entry(&server.uri())]);
        let preferred: ModelRef = "local:qwen3-4b".parse().unwrap();

        let outcome = execute(&exec_request(), &preferred, deadline(&config), &config, &snapshot).await;
        assert!(!outcome.succeeded());
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::TerminalFailure);
        assert_eq!(outcome.attempts[0].error_kind, Some(ErrorKind::Auth));
    }

    #[tokio::test]
    async fn malformed_body_is_transient_once_then_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let mut config = fast_config();
        config.fallback.chain = vec!["local:qwen3-4b".parse().unwrap()];
        let snapshot = snapshot_with(vec![local_entry(&server.uri())]);
        let preferred: ModelRef = "local:qwen3-4b".parse().unwrap();

        let outcome = execute(&exec_request(), &preferred, deadline(&config), &config, &snapshot).await;
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::TransientFailure);
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::TerminalFailure);
        assert_eq!(outcome.attempts[1].error_kind, Some(ErrorKind::MalformedResponse));
    }

    // -----------------------------------------------------------------------
    // Unresolved references and total failure
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unresolved_reference_is_recorded_as_skipped() {
        let server = MockServer::start().await;
        mock_success(&server, "answer from the resolvable one").await;

        let mut config = fast_config();
        config.fallback.chain = vec![
            "local:ghost-model".parse().unwrap(),
            "local:qwen3-4b".parse().unwrap(),
        ];
        let snapshot = snapshot_with(vec![local_entry(&server.uri())]);
        let preferred: ModelRef = "local:ghost-model".parse().unwrap();

        let outcome = execute(&exec_request(), &preferred, deadline(&config), &config, &snapshot).await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Skipped);
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn empty_registry_yields_all_skipped_outcome() {
        let config = fast_config();
        let snapshot = snapshot_with(vec![]);
        let preferred = ModelRef::Local;

        let outcome = execute(&exec_request(), &preferred, deadline(&config), &config, &snapshot).await;
        assert!(!outcome.succeeded());
        assert!(outcome.nothing_available());
        // preferred + 1 remaining distinct chain entry
        assert_eq!(outcome.attempts.len(), 2);
    }

    #[tokio::test]
    async fn every_candidate_failing_keeps_all_records_in_order() {
        let refused = "http://127.0.0.1:1";
        let auth_fail = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&auth_fail)
            .await;

        let mut config = fast_config();
        config.fallback.chain = vec![
            "local:qwen3-4b".parse().unwrap(),
            "local:cloud-stand-in".parse().unwrap(),
        ];
        let snapshot = snapshot_with(vec![
            local_entry(refused),
            cloud_entry_backed_by(&auth_fail.uri()),
        ]);
        let preferred: ModelRef = "local:qwen3-4b".parse().unwrap();

        let outcome = execute(&exec_request(), &preferred, deadline(&config), &config, &snapshot).await;
        assert!(!outcome.succeeded());
        // Connection-refused retries 3 times (2 transient + terminal), then
        // the auth failure terminates immediately.
        assert_eq!(outcome.attempts.len(), 4);
        let local_records: Vec<_> = outcome
            .attempts
            .iter()
            .filter(|a| a.model_ref == preferred)
            .collect();
        assert_eq!(local_records.last().unwrap().outcome, AttemptOutcome::TerminalFailure);
        assert_eq!(outcome.attempts[3].error_kind, Some(ErrorKind::Auth));
        // Both failures are retained; the chain step did not swallow the
        // original error.
        assert!(outcome.attempts.iter().any(|a| a.error_kind == Some(ErrorKind::ConnectionRefused)));
    }

    // -----------------------------------------------------------------------
    // Deadline
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn deadline_interrupts_inflight_attempt_and_stops_chain() {
        let slow = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_json(json!({ "choices": [] })),
            )
            .mount(&slow)
            .await;

        let never_called = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&never_called)
            .await;

        let mut config = fast_config();
        config.fallback.chain = vec![
            "local:qwen3-4b".parse().unwrap(),
            "local:cloud-stand-in".parse().unwrap(),
        ];
        let snapshot = snapshot_with(vec![
            local_entry(&slow.uri()),
            cloud_entry_backed_by(&never_called.uri()),
        ]);
        let preferred: ModelRef = "local:qwen3-4b".parse().unwrap();

        let t0 = std::time::Instant::now();
        let outcome = execute(
            &exec_request(),
            &preferred,
            Instant::now() + Duration::from_millis(200),
            &config,
            &snapshot,
        )
        .await;

        assert!(t0.elapsed() < Duration::from_secs(2), "deadline must interrupt the call");
        assert!(!outcome.succeeded());
        let last = outcome.attempts.last().unwrap();
        assert_eq!(last.error_kind, Some(ErrorKind::DeadlineExceeded));
        assert_eq!(last.outcome, AttemptOutcome::TerminalFailure);
    }

    // -----------------------------------------------------------------------
    // Try order
    // -----------------------------------------------------------------------

    #[test]
    fn try_order_puts_preferred_first_without_duplicates() {
        let chain: Vec<ModelRef> =
            vec![ModelRef::Local, ModelRef::Cloud, "openai:gpt-4o-mini".parse().unwrap()];
        let order = try_order(&ModelRef::Cloud, &chain);
        assert_eq!(order[0], ModelRef::Cloud);
        assert_eq!(order.len(), 3);
        assert_eq!(order.iter().filter(|r| **r == ModelRef::Cloud).count(), 1);
    }

    #[test]
    fn backoff_delay_grows_and_caps() {
        let config = fast_config();
        // base 5ms, factor 2, cap 20ms, jitter ±25%
        let d0 = backoff_delay(&config, 0).as_millis() as f64;
        let d3 = backoff_delay(&config, 3).as_millis() as f64;
        assert!(d0 >= 3.0 && d0 <= 7.0, "got {d0}");
        assert!(d3 <= 25.0, "capped with jitter, got {d3}");
    }
}

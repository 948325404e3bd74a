//! The router facade — the single public entry point.
//!
//! [`RouterFacade`] owns the long-lived pieces (config snapshot, registry,
//! store, statistics) and orchestrates one request end to end: triage picks a
//! model, the executor walks the chain, both sides of the exchange land in
//! the store, and the counters move. Holding all of it in one value rather
//! than in globals makes multiple routers in one process (test harnesses)
//! trivial.
//!
//! The config is swapped atomically on reload; a request in flight keeps the
//! `Arc` snapshot it started with. Store writes go through `spawn_blocking`
//! so the SQLite mutex is never held on an async worker thread, and a store
//! failure never takes down a request that already has text — it degrades to
//! a warning in the outcome.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::{
    api::rate_limit::RateSpacer,
    backends::{ChatMessage, ImagePayload, Role},
    config::{Config, ModelRef},
    executor::{self, AttemptOutcome, ExecRequest, RequestOutcome},
    error::ErrorKind,
    registry::Registry,
    store::ConversationStore,
    triage::{self, TriageDecision},
};

/// How much prior conversation rides along as context.
const HISTORY_WINDOW: u32 = 20;

/// Content of the stub appended when a request is cut off by its deadline.
const INTERRUPTED_MARKER: &str = "(interrupted)";

/// Content of the stub appended when every backend failed.
const FAILED_MARKER: &str = "(failed: no backend produced a response)";

/// A routing request as accepted by the public surface.
#[derive(Debug, Clone, Default)]
pub struct RouterRequest {
    pub input: String,
    pub image: Option<ImagePayload>,
    /// Existing conversation to continue; `None` starts a new one.
    pub session_id: Option<i64>,
    pub force_model_ref: Option<ModelRef>,
    /// Opaque caller context, forwarded to the backend as a system message.
    pub extra_context: Option<serde_json::Value>,
}

/// Everything the facade hands back for one request.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedOutcome {
    /// `None` only when the store was unavailable; the text response is
    /// still produced.
    pub conversation_id: Option<i64>,
    pub decision: TriageDecision,
    #[serde(flatten)]
    pub outcome: RequestOutcome,
    /// Present when persisting the exchange failed; the text response is
    /// unaffected.
    pub store_warning: Option<String>,
    pub elapsed_ms: u64,
}

/// Failures surfaced before any backend is tried.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error("input must not be empty")]
    EmptyInput,
    #[error("router is at its concurrent-request limit, retry shortly")]
    Busy,
    #[error("no backends available: no local runtime is reachable and no cloud credentials are configured")]
    NoBackendsAvailable,
    #[error("input exceeds every available model's context window")]
    ContextTooLarge,
    #[error("session {0} does not exist")]
    UnknownSession(i64),
    #[error("store error: {0}")]
    Store(String),
}

/// Monotonic counters, updated with atomic adds per field. Cost fields are
/// stored in micro-units so they can live in a `u64`.
#[derive(Debug, Default)]
pub struct RouterStats {
    total_requests: AtomicU64,
    local_used: AtomicU64,
    cloud_used: AtomicU64,
    total_cost_micro: AtomicU64,
    total_saved_micro: AtomicU64,
    fallback_count: AtomicU64,
    vision_requests: AtomicU64,
}

/// A point-in-time read of the counters. Fields are individually consistent;
/// mutual consistency across fields is not promised.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub local_used: u64,
    pub cloud_used: u64,
    pub total_cost: f64,
    pub total_saved: f64,
    pub fallback_count: u64,
    pub vision_requests: u64,
}

impl RouterStats {
    fn add_cost(field: &AtomicU64, amount: f64) {
        field.fetch_add((amount * 1e6).round() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            local_used: self.local_used.load(Ordering::Relaxed),
            cloud_used: self.cloud_used.load(Ordering::Relaxed),
            total_cost: self.total_cost_micro.load(Ordering::Relaxed) as f64 / 1e6,
            total_saved: self.total_saved_micro.load(Ordering::Relaxed) as f64 / 1e6,
            fallback_count: self.fallback_count.load(Ordering::Relaxed),
            vision_requests: self.vision_requests.load(Ordering::Relaxed),
        }
    }
}

/// Shared application state injected into every request handler.
pub struct RouterFacade {
    /// Atomically-swappable live config; the lock is held only for the
    /// duration of `Arc::clone`, so it never blocks request handling.
    config_lock: RwLock<Arc<Config>>,
    /// Path the config was loaded from — used by `reload_config`.
    pub config_path: PathBuf,
    pub registry: Arc<Registry>,
    pub store: Arc<ConversationStore>,
    stats: RouterStats,
    permits: Arc<Semaphore>,
    /// Optional per-source request spacer. `None` disables rate limiting.
    ///
    /// Built once at startup from `server.rate_limit_ms`; a config hot-reload
    /// does not rebuild it — restart to change the spacing at runtime.
    pub rate_spacer: Option<Arc<RateSpacer>>,
    pub started_at: std::time::Instant,
}

impl RouterFacade {
    pub fn new(
        config: Arc<Config>,
        config_path: PathBuf,
        registry: Arc<Registry>,
        store: Arc<ConversationStore>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.server.max_concurrent_requests));
        let rate_spacer = config
            .server
            .rate_limit_ms
            .filter(|&ms| ms > 0)
            .map(|ms| Arc::new(RateSpacer::new(ms)));
        Self {
            config_lock: RwLock::new(config),
            config_path,
            registry,
            store,
            stats: RouterStats::default(),
            permits,
            rate_spacer,
            started_at: std::time::Instant::now(),
        }
    }

    /// Snapshot of the current live config.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Re-parse the config file and swap it in atomically. In-flight requests
    /// continue with the snapshot they took at admission.
    pub fn reload_config(&self) -> anyhow::Result<()> {
        let new = Config::load(&self.config_path)?;
        *self.config_lock.write().expect("config lock poisoned") = Arc::new(new);
        info!(path = %self.config_path.display(), "config reloaded");
        Ok(())
    }

    /// Read-only statistics accessor.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Route one request end to end.
    pub async fn handle(&self, request: RouterRequest) -> Result<RoutedOutcome, FacadeError> {
        if request.input.trim().is_empty() && request.image.is_none() {
            return Err(FacadeError::EmptyInput);
        }

        // Backpressure: immediate busy error, no queueing.
        let _permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| FacadeError::Busy)?;

        let config = self.config();
        let snapshot = self.registry.snapshot();

        if snapshot.entries.is_empty() {
            return Err(FacadeError::NoBackendsAvailable);
        }

        let t0 = std::time::Instant::now();
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        if request.image.is_some() {
            self.stats.vision_requests.fetch_add(1, Ordering::Relaxed);
        }

        // Resolve the conversation and persist the user message before any
        // backend call: within a session the user turn is durable before the
        // assistant turn exists. A broken store degrades to a warning — the
        // request still routes and returns text.
        let (conversation_id, mut store_warning) =
            match self.resolve_conversation(&request).await {
                Ok(id) => (Some(id), None),
                Err(e @ FacadeError::UnknownSession(_)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "store unavailable — routing without persistence");
                    (None, Some(format!("{}: {e}", ErrorKind::StoreIo)))
                }
            };
        if let Some(conversation_id) = conversation_id {
            let store_user = self
                .run_store({
                    let input = request.input.clone();
                    move |store| store.append_message(conversation_id, Role::User, &input, None)
                })
                .await;
            if let Err(e) = store_user {
                warn!(error = %e, "failed to persist user message");
                store_warning.get_or_insert_with(|| format!("{}: {e}", ErrorKind::StoreIo));
            }
        }

        let decision = triage::triage(
            &request.input,
            request.image.is_some(),
            request.force_model_ref.as_ref(),
            &config,
            &snapshot,
        )
        .await;

        if decision.context_too_large {
            return Err(FacadeError::ContextTooLarge);
        }

        let exec_request = ExecRequest {
            messages: match conversation_id {
                Some(id) => self.build_messages(id, &request).await,
                None => vec![ChatMessage::user(request.input.clone())],
            },
            image: request.image.clone(),
        };
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(config.executor.deadline_ms);

        let outcome =
            executor::execute(&exec_request, &decision.preferred, deadline, &config, &snapshot)
                .await;

        if !outcome.succeeded() && outcome.nothing_available() {
            return Err(FacadeError::NoBackendsAvailable);
        }

        self.record_stats(&outcome);

        // Persist the assistant side (or a stub that marks what happened).
        if let Some(conversation_id) = conversation_id {
            let append = match (&outcome.response, interrupted(&outcome)) {
                (Some(completion), _) => {
                    let text = completion.text.clone();
                    let model = completion.model_ref.to_string();
                    self.run_store(move |store| {
                        store.append_message(conversation_id, Role::Assistant, &text, Some(&model))
                    })
                    .await
                }
                (None, true) => {
                    self.run_store(move |store| {
                        store.append_message(conversation_id, Role::System, INTERRUPTED_MARKER, None)
                    })
                    .await
                }
                (None, false) => {
                    self.run_store(move |store| {
                        store.append_message(conversation_id, Role::System, FAILED_MARKER, None)
                    })
                    .await
                }
            };
            if let Err(e) = append {
                warn!(error = %e, "failed to persist assistant message");
                store_warning.get_or_insert_with(|| format!("{}: {e}", ErrorKind::StoreIo));
            }
        }

        Ok(RoutedOutcome {
            conversation_id,
            decision,
            outcome,
            store_warning,
            elapsed_ms: t0.elapsed().as_millis() as u64,
        })
    }

    async fn resolve_conversation(&self, request: &RouterRequest) -> Result<i64, FacadeError> {
        match request.session_id {
            Some(id) => {
                let existing = self
                    .run_store(move |store| store.get_conversation(id))
                    .await
                    .map_err(|e| FacadeError::Store(e.to_string()))?;
                existing
                    .map(|c| c.id)
                    .ok_or(FacadeError::UnknownSession(id))
            }
            None => {
                let title = default_title(&request.input);
                self.run_store(move |store| store.create_conversation(&title, None))
                    .await
                    .map_err(|e| FacadeError::Store(e.to_string()))
            }
        }
    }

    /// Conversation history plus the new input, oldest first.
    async fn build_messages(&self, conversation_id: i64, request: &RouterRequest) -> Vec<ChatMessage> {
        let history = self
            .run_store(move |store| store.get_messages(conversation_id, None, None))
            .await
            .unwrap_or_default();

        let mut messages = Vec::new();
        if let Some(context) = &request.extra_context {
            messages.push(ChatMessage::system(context.to_string()));
        }
        // The user turn was already persisted, so the tail of history is the
        // current input; take the last window as-is.
        let skip = history.len().saturating_sub(HISTORY_WINDOW as usize);
        for msg in history.into_iter().skip(skip) {
            // Stub markers are bookkeeping, not model context.
            if msg.role == Role::System
                && (msg.content == INTERRUPTED_MARKER || msg.content == FAILED_MARKER)
            {
                continue;
            }
            messages.push(ChatMessage { role: msg.role, content: msg.content });
        }
        if messages.is_empty() {
            messages.push(ChatMessage::user(request.input.clone()));
        }
        messages
    }

    fn record_stats(&self, outcome: &RequestOutcome) {
        let Some(winner) = &outcome.model_ref else {
            return;
        };
        if winner.is_local_hint() {
            self.stats.local_used.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.cloud_used.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(response) = &outcome.response {
            RouterStats::add_cost(&self.stats.total_cost_micro, response.cost);
            RouterStats::add_cost(&self.stats.total_saved_micro, response.saved_cost);
        }
        // A fallback happened when some other candidate failed (or was
        // skipped) before the winner answered. Retries against the winner
        // itself do not count.
        let fell_back = outcome
            .attempts
            .iter()
            .any(|a| a.outcome != AttemptOutcome::Success && &a.model_ref != winner);
        if fell_back {
            self.stats.fallback_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Run a store operation off the async worker threads.
    async fn run_store<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ConversationStore) -> anyhow::Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| anyhow::anyhow!("store task panicked: {e}"))?
    }
}

fn interrupted(outcome: &RequestOutcome) -> bool {
    outcome
        .attempts
        .last()
        .is_some_and(|a| a.error_kind == Some(ErrorKind::DeadlineExceeded))
}

/// First line of the input, clipped, as a new conversation's title.
fn default_title(input: &str) -> String {
    let line = input.lines().next().unwrap_or("").trim();
    let mut title: String = line.chars().take(48).collect();
    if title.is_empty() {
        title = "Untitled conversation".into();
    }
    title
}

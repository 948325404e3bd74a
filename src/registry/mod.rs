//! The model registry — the authoritative table of available models.
//!
//! Probe results and configured cloud entries are merged into an immutable
//! [`RegistrySnapshot`] behind an `RwLock<Arc<_>>`; reads clone the `Arc`
//! (the lock is held for nanoseconds) and writes swap the pointer, so a
//! lookup always sees either the pre- or post-refresh table, never a mixture.
//!
//! Every refresh computes a diff against the previous snapshot and notifies
//! subscribers over an unbounded channel. The snapshot is also persisted as
//! JSON so a restarted process starts from the last known table, marked stale
//! until its first refresh completes.

pub mod probe;

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{Config, ModelRef, Pricing, Provider};
use probe::{host_allowed, probe_all, Capability, ProbeReport, RuntimeDescriptor};

/// Pricing used for a cloud entry with no configured pricing row, so the
/// non-zero-pricing invariant holds even on sparse configs.
const FALLBACK_CLOUD_PRICING: Pricing = Pricing { input: 3.0, output: 15.0 };

/// One loadable model.
///
/// Locally-hosted entries carry the runtime they live on; cloud entries carry
/// non-zero pricing instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub display_name: String,
    pub provider: Provider,
    pub runtime: Option<RuntimeDescriptor>,
    pub capabilities: Vec<Capability>,
    pub context_tokens: u32,
    pub pricing: Pricing,
}

impl ModelEntry {
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.id)
    }

    pub fn is_local(&self) -> bool {
        self.provider.is_local()
    }

    pub fn model_ref(&self) -> ModelRef {
        ModelRef::exact(self.provider, self.id.clone())
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// Context-window guess when the provider does not report one.
fn default_context_tokens(provider: Provider, id: &str) -> u32 {
    let lower = id.to_lowercase();
    // Size markers in the id win over provider defaults.
    for (marker, tokens) in [("1m", 1_000_000), ("256k", 262_144), ("128k", 131_072), ("32k", 32_768)] {
        if lower.contains(marker) {
            return tokens;
        }
    }
    match provider {
        Provider::Local => 8_192,
        Provider::Anthropic => 200_000,
        Provider::Google => 1_000_000,
        Provider::OpenAi | Provider::OpenRouter | Provider::Moonshot => 128_000,
    }
}

/// An immutable view of the model table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// `provider:id` → entry, sorted for deterministic iteration.
    pub entries: BTreeMap<String, ModelEntry>,
    pub last_scan_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    /// Preferred local model id from config, captured at refresh time.
    pub preferred_local_id: Option<String>,
    /// Key of the configured default cloud entry.
    pub default_cloud_key: String,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            // Epoch start: an empty snapshot is stale by construction.
            last_scan_at: DateTime::<Utc>::UNIX_EPOCH,
            ttl_seconds: 0,
            preferred_local_id: None,
            default_cloud_key: String::new(),
        }
    }

    pub fn is_stale(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.last_scan_at);
        age.num_seconds() >= self.ttl_seconds as i64
    }

    /// Resolve a model reference against this snapshot.
    ///
    /// `local` picks the first reachable local entry, preferring the
    /// configured id; `cloud` resolves to the configured default cloud entry.
    pub fn lookup(&self, model_ref: &ModelRef) -> Option<&ModelEntry> {
        match model_ref {
            ModelRef::Exact { provider, id } => self.entries.get(&format!("{provider}:{id}")),
            ModelRef::Cloud => self.entries.get(&self.default_cloud_key),
            ModelRef::Local => {
                let locals = || {
                    self.entries
                        .values()
                        .filter(|e| e.is_local() && e.runtime.as_ref().is_some_and(|r| r.reachable))
                };
                if let Some(preferred) = &self.preferred_local_id {
                    if let Some(entry) = locals().find(|e| &e.id == preferred) {
                        return Some(entry);
                    }
                }
                locals().next()
            }
        }
    }

    pub fn list_all(&self) -> Vec<&ModelEntry> {
        self.entries.values().collect()
    }

    pub fn list_local(&self) -> Vec<&ModelEntry> {
        self.entries.values().filter(|e| e.is_local()).collect()
    }

    pub fn list_cloud(&self) -> Vec<&ModelEntry> {
        self.entries.values().filter(|e| !e.is_local()).collect()
    }

    /// Largest-context entry with the given capability, used by triage when
    /// the preferred model's window is too small for the input.
    pub fn largest_context_with(&self, cap: Capability) -> Option<&ModelEntry> {
        self.entries
            .values()
            .filter(|e| e.has_capability(cap))
            .filter(|e| e.runtime.as_ref().map_or(true, |r| r.reachable))
            .max_by_key(|e| e.context_tokens)
    }
}

/// Diff produced by one refresh, sent to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl RegistryChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Process-wide model table with change notifications.
pub struct Registry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    observers: Mutex<Vec<mpsc::UnboundedSender<RegistryChange>>>,
    /// Where the JSON snapshot is persisted; `None` disables persistence.
    snapshot_path: Option<PathBuf>,
    client: reqwest::Client,
}

impl Registry {
    /// Create a registry, seeding from the persisted snapshot when one
    /// exists. A loaded snapshot is stale until the first refresh.
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        let initial = snapshot_path
            .as_deref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|content| match serde_json::from_str::<RegistrySnapshot>(&content) {
                Ok(snap) => {
                    info!(entries = snap.entries.len(), "loaded registry snapshot from disk");
                    Some(snap)
                }
                Err(e) => {
                    warn!(error = %e, "registry snapshot on disk is unreadable — starting empty");
                    None
                }
            })
            .unwrap_or_else(RegistrySnapshot::empty);

        Self {
            snapshot: RwLock::new(Arc::new(initial)),
            observers: Mutex::new(Vec::new()),
            snapshot_path,
            client: reqwest::Client::new(),
        }
    }

    /// Current table. Stale reads are permitted but logged.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let snap = self.snapshot.read().expect("registry lock poisoned").clone();
        if snap.is_stale() && !snap.entries.is_empty() {
            warn!(
                last_scan_at = %snap.last_scan_at,
                ttl_seconds = snap.ttl_seconds,
                "registry is stale — serving last known table"
            );
        }
        snap
    }

    /// Subscribe to refresh diffs. The receiver gets one [`RegistryChange`]
    /// per refresh that changed anything.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().expect("observer lock poisoned").push(tx);
        rx
    }

    /// Probe all configured endpoints, merge with configured cloud entries,
    /// swap the table atomically, notify subscribers, persist to disk.
    pub async fn refresh(&self, config: &Config) -> RegistryChange {
        let timeout = std::time::Duration::from_millis(config.scanner.probe_timeout_ms);
        let endpoints: Vec<_> = config
            .runtime_endpoints()
            .into_iter()
            .filter(|(_, url)| host_allowed(url, &config.scanner.allowed_hosts))
            .collect();

        let reports = probe_all(&self.client, &endpoints, timeout).await;

        let mut entries = BTreeMap::new();
        for report in &reports {
            collect_local_entries(report, &mut entries);
        }
        seed_cloud_entries(config, &mut entries);

        let new = RegistrySnapshot {
            entries,
            last_scan_at: Utc::now(),
            ttl_seconds: config.scanner.cache_ttl,
            preferred_local_id: config.models.local.model.clone(),
            default_cloud_key: format!(
                "{}:{}",
                config.models.cloud.provider, config.models.cloud.model
            ),
        };

        let old = self.snapshot.read().expect("registry lock poisoned").clone();
        let change = diff(&old, &new);

        *self.snapshot.write().expect("registry lock poisoned") = Arc::new(new.clone());

        if !change.is_empty() {
            info!(
                added = change.added.len(),
                removed = change.removed.len(),
                updated = change.updated.len(),
                "registry refreshed"
            );
            self.observers
                .lock()
                .expect("observer lock poisoned")
                .retain(|tx| tx.send(change.clone()).is_ok());
        }

        if let Some(path) = &self.snapshot_path {
            if let Err(e) = persist(path, &new) {
                warn!(path = %path.display(), error = %e, "failed to persist registry snapshot");
            }
        }

        change
    }
}

fn collect_local_entries(report: &ProbeReport, entries: &mut BTreeMap<String, ModelEntry>) {
    if !report.reachable {
        return;
    }
    let descriptor = report.descriptor();
    for stub in &report.models {
        let entry = ModelEntry {
            id: stub.id.clone(),
            display_name: stub.display_name.clone(),
            provider: Provider::Local,
            runtime: Some(descriptor.clone()),
            capabilities: stub.capabilities.clone(),
            context_tokens: default_context_tokens(Provider::Local, &stub.id),
            pricing: Pricing::ZERO,
        };
        entries.insert(entry.key(), entry);
    }
}

/// Register the configured cloud models. An entry is only registered when its
/// provider's credential is present — a registry with no reachable runtime
/// and no cloud credentials is genuinely empty, which the facade surfaces as
/// a single no-backends-available error.
fn seed_cloud_entries(config: &Config, entries: &mut BTreeMap<String, ModelEntry>) {
    let mut refs: Vec<(Provider, String)> = vec![(
        config.models.cloud.provider,
        config.models.cloud.model.clone(),
    )];
    let configured = config
        .fallback
        .chain
        .iter()
        .chain(config.routing.hard_rules.iter().map(|r| &r.model));
    for model_ref in configured {
        if let ModelRef::Exact { provider, id } = model_ref {
            if !provider.is_local() {
                refs.push((*provider, id.clone()));
            }
        }
    }

    for (provider, id) in refs {
        let key = format!("{provider}:{id}");
        if entries.contains_key(&key) {
            continue;
        }
        if provider.api_key().is_none() {
            warn!(%key, env = ?provider.api_key_env(), "cloud model has no credential — not registering");
            continue;
        }
        let pricing = match config.pricing_for(&id) {
            Some(p) if !p.is_zero() => *p,
            _ => {
                warn!(%key, "no pricing configured for cloud model — using fallback pricing");
                FALLBACK_CLOUD_PRICING
            }
        };
        let entry = ModelEntry {
            display_name: id.clone(),
            provider,
            runtime: None,
            capabilities: probe::infer_capabilities(&id),
            context_tokens: default_context_tokens(provider, &id),
            pricing,
            id,
        };
        entries.insert(key, entry);
    }
}

fn diff(old: &RegistrySnapshot, new: &RegistrySnapshot) -> RegistryChange {
    let added = new
        .entries
        .keys()
        .filter(|k| !old.entries.contains_key(*k))
        .cloned()
        .collect();
    let removed = old
        .entries
        .keys()
        .filter(|k| !new.entries.contains_key(*k))
        .cloned()
        .collect();
    let updated = new
        .entries
        .iter()
        .filter(|(k, v)| old.entries.get(*k).is_some_and(|prev| prev != *v))
        .map(|(k, _)| k.clone())
        .collect();
    RegistryChange { added, removed, updated }
}

fn persist(path: &std::path::Path, snapshot: &RegistrySnapshot) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, json)?;
    Ok(())
}

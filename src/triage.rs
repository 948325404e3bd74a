//! Triage — deciding which model should handle a request.
//!
//! The decision ladder runs in strict order: forced override, vision fast
//! path, hard rules, delegated classifier, confidence upgrade, chain default.
//! Hard-rule matching is case-sensitive substring matching, not regex and not
//! word-boundary-aware — the triggers in the configuration are domain terms.
//!
//! The classifier is a small local model asked to answer in JSON. Small
//! models are chatty, so the reply is treated as free-form text: a JSON
//! object is dug out by brace matching, and when that fails a textual
//! heuristic (`cloud`/`complex` vs `local`/`simple`) still recovers a usable
//! verdict. Only when both fail does triage fall through to the chain
//! default. With the classifier disabled the whole ladder is deterministic.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    backends::{count_tokens, BackendClient, ChatMessage, ChatRequest},
    config::{Config, ModelRef},
    registry::{probe::Capability, RegistrySnapshot},
};

/// Where a triage decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionOrigin {
    HardRule,
    Classifier,
    Default,
    Forced,
}

/// The model preference produced by triage.
#[derive(Debug, Clone, Serialize)]
pub struct TriageDecision {
    pub preferred: ModelRef,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub reason: String,
    pub origin: DecisionOrigin,
    /// Set when a low-confidence local recommendation was replaced by the
    /// default cloud reference. The original reason is kept.
    pub upgraded: bool,
    /// Set when the input does not fit any capable model's context window;
    /// the executor surfaces this terminally.
    pub context_too_large: bool,
}

impl TriageDecision {
    fn new(preferred: ModelRef, confidence: f64, reason: impl Into<String>, origin: DecisionOrigin) -> Self {
        Self {
            preferred,
            confidence,
            reason: reason.into(),
            origin,
            upgraded: false,
            context_too_large: false,
        }
    }
}

/// Run the triage ladder for one request.
pub async fn triage(
    input: &str,
    has_image: bool,
    force: Option<&ModelRef>,
    config: &Config,
    snapshot: &RegistrySnapshot,
) -> TriageDecision {
    // 1. Forced override skips every rule.
    if let Some(forced) = force {
        return TriageDecision::new(forced.clone(), 1.0, "forced by caller", DecisionOrigin::Forced);
    }

    // 2. Vision fast path: prefer a capability-tagged entry, local first.
    if has_image {
        let preferred = snapshot
            .list_local()
            .into_iter()
            .find(|e| e.has_capability(Capability::Vision))
            .or_else(|| {
                snapshot
                    .list_cloud()
                    .into_iter()
                    .find(|e| e.has_capability(Capability::Vision))
            })
            .map(|e| e.model_ref())
            .unwrap_or_else(|| config.default_cloud_ref());
        return fit_to_context(
            TriageDecision::new(preferred, 1.0, "vision input", DecisionOrigin::HardRule),
            input,
            snapshot,
        );
    }

    // 3. Hard rules, in declaration order. An empty trigger list matches
    //    everything (the loader has already warned about it).
    for rule in &config.routing.hard_rules {
        let matched = rule.triggers.is_empty()
            || rule.triggers.iter().any(|t| input.contains(t.as_str()));
        if matched {
            return fit_to_context(
                TriageDecision::new(rule.model.clone(), 1.0, rule.reason.clone(), DecisionOrigin::HardRule),
                input,
                snapshot,
            );
        }
    }

    // 4. Delegated classifier.
    if config.routing.intelligent_routing.enabled {
        match classify(input, config, snapshot).await {
            ClassifierVerdict::Parsed { model, confidence, reason }
            | ClassifierVerdict::Heuristic { model, confidence, reason } => {
                let mut decision =
                    TriageDecision::new(model, confidence, reason, DecisionOrigin::Classifier);

                // 5. Confidence upgrade: a hesitant local pick goes to cloud.
                let threshold = config.routing.intelligent_routing.confidence_threshold;
                if decision.preferred.is_local_hint() && decision.confidence < threshold {
                    debug!(
                        confidence = decision.confidence,
                        threshold, "upgrading low-confidence local recommendation to cloud"
                    );
                    decision.preferred = config.default_cloud_ref();
                    decision.upgraded = true;
                }
                return fit_to_context(decision, input, snapshot);
            }
            ClassifierVerdict::Unusable => {
                debug!("classifier verdict unusable — falling through to chain default");
            }
        }
    }

    // 6. Chain default.
    let primary = config
        .effective_chain()
        .first()
        .cloned()
        .unwrap_or(ModelRef::Local);
    fit_to_context(
        TriageDecision::new(primary, 0.5, "fallback chain primary", DecisionOrigin::Default),
        input,
        snapshot,
    )
}

/// Replace the preference when the input cannot fit its context window.
///
/// Prefers the largest-context text-capable entry that does fit; when none
/// does, the decision is marked `context_too_large` for the executor to
/// surface terminally.
fn fit_to_context(
    mut decision: TriageDecision,
    input: &str,
    snapshot: &RegistrySnapshot,
) -> TriageDecision {
    let Some(entry) = snapshot.lookup(&decision.preferred) else {
        // Unresolvable refs are the executor's problem (skipped attempts).
        return decision;
    };
    let estimated = count_tokens(input) as u32;
    if estimated <= entry.context_tokens {
        return decision;
    }

    match snapshot.largest_context_with(Capability::Text) {
        Some(bigger) if bigger.context_tokens >= estimated => {
            warn!(
                input_tokens = estimated,
                from = %decision.preferred,
                to = %bigger.model_ref(),
                "input exceeds preferred model context — switching to larger-context model"
            );
            decision.preferred = bigger.model_ref();
            decision
        }
        _ => {
            decision.context_too_large = true;
            decision
        }
    }
}

/// The classifier's reply, as a tagged parse result.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ClassifierVerdict {
    /// A JSON object with model/confidence/reason was extracted.
    Parsed { model: ModelRef, confidence: f64, reason: String },
    /// No JSON, but the text mentioned a recognizable direction.
    Heuristic { model: ModelRef, confidence: f64, reason: String },
    Unusable,
}

/// Ask the configured local classifier model to pick a direction.
async fn classify(input: &str, config: &Config, snapshot: &RegistrySnapshot) -> ClassifierVerdict {
    let settings = &config.routing.intelligent_routing;
    let Some(entry) = snapshot.lookup(&settings.classifier_model) else {
        warn!(model = %settings.classifier_model, "classifier model not in registry");
        return ClassifierVerdict::Unusable;
    };

    let client = match BackendClient::for_entry(entry, config, settings.classifier_timeout_ms) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "could not build classifier client");
            return ClassifierVerdict::Unusable;
        }
    };

    let prompt = settings.triage_prompt.replace("{input}", input);
    let request = ChatRequest::new(entry.id.clone(), vec![ChatMessage::user(prompt)]);

    match client.generate(&request).await {
        Ok(completion) => parse_classifier_reply(&completion.text),
        Err(e) => {
            warn!(error = %e, "classifier call failed");
            ClassifierVerdict::Unusable
        }
    }
}

/// Interpret free-form classifier output.
pub(crate) fn parse_classifier_reply(text: &str) -> ClassifierVerdict {
    if let Some(obj) = extract_json_object(text) {
        let model = obj
            .get("model")
            .and_then(Value::as_str)
            .and_then(|s| parse_model_word(s));
        if let Some(model) = model {
            let confidence = obj
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.5)
                .clamp(0.0, 1.0);
            let reason = obj
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("classifier")
                .to_string();
            return ClassifierVerdict::Parsed { model, confidence, reason };
        }
    }

    // Textual fallback: verbose small models often explain instead of
    // answering in JSON, but still name a direction.
    let lower = text.to_lowercase();
    if lower.contains("cloud") || lower.contains("complex") {
        return ClassifierVerdict::Heuristic {
            model: ModelRef::Cloud,
            confidence: 0.8,
            reason: "classifier text mentioned cloud/complex".into(),
        };
    }
    if lower.contains("local") || lower.contains("simple") {
        return ClassifierVerdict::Heuristic {
            model: ModelRef::Local,
            confidence: 0.8,
            reason: "classifier text mentioned local/simple".into(),
        };
    }
    ClassifierVerdict::Unusable
}

/// Accept `local`, `cloud`, or a full `provider:id` reference.
fn parse_model_word(s: &str) -> Option<ModelRef> {
    s.trim().parse::<ModelRef>().ok()
}

/// Dig the first balanced JSON object out of free-form text.
fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..=start + i];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

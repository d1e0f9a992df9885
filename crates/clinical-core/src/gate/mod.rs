//! Meaningful-change gate (component C).
//!
//! Per-(clinician, note) admission controller deciding whether an incoming
//! edit warrants an expensive model call, based on lexical deltas, trigram
//! similarity, semantic-embedding distance, and clinical salience heuristics.

mod salience;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::GateConfig;
use crate::embedding::{self, EmbeddingClient};
use crate::error::GateError;
use crate::text;

/// Structured rationale attached to every [`GateDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    NoSentenceBoundary,
    DuplicateState,
    BelowThreshold,
    NotMeaningful,
}

/// Signal values that went into a [`GateDecision`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateDetail {
    pub delta_chars: usize,
    pub trigram_dice: f64,
    pub embedding_cosine_distance: f64,
    pub normalized_len: usize,
    pub auto_threshold: usize,
    pub manual_threshold: usize,
    pub salient: bool,
}

/// Outcome of [`Gate::evaluate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason_code: Option<ReasonCode>,
    pub model_id: Option<String>,
    pub detail: GateDetail,
    pub status_code: u16,
}

/// Inputs to one admission evaluation.
#[derive(Debug, Clone, Default)]
pub struct GateRequest {
    pub note_id: Option<String>,
    pub clinician_id: Option<String>,
    pub text: String,
    pub intent: Option<String>,
    pub transcript_cursor: Option<String>,
    pub accepted_disposition: Option<serde_json::Value>,
}

/// Per-NoteKey mutable state. Created on first evaluation; mutated on every
/// subsequent evaluation regardless of outcome; never destroyed in-process.
#[derive(Debug, Clone, Default)]
pub struct GateState {
    pub last_note_hash: Option<String>,
    pub last_admitted_note_hash: Option<String>,
    pub last_transcript_cursor: Option<String>,
    pub last_accepted_disposition_hash: Option<String>,
    pub last_sent_text: String,
    pub cold_start_completed: bool,
}

/// Derives `note:<noteId>` when given, else `note:<clinicianId>` when given,
/// else `"note:unknown"` (resolves the source's operator-precedence ambiguity
/// explicitly in the caller's favor, per the documented precedence rule).
pub fn note_key(note_id: Option<&str>, clinician_id: Option<&str>) -> String {
    if let Some(note_id) = note_id.filter(|s| !s.is_empty()) {
        return format!("note:{note_id}");
    }
    if let Some(clinician_id) = clinician_id.filter(|s| !s.is_empty()) {
        return format!("note:{clinician_id}");
    }
    "note:unknown".to_string()
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_json_hash(value: &serde_json::Value) -> Option<String> {
    canonical_json(value).map(|s| sha256_hex(&s))
}

fn canonical_json(value: &serde_json::Value) -> Option<String> {
    serde_json::to_string(&sort_keys(value)).ok()
}

fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

/// The meaningful-change gate. Owns per-note state and an injected embedding
/// client; config supplies thresholds and the intent→model mapping.
pub struct Gate {
    states: RwLock<HashMap<String, Arc<Mutex<GateState>>>>,
    embedding_client: Arc<dyn EmbeddingClient>,
    config: GateConfig,
}

impl Gate {
    /// Construct a gate with injected embedding client and configuration.
    pub fn new(embedding_client: Arc<dyn EmbeddingClient>, config: GateConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            embedding_client,
            config,
        }
    }

    /// Clear all per-note state. Does not affect the injected embedding
    /// client itself (ownership stays with the caller).
    pub fn reset(&self) {
        self.states.write().expect("gate state lock poisoned").clear();
    }

    fn state_for(&self, key: &str) -> Arc<Mutex<GateState>> {
        if let Some(existing) = self.states.read().expect("gate state lock poisoned").get(key) {
            return existing.clone();
        }
        let mut states = self.states.write().expect("gate state lock poisoned");
        states
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(GateState::default())))
            .clone()
    }

    /// Evaluate an incoming edit against the gate's configured thresholds.
    ///
    /// Mutates the `GateState` bound to the request's derived `NoteKey` on
    /// every exit path, regardless of the outcome.
    pub async fn evaluate(&self, request: &GateRequest) -> Result<GateDecision, GateError> {
        let key = note_key(request.note_id.as_deref(), request.clinician_id.as_deref());
        let state_handle = self.state_for(&key);
        let mut state = state_handle.lock().await;

        let normalized = text::normalize(&request.text);
        let normalized_len = normalized.chars().count();
        let note_hash = sha256_hex(&normalized);

        let auto_threshold = self
            .config
            .auto_threshold_chars
            .max(
                (self.config.auto_threshold_pct * normalized_len as f64).ceil() as usize,
            );
        let manual_threshold = self
            .config
            .manual_threshold_chars
            .max(
                (self.config.manual_threshold_pct * normalized_len as f64).ceil() as usize,
            );

        let base_detail = |delta, dice, dist, salient| GateDetail {
            delta_chars: delta,
            trigram_dice: dice,
            embedding_cosine_distance: dist,
            normalized_len,
            auto_threshold,
            manual_threshold,
            salient,
        };

        // 1. Boundary check.
        if !text::has_boundary(&request.text) {
            Self::update_state(&mut state, &normalized, &note_hash, request);
            return Ok(GateDecision {
                allowed: false,
                reason_code: Some(ReasonCode::NoSentenceBoundary),
                model_id: None,
                detail: base_detail(0, 0.0, 0.0, false),
                status_code: 409,
            });
        }

        // 2. Duplicate state.
        if state.last_admitted_note_hash.as_deref() == Some(note_hash.as_str()) {
            Self::update_state(&mut state, &normalized, &note_hash, request);
            return Ok(GateDecision {
                allowed: false,
                reason_code: Some(ReasonCode::DuplicateState),
                model_id: None,
                detail: base_detail(0, 0.0, 0.0, false),
                status_code: 409,
            });
        }

        // 3. Compute signals.
        let (old_span, new_span, _) = text::changed_spans(&state.last_sent_text, &normalized);
        let delta = old_span.chars().count().max(new_span.chars().count());
        let dice = text::trigram_dice(&old_span, &new_span);
        let dist = if old_span.trim().is_empty() && new_span.trim().is_empty() {
            1.0
        } else {
            embedding::distance(self.embedding_client.as_ref(), &old_span, &new_span).await?
        };
        let salient = salience::has_salience(&old_span, &new_span);

        // 4. Cold start.
        if !state.cold_start_completed {
            if normalized_len < self.config.cold_start_chars {
                Self::update_state(&mut state, &normalized, &note_hash, request);
                return Ok(GateDecision {
                    allowed: false,
                    reason_code: Some(ReasonCode::BelowThreshold),
                    model_id: None,
                    detail: base_detail(delta, dice, dist, salient),
                    status_code: 409,
                });
            }
            state.cold_start_completed = true;
        }

        let intent = request
            .intent
            .as_deref()
            .unwrap_or("auto")
            .trim()
            .to_lowercase();

        // 5. Salience bypass, else lexical/semantic thresholds.
        if !salient {
            let lexical_trigger = delta < 40 || dice > 0.90;
            let distance_threshold = if intent == "manual" {
                self.config.semantic_distance_manual_min
            } else {
                self.config.semantic_distance_auto_min
            };

            if dist < distance_threshold && (lexical_trigger || delta < normalized_len) {
                Self::update_state(&mut state, &normalized, &note_hash, request);
                return Ok(GateDecision {
                    allowed: false,
                    reason_code: Some(ReasonCode::NotMeaningful),
                    model_id: None,
                    detail: base_detail(delta, dice, dist, salient),
                    status_code: 409,
                });
            }

            let threshold = if intent == "manual" {
                manual_threshold
            } else {
                auto_threshold
            };
            if delta < threshold {
                Self::update_state(&mut state, &normalized, &note_hash, request);
                return Ok(GateDecision {
                    allowed: false,
                    reason_code: Some(ReasonCode::BelowThreshold),
                    model_id: None,
                    detail: base_detail(delta, dice, dist, salient),
                    status_code: 409,
                });
            }
        }

        // 6. Admit.
        state.last_admitted_note_hash = Some(note_hash.clone());
        Self::update_state(&mut state, &normalized, &note_hash, request);

        let model_id = self
            .config
            .intent_models
            .get(&intent)
            .cloned()
            .unwrap_or_else(|| "gpt-4o".to_string());

        Ok(GateDecision {
            allowed: true,
            reason_code: None,
            model_id: Some(model_id),
            detail: base_detail(delta, dice, dist, salient),
            status_code: 200,
        })
    }

    fn update_state(
        state: &mut GateState,
        normalized: &str,
        note_hash: &str,
        request: &GateRequest,
    ) {
        state.last_sent_text = normalized.to_string();
        state.last_note_hash = Some(note_hash.to_string());
        if let Some(cursor) = &request.transcript_cursor {
            state.last_transcript_cursor = Some(cursor.clone());
        }
        if let Some(disposition) = &request.accepted_disposition {
            if let Some(hash) = canonical_json_hash(disposition) {
                state.last_accepted_disposition_hash = Some(hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::embedding::FixedVectorEmbeddingClient;

    fn test_config() -> GateConfig {
        GateConfig::default()
    }

    fn gate_with_vectors(vectors: Vec<Vec<f32>>) -> Gate {
        Gate::new(
            Arc::new(FixedVectorEmbeddingClient::new(vectors)),
            test_config(),
        )
    }

    fn long_text() -> String {
        crate::fixtures::long_note_text()
    }

    #[tokio::test]
    async fn cold_start_denial() {
        let gate = gate_with_vectors(vec![vec![1.0, 0.0, 0.0]]);
        let request = GateRequest {
            note_id: Some("n1".to_string()),
            text: "short note without enough detail.".to_string(),
            intent: Some("auto".to_string()),
            ..Default::default()
        };
        let decision = gate.evaluate(&request).await.expect("evaluate");
        assert!(!decision.allowed);
        assert_eq!(decision.reason_code, Some(ReasonCode::BelowThreshold));
        assert_eq!(decision.status_code, 409);
    }

    #[tokio::test]
    async fn boundary_admit() {
        let gate = gate_with_vectors(vec![vec![1.0, 0.0, 0.0]]);
        let request = GateRequest {
            note_id: Some("n2".to_string()),
            text: long_text(),
            intent: Some("auto".to_string()),
            ..Default::default()
        };
        let decision = gate.evaluate(&request).await.expect("evaluate");
        assert!(decision.allowed);
        assert_eq!(decision.model_id.as_deref(), Some("gpt-4o"));
    }

    #[tokio::test]
    async fn additional_content_admitted() {
        // Old span (the deleted portion, empty here) embeds to (1,0,0); the new
        // span (the appended sentences) embeds to (0,1,0) — orthogonal, so the
        // semantic distance check alone would admit even if length didn't.
        let gate = gate_with_vectors(vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
        let first = GateRequest {
            note_id: Some("n3".to_string()),
            text: long_text(),
            intent: Some("auto".to_string()),
            ..Default::default()
        };
        gate.evaluate(&first).await.expect("admit first");

        let second = GateRequest {
            note_id: Some("n3".to_string()),
            text: format!("{}{}.", long_text(), "additional clinical details ".repeat(6)),
            intent: Some("auto".to_string()),
            ..Default::default()
        };
        let decision = gate.evaluate(&second).await.expect("evaluate");
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn not_meaningful_denial() {
        let gate = gate_with_vectors(vec![vec![1.0, 0.0, 0.0]]);
        let base = long_text();
        let first = GateRequest {
            note_id: Some("n6".to_string()),
            text: base.clone(),
            intent: Some("auto".to_string()),
            ..Default::default()
        };
        gate.evaluate(&first).await.expect("admit first");

        let second = GateRequest {
            note_id: Some("n6".to_string()),
            text: base.replacen("sentence 10.", "sentence 10!", 1),
            intent: Some("auto".to_string()),
            ..Default::default()
        };
        let decision = gate.evaluate(&second).await.expect("evaluate");
        assert!(!decision.allowed);
        assert_eq!(decision.reason_code, Some(ReasonCode::NotMeaningful));
    }

    #[tokio::test]
    async fn duplicate_denial() {
        let gate = gate_with_vectors(vec![vec![1.0, 0.0, 0.0]]);
        let request = GateRequest {
            note_id: Some("n5".to_string()),
            text: long_text(),
            intent: Some("auto".to_string()),
            ..Default::default()
        };
        gate.evaluate(&request).await.expect("first evaluate");
        let second = gate.evaluate(&request).await.expect("second evaluate");
        assert!(!second.allowed);
        assert_eq!(second.reason_code, Some(ReasonCode::DuplicateState));
    }

    #[tokio::test]
    async fn salience_bypasses_thresholds_for_manual_intent() {
        let gate = gate_with_vectors(vec![vec![1.0, 0.0, 0.0]]);
        let base = long_text();
        let admit_request = GateRequest {
            note_id: Some("n4".to_string()),
            text: base.clone(),
            intent: Some("auto".to_string()),
            ..Default::default()
        };
        gate.evaluate(&admit_request).await.expect("admit first");

        let follow_up = GateRequest {
            note_id: Some("n4".to_string()),
            text: format!("{base}BP 170/110\n"),
            intent: Some("manual".to_string()),
            ..Default::default()
        };
        let decision = gate.evaluate(&follow_up).await.expect("evaluate follow up");
        assert!(decision.allowed);
        assert_eq!(decision.model_id.as_deref(), Some("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let gate = gate_with_vectors(vec![vec![1.0, 0.0, 0.0]]);
        let request = GateRequest {
            note_id: Some("n7".to_string()),
            text: long_text(),
            intent: Some("auto".to_string()),
            ..Default::default()
        };
        gate.evaluate(&request).await.expect("first evaluate");
        gate.reset();
        // After reset, the same normalized text is no longer a duplicate.
        let decision = gate.evaluate(&request).await.expect("evaluate after reset");
        assert!(decision.allowed);
    }

    #[test]
    fn note_key_precedence() {
        assert_eq!(note_key(Some("n1"), Some("c1")), "note:n1");
        assert_eq!(note_key(None, Some("c1")), "note:c1");
        assert_eq!(note_key(None, None), "note:unknown");
        assert_eq!(note_key(Some(""), Some("c1")), "note:c1");
    }
}

//! Stable prompt block: rubric + schema + policy, cached by
//! `(modelId, schemaVersion)` (spec §4.4.1).

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One chat message in a constructed prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Whether [`StableBlockCache::get_or_build`] served a cached copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Hit,
    Miss,
}

const SUGGEST_SYSTEM_RUBRIC: &str = "You are an expert medical coder, compliance officer and clinical decision support assistant. Review the supplied, de-identified clinical material and return only valid JSON for the clinician. Do not invent or hallucinate content. Respect any clinician-provided rules and focus on documentation that affects coding, compliance risk and public health follow-up.";

fn suggestion_response_schema() -> serde_json::Value {
    json!({
        "additionalProperties": true,
        "properties": {
            "codes": {
                "items": {
                    "additionalProperties": true,
                    "properties": {
                        "accepted": {"type": ["boolean", "null"]},
                        "code": {"type": "string"},
                        "confidence": {"type": ["number", "null"]},
                        "rationale": {"type": "string"},
                        "supporting_spans": {"type": "array"}
                    },
                    "required": ["code"],
                    "type": "object"
                },
                "type": "array"
            },
            "compliance": {"items": {"type": "string"}, "type": "array"},
            "confidence": {"type": ["number", "null"]},
            "differentials": {
                "items": {
                    "additionalProperties": true,
                    "properties": {
                        "diagnosis": {"type": "string"},
                        "score": {"type": ["number", "null"]}
                    },
                    "required": ["diagnosis"],
                    "type": "object"
                },
                "type": "array"
            },
            "public_health": {
                "items": {
                    "additionalProperties": true,
                    "properties": {
                        "reason": {"type": ["string", "null"]},
                        "recommendation": {"type": "string"}
                    },
                    "required": ["recommendation"],
                    "type": "object"
                },
                "type": "array"
            },
            "questions": {"items": {"type": "string"}, "type": "array"}
        },
        "required": ["codes", "compliance", "public_health", "differentials"],
        "title": "Clinical Suggestion Response",
        "type": "object"
    })
}

fn estimate_tokens(messages: &[PromptMessage]) -> usize {
    let total_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    total_chars / 4
}

type CacheKey = (String, String);
type CacheValue = (Vec<PromptMessage>, usize);

/// Small LRU over `(modelId, schemaVersion)` stable blocks. Deterministic:
/// the same key always builds the same byte-identical message sequence.
pub struct StableBlockCache {
    items: Mutex<LruCache<CacheKey, CacheValue>>,
    policy_version: String,
}

impl StableBlockCache {
    pub fn new(capacity: usize, policy_version: impl Into<String>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            items: Mutex::new(LruCache::new(capacity)),
            policy_version: policy_version.into(),
        }
    }

    /// Build (or fetch) the stable block for `model_id`/`schema_version`.
    /// Returns a defensive copy of the cached messages.
    pub fn get_or_build(
        &self,
        model_id: Option<&str>,
        schema_version: &str,
    ) -> (Vec<PromptMessage>, CacheState, usize) {
        let key = (
            model_id.unwrap_or("default").trim().to_lowercase(),
            schema_version.trim().to_string(),
        );

        {
            let mut items = self.items.lock().expect("stable block cache poisoned");
            if let Some((messages, tokens)) = items.get(&key) {
                return (messages.clone(), CacheState::Hit, *tokens);
            }
        }

        let messages = self.build(schema_version);
        let tokens = estimate_tokens(&messages);
        let mut items = self.items.lock().expect("stable block cache poisoned");
        items.put(key, (messages.clone(), tokens));
        (messages, CacheState::Miss, tokens)
    }

    fn build(&self, schema_version: &str) -> Vec<PromptMessage> {
        let schema_json = serde_json::to_string_pretty(&suggestion_response_schema())
            .expect("suggestion schema serializes");
        let policy = format!(
            "Policy safeguards ({}):\n- Never include PHI or other direct identifiers.\n- Obey clinician supplied rules and highlight compliance risks.\n- Return valid JSON only; omit commentary or markdown.",
            self.policy_version
        );
        vec![
            PromptMessage::system(SUGGEST_SYSTEM_RUBRIC),
            PromptMessage::system(format!(
                "Respond with JSON matching schema version {schema_version}:\n{schema_json}"
            )),
            PromptMessage::system(policy),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_is_a_miss_second_is_a_hit() {
        let cache = StableBlockCache::new(16, "v1");
        let (_, state, _) = cache.get_or_build(Some("gpt-4o"), "2024-06-01");
        assert_eq!(state, CacheState::Miss);
        let (_, state, _) = cache.get_or_build(Some("gpt-4o"), "2024-06-01");
        assert_eq!(state, CacheState::Hit);
    }

    #[test]
    fn equal_keys_produce_byte_identical_messages() {
        let cache_a = StableBlockCache::new(16, "v1");
        let cache_b = StableBlockCache::new(16, "v1");
        let (a, _, _) = cache_a.get_or_build(Some("GPT-4o"), "2024-06-01");
        let (b, _, _) = cache_b.get_or_build(Some("gpt-4o"), "2024-06-01");
        assert_eq!(a, b);
    }

    #[test]
    fn model_id_is_case_and_whitespace_normalized_for_cache_key() {
        let cache = StableBlockCache::new(16, "v1");
        cache.get_or_build(Some(" GPT-4o "), "2024-06-01");
        let (_, state, _) = cache.get_or_build(Some("gpt-4o"), "2024-06-01");
        assert_eq!(state, CacheState::Hit);
    }

    #[test]
    fn eviction_drops_least_recently_used_key() {
        let cache = StableBlockCache::new(1, "v1");
        cache.get_or_build(Some("model-a"), "2024-06-01");
        cache.get_or_build(Some("model-b"), "2024-06-01");
        let (_, state, _) = cache.get_or_build(Some("model-a"), "2024-06-01");
        assert_eq!(state, CacheState::Miss);
    }

    #[test]
    fn token_estimate_is_non_negative_and_floored() {
        let cache = StableBlockCache::new(16, "v1");
        let (_, _, tokens) = cache.get_or_build(Some("gpt-4o"), "2024-06-01");
        assert!(tokens > 0);
    }
}

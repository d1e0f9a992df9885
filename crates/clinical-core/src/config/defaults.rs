//! Built-in default values for [`super::Config`].

use std::collections::HashMap;

use super::{Config, GateConfig, PhiScrubMode, PromptConfig, StreamConfig};

pub(super) fn default_config() -> Config {
    Config {
        gate: default_gate_config(),
        prompt: default_prompt_config(),
        streams: default_stream_config(),
        phi_scrub_mode: PhiScrubMode::Minimum,
    }
}

pub(super) fn default_gate_config() -> GateConfig {
    let mut intent_models = HashMap::new();
    intent_models.insert("auto".to_string(), "gpt-4o".to_string());
    intent_models.insert("finalize".to_string(), "gpt-4o".to_string());
    intent_models.insert("beautify".to_string(), "gpt-4o".to_string());
    intent_models.insert("patient_summary".to_string(), "gpt-4o".to_string());
    intent_models.insert("plan_assist".to_string(), "gpt-4o".to_string());
    intent_models.insert("manual".to_string(), "gpt-4o-mini".to_string());

    GateConfig {
        auto_threshold_chars: 40,
        auto_threshold_pct: 0.10,
        manual_threshold_chars: 20,
        manual_threshold_pct: 0.05,
        cold_start_chars: 500,
        semantic_distance_auto_min: 0.15,
        semantic_distance_manual_min: 0.08,
        embedding_model_id: "text-embedding-3-small".to_string(),
        intent_models,
    }
}

pub(super) fn default_prompt_config() -> PromptConfig {
    PromptConfig {
        stable_cache_capacity: 32,
        schema_version: "2024-06-01".to_string(),
        policy_version: "v1".to_string(),
    }
}

pub(super) fn default_stream_config() -> StreamConfig {
    StreamConfig {
        min_interval_ms: 500,
    }
}

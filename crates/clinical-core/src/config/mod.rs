//! Configuration management for the orchestration core.
//!
//! Supports three-layer configuration loading:
//! 1. Built-in defaults
//! 2. TOML config file
//! 3. Environment variable overrides (`CLINICAL_` prefix)

mod defaults;

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for the orchestration core.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Meaningful-change gate thresholds and intent→model mapping.
    #[serde(default)]
    pub gate: GateConfig,

    /// Prompt builder cache sizing and versioning.
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Encounter delta stream hub timing.
    #[serde(default)]
    pub streams: StreamConfig,

    /// PHI scrubbing mode.
    #[serde(default)]
    pub phi_scrub_mode: PhiScrubMode,
}

impl Default for Config {
    fn default() -> Self {
        defaults::default_config()
    }
}

/// Gate admission thresholds, mirroring spec §4.3.1.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GateConfig {
    pub auto_threshold_chars: usize,
    pub auto_threshold_pct: f64,
    pub manual_threshold_chars: usize,
    pub manual_threshold_pct: f64,
    pub cold_start_chars: usize,
    pub semantic_distance_auto_min: f64,
    pub semantic_distance_manual_min: f64,
    pub embedding_model_id: String,
    /// Maps a clinical `intent` to the LLM model id used when admitted.
    pub intent_models: HashMap<String, String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        defaults::default_gate_config()
    }
}

/// Stable-block cache sizing and versioning.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PromptConfig {
    /// Maximum number of distinct `(modelId, schemaVersion)` stable blocks cached.
    pub stable_cache_capacity: usize,
    pub schema_version: String,
    pub policy_version: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        defaults::default_prompt_config()
    }
}

/// Encounter delta stream hub timing.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Minimum interval, in milliseconds, between flushes on one encounter.
    pub min_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        defaults::default_stream_config()
    }
}

/// PHI scrubbing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhiScrubMode {
    /// Scrub every free-text fragment before prompt inclusion (default).
    Minimum,
    /// Pass text through unscrubbed (whitespace normalization still applies).
    Off,
}

impl Default for PhiScrubMode {
    fn default() -> Self {
        PhiScrubMode::Minimum
    }
}

impl Config {
    /// Load configuration from built-in defaults, an optional TOML file at
    /// `path`, then environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = path {
            if path.exists() {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                let file_config: Config =
                    toml::from_str(&raw).map_err(|source| ConfigError::ParseError { source })?;
                config = file_config;
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("CLINICAL_PROMPT_SCRUBBING") {
            self.phi_scrub_mode = match value.trim().to_lowercase().as_str() {
                "off" | "disabled" => PhiScrubMode::Off,
                _ => PhiScrubMode::Minimum,
            };
        }
        if let Ok(value) = env::var("CLINICAL_GATE_COLD_START_CHARS") {
            if let Ok(parsed) = value.parse() {
                self.gate.cold_start_chars = parsed;
            }
        }
        if let Ok(value) = env::var("CLINICAL_STREAMS_MIN_INTERVAL_MS") {
            if let Ok(parsed) = value.parse() {
                self.streams.min_interval_ms = parsed;
            }
        }
        if let Ok(value) = env::var("CLINICAL_PROMPT_CACHE_CAPACITY") {
            if let Ok(parsed) = value.parse() {
                self.prompt.stable_cache_capacity = parsed;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.prompt.stable_cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "prompt.stable_cache_capacity".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.gate.auto_threshold_pct < 0.0 || self.gate.manual_threshold_pct < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "gate.*_threshold_pct".to_string(),
                message: "threshold percentages must be non-negative".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.phi_scrub_mode, PhiScrubMode::Minimum);
    }

    #[test]
    fn load_with_no_file_uses_defaults() {
        let config = Config::load(None).expect("load");
        assert_eq!(config.gate.cold_start_chars, 500);
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "clinical-core-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("config.toml");
        std::fs::write(&path, "[gate]\ncold_start_chars = 250\nauto_threshold_chars = 40\nauto_threshold_pct = 0.1\nmanual_threshold_chars = 20\nmanual_threshold_pct = 0.05\nsemantic_distance_auto_min = 0.15\nsemantic_distance_manual_min = 0.1\nembedding_model_id = \"test-embed\"\n").expect("write");

        let config = Config::load(Some(&path)).expect("load");
        assert_eq!(config.gate.cold_start_chars, 250);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn env_override_switches_scrub_mode() {
        env::set_var("CLINICAL_PROMPT_SCRUBBING", "off");
        let config = Config::load(None).expect("load");
        assert_eq!(config.phi_scrub_mode, PhiScrubMode::Off);
        env::remove_var("CLINICAL_PROMPT_SCRUBBING");
    }

    #[test]
    fn zero_cache_capacity_is_invalid() {
        let mut config = Config::default();
        config.prompt.stable_cache_capacity = 0;
        assert!(config.validate().is_err());
    }
}

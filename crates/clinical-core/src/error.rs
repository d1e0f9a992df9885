//! Error types for the clinical-core library.
//!
//! Each subsystem has its own error enum to provide clear error boundaries.
//! The library uses `thiserror` for structured, typed errors.

/// Errors related to configuration loading, parsing, and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required configuration field is absent.
    #[error("missing required config field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },

    /// A configuration field has an unacceptable value.
    #[error("invalid value for config field '{field}': {message}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// A description of why the value is invalid.
        message: String,
    },

    /// The configuration file does not exist at the specified path.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The path that was searched.
        path: String,
    },

    /// TOML deserialization failed.
    #[error("failed to parse config file: {source}")]
    ParseError {
        /// The underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },

    /// Reading the config file failed at the filesystem level.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// The path that failed to read.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the meaningful-change gate and its embedding probe.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The embedding client returned fewer vectors than requested.
    #[error("embedding client returned {got} vectors for {expected} inputs")]
    EmbeddingProtocolError {
        /// Number of vectors expected (always 2 for the gate's probe).
        expected: usize,
        /// Number of vectors actually returned.
        got: usize,
    },

    /// The embedding client's underlying transport failed.
    #[error("embedding client error: {0}")]
    EmbeddingClient(String),
}

/// Errors from the compose pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The external validator returned a response the pipeline could not interpret.
    #[error("validator protocol error: {0}")]
    ValidatorProtocolError(String),

    /// The LLM client failed during the beautify stage.
    #[error("llm client error: {0}")]
    LlmClient(String),
}

/// Errors from the encounter delta stream hub.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A subscriber send failed; the subscriber has been evicted.
    #[error("subscriber send failed: {0}")]
    SendFailed(String),

    /// A subscribe request arrived without an encounter id.
    #[error("missing encounter id")]
    MissingEncounterId,
}

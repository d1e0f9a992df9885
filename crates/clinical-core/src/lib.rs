//! Core library for the encounter-note AI orchestration service.
//!
//! Four cooperating subsystems live here: the [`gate`] (admission control for
//! note edits), the [`prompt`] builder (stable/dynamic block assembly with PHI
//! scrubbing), the [`compose`] pipeline (staged, cancellable note composition),
//! and the [`streams`] hub (per-encounter delta fan-out). [`text`] and
//! [`embedding`] are the leaf components the gate composes.

pub mod compose;
pub mod config;
pub mod embedding;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fixtures;
pub mod gate;
pub mod prompt;
pub mod streams;
pub mod text;

pub use error::{ConfigError, GateError, PipelineError, StreamError};

/// Returns the version of the clinical-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

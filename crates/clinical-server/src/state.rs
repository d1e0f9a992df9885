//! Shared application state for the clinical demonstration server.

use std::collections::HashMap;
use std::sync::Arc;

use clinical_core::compose::Pipeline;
use clinical_core::streams::StreamHub;

/// The three encounter-scoped delta channels exposed over `/ws/{channel}`.
pub const CHANNELS: [&str; 3] = ["codes", "compliance", "compose"];

/// Shared application state accessible by all route handlers.
pub struct AppState {
    /// The compose pipeline, wired with whatever LLM/validator/offline
    /// beautifier collaborators the binary entry point configured.
    pub pipeline: Arc<Pipeline>,
    /// One coalescing hub per channel name.
    pub hubs: HashMap<&'static str, Arc<StreamHub>>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, min_interval: std::time::Duration) -> Self {
        let hubs = CHANNELS
            .iter()
            .map(|&channel| (channel, Arc::new(StreamHub::new(channel, min_interval))))
            .collect();
        Self { pipeline, hubs }
    }
}

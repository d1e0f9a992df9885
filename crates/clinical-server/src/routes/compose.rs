//! `POST /compose` — run the compose pipeline to completion, forwarding each
//! progress snapshot through the `compose` encounter delta channel as it is
//! emitted.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use clinical_core::compose::{ChannelReporter, ComposeJob, PipelineState};

use crate::state::AppState;

/// Runs `job` through [`clinical_core::compose::Pipeline::run`], relaying
/// every snapshot to the `compose` channel's hub for `job.encounterId` (or
/// `"unknown"` if absent) as it is produced, and returns the terminal
/// snapshot once the pipeline reaches a sink state.
pub async fn compose(
    State(state): State<Arc<AppState>>,
    Json(job): Json<ComposeJob>,
) -> Json<PipelineState> {
    let hub = state
        .hubs
        .get("compose")
        .cloned()
        .expect("compose channel is always registered");
    let encounter_id = job
        .encounter_id
        .clone()
        .unwrap_or_else(|| "unknown".to_string());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let reporter = ChannelReporter::new(tx);

    let forward_hub = hub.clone();
    let forward_encounter = encounter_id.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            let payload = serde_json::to_value(&snapshot).unwrap_or_default();
            if let Err(err) = forward_hub.publish(&forward_encounter, payload).await {
                tracing::warn!(encounter_id = %forward_encounter, error = %err, "failed to publish compose snapshot");
            }
        }
    });

    let final_state = state.pipeline.run(job, &reporter, None).await;
    drop(reporter);
    let _ = forward_task.await;

    Json(final_state)
}

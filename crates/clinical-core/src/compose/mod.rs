//! Compose pipeline (component E).
//!
//! A four-stage, cancellable orchestrator that turns a raw note into a
//! beautified, validated artifact: `analyzing` → `enhancing_structure` →
//! `beautifying_language` → `final_review`. Progress snapshots are pushed to
//! an injected [`Reporter`] after every observable transition; cancellation
//! is polled cooperatively at stage boundaries via a [`CancellationToken`].

mod stages;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::prompt::PromptMessage;

/// Stage identifiers, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyzing,
    EnhancingStructure,
    BeautifyingLanguage,
    FinalReview,
}

const STAGE_SEQUENCE: [Stage; 4] = [
    Stage::Analyzing,
    Stage::EnhancingStructure,
    Stage::BeautifyingLanguage,
    Stage::FinalReview,
];

impl Stage {
    /// Cumulative progress floor reached on this stage's completion (spec §4.5.1).
    fn progress_floor(self) -> f64 {
        match self {
            Stage::Analyzing => 0.15,
            Stage::EnhancingStructure => 0.35,
            Stage::BeautifyingLanguage => 0.85,
            Stage::FinalReview => 1.0,
        }
    }

    fn index(self) -> usize {
        STAGE_SEQUENCE.iter().position(|&s| s == self).unwrap_or(0)
    }
}

/// Terminal/in-flight status of a [`PipelineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    InProgress,
    Completed,
    Blocked,
    Cancelled,
    Failed,
}

/// Status of a single per-stage step within [`PipelineState::steps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
    Failed,
}

/// One entry in `PipelineState.steps`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: usize,
    pub stage: Stage,
    pub status: StepStatus,
    pub progress: f64,
}

/// Snapshot emitted after every observable pipeline transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub compose_id: i64,
    pub status: PipelineStatus,
    pub stage: Stage,
    pub progress: f64,
    pub steps: Vec<Step>,
    pub result: Option<Value>,
    pub validation: Option<ValidationSummary>,
    pub message: Option<String>,
    /// Distinguishes a genuine remote beautify call from one that fell back
    /// to local recasing, without disturbing the public `mode` field's
    /// two-value `{offline, remote}` contract. Not serialized onto the wire.
    #[serde(skip)]
    pub used_fallback: bool,
}

/// Validation outcome recorded on the terminal `final_review` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub ok: bool,
    pub issues: Value,
    /// Full validator response, opaque beyond `issues`/`canFinalize`.
    pub detail: Value,
}

impl PipelineState {
    fn new(compose_id: i64, session_id: Option<&str>, encounter_id: Option<&str>, note_id: Option<&str>) -> Self {
        let steps = STAGE_SEQUENCE
            .iter()
            .enumerate()
            .map(|(i, &stage)| Step {
                id: i + 1,
                stage,
                status: StepStatus::Pending,
                progress: 0.0,
            })
            .collect();
        let mut result = Map::new();
        result.insert("sessionId".to_string(), json!(session_id));
        result.insert("encounterId".to_string(), json!(encounter_id));
        result.insert("noteId".to_string(), json!(note_id));
        Self {
            compose_id,
            status: PipelineStatus::InProgress,
            stage: Stage::Analyzing,
            progress: 0.0,
            steps,
            result: Some(Value::Object(result)),
            validation: None,
            message: None,
            used_fallback: false,
        }
    }

    fn result_mut(&mut self) -> &mut Map<String, Value> {
        if self.result.is_none() {
            self.result = Some(Value::Object(Map::new()));
        }
        self.result.as_mut().and_then(Value::as_object_mut).expect("result is an object")
    }

    fn step_mut(&mut self, stage: Stage) -> &mut Step {
        let index = stage.index();
        &mut self.steps[index]
    }
}

/// All inputs required to run the compose pipeline for one request (spec §3.1).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeJob {
    pub compose_id: i64,
    pub note: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub codes: Vec<Value>,
    #[serde(default)]
    pub transcript: Vec<Value>,
    #[serde(default = "default_lang")]
    pub lang: String,
    pub specialty: Option<String>,
    pub payer: Option<String>,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub use_local_models: bool,
    pub beautify_model: Option<String>,
    pub session_id: Option<String>,
    pub encounter_id: Option<String>,
    pub note_id: Option<String>,
    pub username: Option<String>,
}

fn default_lang() -> String {
    "en".to_string()
}

/// Capability interface for the remote LLM used by the beautify stage
/// (spec §6.3). Exceptions/errors are treated as failures triggering the
/// recasing fallback, never retried by the core.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(
        &self,
        messages: &[PromptMessage],
        model_id: &str,
        temperature: f64,
    ) -> Result<String, PipelineError>;
}

/// Capability interface for the offline/local beautify model.
#[async_trait]
pub trait OfflineBeautifier: Send + Sync {
    async fn beautify(
        &self,
        note: &str,
        lang: &str,
        specialty: Option<&str>,
        payer: Option<&str>,
        use_local_models: bool,
        model_path: Option<&str>,
    ) -> Result<String, PipelineError>;
}

/// Builds the beautify-stage prompt; an out-of-scope collaborator injected
/// at construction (spec §4.5.3, "external prompt composer").
pub trait BeautifyPromptComposer: Send + Sync {
    fn build(&self, note: &str, lang: &str, specialty: Option<&str>, payer: Option<&str>) -> Vec<PromptMessage>;
}

/// Capability interface for the external validator (spec §6.4). Any keys on
/// the returned JSON object beyond `issues`/`canFinalize` are passed through
/// opaquely to `PipelineState.validation.detail`.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, request: ValidatorRequest) -> Result<Value, PipelineError>;
}

/// Inputs to one `final_review` validation call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRequest {
    pub content: String,
    pub codes: Vec<String>,
    pub prevention: Value,
    pub diagnoses: Value,
    pub differentials: Value,
    pub compliance: Value,
}

/// Receives a [`PipelineState`] snapshot after every observable transition.
/// The pipeline tolerates reporter failures by logging and continuing.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, state: &PipelineState);
}

/// A reporter that discards every snapshot; useful when no caller is
/// watching progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

#[async_trait]
impl Reporter for NoopReporter {
    async fn report(&self, _state: &PipelineState) {}
}

/// Pushes each snapshot onto a buffered outbound queue — the "tasks plus
/// channels" shape the pipeline's single worker uses to hand snapshots to
/// whatever drains the other end (e.g. the encounter delta stream hub).
/// Send failures (no receiver left) are logged, not propagated.
pub struct ChannelReporter {
    sender: tokio::sync::mpsc::UnboundedSender<PipelineState>,
}

impl ChannelReporter {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<PipelineState>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Reporter for ChannelReporter {
    async fn report(&self, state: &PipelineState) {
        if self.sender.send(state.clone()).is_err() {
            tracing::warn!(
                compose_id = state.compose_id,
                "compose pipeline reporter channel closed, dropping snapshot"
            );
        }
    }
}

/// Echoes the last prompt message back, trimmed. Test/demo double only.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoLlmClient;

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn call(
        &self,
        messages: &[PromptMessage],
        _model_id: &str,
        _temperature: f64,
    ) -> Result<String, PipelineError> {
        Ok(messages
            .last()
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default())
    }
}

/// Always fails, so `beautify()`'s offline path downgrades to remote
/// exactly as it would with no offline model wired up. Test/demo double only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOfflineBeautifier;

#[async_trait]
impl OfflineBeautifier for NoOfflineBeautifier {
    async fn beautify(
        &self,
        _note: &str,
        _lang: &str,
        _specialty: Option<&str>,
        _payer: Option<&str>,
        _use_local_models: bool,
        _model_path: Option<&str>,
    ) -> Result<String, PipelineError> {
        Err(PipelineError::LlmClient(
            "no offline beautifier configured".to_string(),
        ))
    }
}

/// Builds a minimal two-message beautify prompt. Test/demo double; a real
/// deployment wires in its own clinical beautify prompt template.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBeautifyPromptComposer;

impl BeautifyPromptComposer for DefaultBeautifyPromptComposer {
    fn build(&self, note: &str, lang: &str, specialty: Option<&str>, payer: Option<&str>) -> Vec<PromptMessage> {
        let mut instruction = format!(
            "Rewrite the clinical note below in clear, professional {lang} prose. \
             Preserve all clinical facts; do not add or remove findings."
        );
        if let Some(specialty) = specialty {
            instruction.push_str(&format!(" Specialty context: {specialty}."));
        }
        if let Some(payer) = payer {
            instruction.push_str(&format!(" Payer context: {payer}."));
        }
        vec![
            PromptMessage {
                role: "system".to_string(),
                content: instruction,
            },
            PromptMessage {
                role: "user".to_string(),
                content: note.to_string(),
            },
        ]
    }
}

/// Always finalizes with no issues. Test/demo double only.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveValidator;

#[async_trait]
impl Validator for PermissiveValidator {
    async fn validate(&self, _request: ValidatorRequest) -> Result<Value, PipelineError> {
        Ok(json!({ "issues": {}, "canFinalize": true }))
    }
}

/// The staged, cancellable compose workflow (spec §4.5).
pub struct Pipeline {
    llm: Box<dyn LlmClient>,
    offline_beautifier: Box<dyn OfflineBeautifier>,
    prompt_composer: Box<dyn BeautifyPromptComposer>,
    validator: Box<dyn Validator>,
}

impl Pipeline {
    pub fn new(
        llm: Box<dyn LlmClient>,
        offline_beautifier: Box<dyn OfflineBeautifier>,
        prompt_composer: Box<dyn BeautifyPromptComposer>,
        validator: Box<dyn Validator>,
    ) -> Self {
        Self {
            llm,
            offline_beautifier,
            prompt_composer,
            validator,
        }
    }

    /// Run `job` to completion (or to a cancelled/failed terminal state),
    /// invoking `reporter` after every observable transition and polling
    /// `cancel` at each stage boundary.
    pub async fn run(
        &self,
        job: ComposeJob,
        reporter: &dyn Reporter,
        cancel: Option<&CancellationToken>,
    ) -> PipelineState {
        let mut state = PipelineState::new(
            job.compose_id,
            job.session_id.as_deref(),
            job.encounter_id.as_deref(),
            job.note_id.as_deref(),
        );

        if self.is_cancelled(cancel) {
            self.cancel(&mut state, reporter).await;
            return state;
        }

        self.run_analyzing(&mut state, &job, reporter).await;

        if self.is_cancelled(cancel) {
            self.cancel(&mut state, reporter).await;
            return state;
        }
        let structured_note = self.run_enhancing(&mut state, reporter).await;

        if self.is_cancelled(cancel) {
            self.cancel(&mut state, reporter).await;
            return state;
        }
        self.run_beautifying(&mut state, &job, &structured_note, reporter).await;

        if self.is_cancelled(cancel) {
            self.cancel(&mut state, reporter).await;
            return state;
        }
        self.run_final_review(&mut state, &job, reporter).await;

        state
    }

    fn is_cancelled(&self, cancel: Option<&CancellationToken>) -> bool {
        cancel.is_some_and(CancellationToken::is_cancelled)
    }

    async fn emit(&self, state: &PipelineState, reporter: &dyn Reporter) {
        reporter.report(state).await;
    }

    async fn cancel(&self, state: &mut PipelineState, reporter: &dyn Reporter) {
        state.status = PipelineStatus::Cancelled;
        state.stage = Stage::FinalReview;
        state.message = Some("Compose job cancelled".to_string());
        state.progress = state.progress.min(Stage::FinalReview.progress_floor());
        if let Some(last) = state.steps.last_mut() {
            last.status = StepStatus::Cancelled;
            last.progress = state.progress;
        }
        tracing::info!(compose_id = state.compose_id, "compose pipeline cancelled");
        self.emit(state, reporter).await;
    }

    async fn run_analyzing(&self, state: &mut PipelineState, job: &ComposeJob, reporter: &dyn Reporter) {
        state.stage = Stage::Analyzing;
        state.status = PipelineStatus::InProgress;
        state.progress = 0.01;
        {
            let step = state.step_mut(Stage::Analyzing);
            step.status = StepStatus::InProgress;
            step.progress = 0.0;
        }
        self.emit(state, reporter).await;

        let normalized_metadata = stages::normalize_metadata(&job.metadata);
        let sanitized = stages::sanitize_html(&job.note);
        let base_note = if sanitized.is_empty() {
            stages::default_note_content(&normalized_metadata)
        } else {
            sanitized
        };

        let mut analysis = Map::new();
        analysis.insert("normalizedNote".to_string(), json!(base_note));
        analysis.insert("metadata".to_string(), Value::Object(normalized_metadata));
        analysis.insert("codeCount".to_string(), json!(job.codes.len()));
        analysis.insert(
            "transcriptHighlights".to_string(),
            json!(stages::derive_transcript_highlights(&job.transcript)),
        );
        state.result_mut().insert("analysis".to_string(), Value::Object(analysis));
        state.result_mut().insert("_baseNote".to_string(), json!(base_note));

        let progress = Stage::Analyzing.progress_floor();
        state.progress = progress;
        let step = state.step_mut(Stage::Analyzing);
        step.status = StepStatus::Completed;
        step.progress = progress;
        tracing::debug!(compose_id = state.compose_id, "analyzing stage complete");
        self.emit(state, reporter).await;
    }

    async fn run_enhancing(&self, state: &mut PipelineState, reporter: &dyn Reporter) -> String {
        state.stage = Stage::EnhancingStructure;
        state.step_mut(Stage::EnhancingStructure).status = StepStatus::InProgress;
        self.emit(state, reporter).await;

        let base_note = state
            .result
            .as_ref()
            .and_then(|r| r.get("_baseNote"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let structured = stages::format_note_for_enhancement(&base_note);
        let structured_note = if structured.is_empty() { base_note } else { structured };

        state
            .result_mut()
            .insert("structuredNote".to_string(), json!(structured_note));
        state.result_mut().remove("_baseNote");

        let progress = Stage::EnhancingStructure.progress_floor();
        state.progress = progress;
        let step = state.step_mut(Stage::EnhancingStructure);
        step.status = StepStatus::Completed;
        step.progress = progress;
        tracing::debug!(compose_id = state.compose_id, "enhancing_structure stage complete");
        self.emit(state, reporter).await;
        structured_note
    }

    async fn run_beautifying(
        &self,
        state: &mut PipelineState,
        job: &ComposeJob,
        structured_note: &str,
        reporter: &dyn Reporter,
    ) {
        state.stage = Stage::BeautifyingLanguage;
        state.step_mut(Stage::BeautifyingLanguage).status = StepStatus::InProgress;
        self.emit(state, reporter).await;

        let (beautified, mode, used_fallback) = self.beautify(structured_note, job).await;
        state.used_fallback = used_fallback;
        let code_justifications = stages::build_code_justifications(&job.codes, &job.metadata);
        let patient_summary = stages::build_patient_summary(
            structured_note,
            &job.metadata,
            &code_justifications,
            &job.transcript,
        );

        let result = state.result_mut();
        result.insert("beautifiedNote".to_string(), json!(beautified));
        result.insert("codeJustifications".to_string(), json!(code_justifications));
        result.insert("patientSummary".to_string(), json!(patient_summary));
        result.insert("mode".to_string(), json!(mode));

        let progress = Stage::BeautifyingLanguage.progress_floor();
        state.progress = progress;
        let step = state.step_mut(Stage::BeautifyingLanguage);
        step.status = StepStatus::Completed;
        step.progress = progress;
        tracing::debug!(compose_id = state.compose_id, mode, "beautifying_language stage complete");
        self.emit(state, reporter).await;
    }

    /// Returns `(beautifiedNote, mode, usedFallback)`. `mode` stays
    /// `{offline, remote}` for backward compatibility even when a remote
    /// failure triggers the local recasing fallback — the fallback is
    /// instead surfaced via `usedFallback` (see DESIGN.md's Open Question 2).
    async fn beautify(&self, note: &str, job: &ComposeJob) -> (String, &'static str, bool) {
        let mut mode = if job.offline { "offline" } else { "remote" };

        if job.offline {
            match self
                .offline_beautifier
                .beautify(
                    note,
                    &job.lang,
                    job.specialty.as_deref(),
                    job.payer.as_deref(),
                    job.use_local_models,
                    job.beautify_model.as_deref(),
                )
                .await
            {
                Ok(beautified) => return (beautified, mode, false),
                Err(err) => {
                    tracing::warn!(compose_id = job.compose_id, error = %err, "offline beautify failed, downgrading to remote");
                    mode = "remote";
                }
            }
        }

        let messages = self
            .prompt_composer
            .build(note, &job.lang, job.specialty.as_deref(), job.payer.as_deref());
        let model_id = job.beautify_model.as_deref().unwrap_or("gpt-4o");
        match self.llm.call(&messages, model_id, 0.0).await {
            Ok(beautified) => (beautified.trim().to_string(), mode, false),
            Err(err) => {
                tracing::error!(compose_id = job.compose_id, error = %err, "remote beautify failed, using recasing fallback");
                let fallback = stages::recase_fallback(note);
                (if fallback.is_empty() { note.to_string() } else { fallback }, mode, true)
            }
        }
    }

    async fn run_final_review(&self, state: &mut PipelineState, job: &ComposeJob, reporter: &dyn Reporter) {
        state.stage = Stage::FinalReview;
        state.step_mut(Stage::FinalReview).status = StepStatus::InProgress;
        self.emit(state, reporter).await;

        let beautified = state
            .result
            .as_ref()
            .and_then(|r| r.get("beautifiedNote"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let codes = job
            .codes
            .iter()
            .filter_map(|item| item.get("code").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let request = ValidatorRequest {
            content: beautified,
            codes,
            prevention: job.metadata.get("preventionItems").cloned().unwrap_or_else(|| json!([])),
            diagnoses: job.metadata.get("diagnoses").cloned().unwrap_or_else(|| json!([])),
            differentials: job.metadata.get("differentials").cloned().unwrap_or_else(|| json!([])),
            compliance: job.metadata.get("complianceChecks").cloned().unwrap_or_else(|| json!([])),
        };

        let progress = Stage::FinalReview.progress_floor();
        match self.validator.validate(request).await {
            Ok(detail) => {
                let issues = detail.get("issues").cloned().unwrap_or_else(|| json!({}));
                let can_finalize = detail
                    .get("canFinalize")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                state.validation = Some(ValidationSummary {
                    ok: can_finalize,
                    issues,
                    detail,
                });
                state.progress = progress;
                let step = state.step_mut(Stage::FinalReview);
                step.progress = progress;
                if can_finalize {
                    state.status = PipelineStatus::Completed;
                    step.status = StepStatus::Completed;
                } else {
                    state.status = PipelineStatus::Blocked;
                    step.status = StepStatus::Blocked;
                    state.message = Some("Validation identified blocking issues.".to_string());
                }
                tracing::info!(
                    compose_id = state.compose_id,
                    can_finalize,
                    "final_review stage complete"
                );
            }
            Err(err) => {
                tracing::error!(compose_id = state.compose_id, error = %err, "validator call failed");
                state.status = PipelineStatus::Failed;
                state.message = Some(err.to_string());
                let step = state.step_mut(Stage::FinalReview);
                step.status = StepStatus::Failed;
            }
        }
        self.emit(state, reporter).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn job(compose_id: i64) -> ComposeJob {
        crate::fixtures::compose_job(compose_id)
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Box::new(EchoLlmClient),
            Box::new(NoOfflineBeautifier),
            Box::new(DefaultBeautifyPromptComposer),
            Box::new(PermissiveValidator),
        )
    }

    struct CountingReporter {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reporter for CountingReporter {
        async fn report(&self, _state: &PipelineState) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn full_run_completes_and_reports_each_transition() {
        let count = Arc::new(AtomicUsize::new(0));
        let reporter = CountingReporter { count: count.clone() };
        let state = pipeline().run(job(1), &reporter, None).await;

        assert_eq!(state.status, PipelineStatus::Completed);
        assert_eq!(state.progress, 1.0);
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(count.load(Ordering::SeqCst) >= 8);
    }

    #[tokio::test]
    async fn cancellation_before_stage_three_yields_cancelled_terminal() {
        let cancel = CancellationToken::new();
        let pipeline = pipeline();
        let mut job = job(2);
        job.note = "short note".to_string();

        // Cancel right away; the pipeline is polled at every stage boundary.
        cancel.cancel();
        let state = pipeline.run(job, &NoopReporter, Some(&cancel)).await;

        assert_eq!(state.status, PipelineStatus::Cancelled);
        assert_eq!(state.message.as_deref(), Some("Compose job cancelled"));
        assert_eq!(state.steps.last().unwrap().status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn blocked_when_validator_denies_finalization() {
        struct DenyValidator;
        #[async_trait]
        impl Validator for DenyValidator {
            async fn validate(&self, _request: ValidatorRequest) -> Result<Value, PipelineError> {
                Ok(json!({"issues": {"missing_code": true}, "canFinalize": false}))
            }
        }
        let pipeline = Pipeline::new(
            Box::new(EchoLlmClient),
            Box::new(NoOfflineBeautifier),
            Box::new(DefaultBeautifyPromptComposer),
            Box::new(DenyValidator),
        );
        let state = pipeline.run(job(3), &NoopReporter, None).await;
        assert_eq!(state.status, PipelineStatus::Blocked);
        assert_eq!(
            state.message.as_deref(),
            Some("Validation identified blocking issues.")
        );
    }

    #[tokio::test]
    async fn validator_error_yields_failed_terminal() {
        struct ErrorValidator;
        #[async_trait]
        impl Validator for ErrorValidator {
            async fn validate(&self, _request: ValidatorRequest) -> Result<Value, PipelineError> {
                Err(PipelineError::ValidatorProtocolError("bad response".to_string()))
            }
        }
        let pipeline = Pipeline::new(
            Box::new(EchoLlmClient),
            Box::new(NoOfflineBeautifier),
            Box::new(DefaultBeautifyPromptComposer),
            Box::new(ErrorValidator),
        );
        let state = pipeline.run(job(4), &NoopReporter, None).await;
        assert_eq!(state.status, PipelineStatus::Failed);
        assert!(state.message.unwrap().contains("bad response"));
    }

    #[tokio::test]
    async fn offline_failure_downgrades_to_remote_but_mode_label_is_remote() {
        let mut job = job(5);
        job.offline = true;
        let state = pipeline().run(job, &NoopReporter, None).await;
        let mode = state.result.unwrap().get("mode").unwrap().as_str().unwrap().to_string();
        assert_eq!(mode, "remote");
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_deterministic_recasing() {
        struct FailingLlm;
        #[async_trait]
        impl LlmClient for FailingLlm {
            async fn call(
                &self,
                _messages: &[PromptMessage],
                _model_id: &str,
                _temperature: f64,
            ) -> Result<String, PipelineError> {
                Err(PipelineError::LlmClient("upstream unavailable".to_string()))
            }
        }
        let pipeline = Pipeline::new(
            Box::new(FailingLlm),
            Box::new(NoOfflineBeautifier),
            Box::new(DefaultBeautifyPromptComposer),
            Box::new(PermissiveValidator),
        );
        let state = pipeline.run(job(6), &NoopReporter, None).await;
        assert!(state.used_fallback);
        let result = state.result.unwrap();
        assert_eq!(result.get("mode").unwrap().as_str().unwrap(), "remote");
        let note = result.get("beautifiedNote").unwrap().as_str().unwrap();
        assert!(note.chars().next().unwrap().is_uppercase());
    }

    #[tokio::test]
    async fn progress_is_monotonically_non_decreasing() {
        struct RecordingReporter {
            progress: std::sync::Mutex<Vec<f64>>,
        }
        #[async_trait]
        impl Reporter for RecordingReporter {
            async fn report(&self, state: &PipelineState) {
                self.progress.lock().unwrap().push(state.progress);
            }
        }
        let reporter = RecordingReporter { progress: std::sync::Mutex::new(Vec::new()) };
        pipeline().run(job(7), &reporter, None).await;
        let seen = reporter.progress.into_inner().unwrap();
        for window in seen.windows(2) {
            assert!(window[1] >= window[0]);
        }
    }
}

//! Fixture builders for exercising the core from outside the crate.
//!
//! Mirrors the teacher's `init_test_db` pattern: available to this crate's
//! own tests unconditionally, and to downstream crates' tests when they
//! enable the `test-support` feature. Kept intentionally small — a handful
//! of representative inputs, not a general-purpose builder DSL.

use serde_json::{json, Map};

use crate::compose::ComposeJob;
use crate::gate::GateRequest;

/// A short note body, well under every cold-start/threshold floor.
pub fn short_note_text() -> String {
    "short note without enough detail.".to_string()
}

/// A long, repetitive note body guaranteed to clear the cold-start length
/// floor and any percentage-of-length threshold by a wide margin.
pub fn long_note_text() -> String {
    let mut out = String::new();
    for i in 0..80 {
        out.push_str(&format!("sentence {i}. "));
    }
    out.push('\n');
    out
}

/// A [`GateRequest`] with a note id, `auto` intent, and `text` defaulted to
/// [`short_note_text`]. Override fields with struct update syntax as needed.
pub fn gate_request(note_id: &str) -> GateRequest {
    GateRequest {
        note_id: Some(note_id.to_string()),
        text: short_note_text(),
        intent: Some("auto".to_string()),
        ..Default::default()
    }
}

/// A [`ComposeJob`] carrying a minimal SOAP-shaped note, one billing code,
/// and one transcript turn, suitable for driving the compose pipeline end
/// to end in a test.
pub fn compose_job(compose_id: i64) -> ComposeJob {
    ComposeJob {
        compose_id,
        note: "<p>Subjective:</p>\n<p>patient feels better today.</p>".to_string(),
        metadata: Map::new(),
        codes: vec![json!({"code": "99213", "title": "Office visit"})],
        transcript: vec![json!({"speaker": "clinician", "text": "How are you feeling?"})],
        lang: "en".to_string(),
        specialty: None,
        payer: None,
        offline: false,
        use_local_models: false,
        beautify_model: None,
        session_id: Some("s1".to_string()),
        encounter_id: Some("e1".to_string()),
        note_id: Some("n1".to_string()),
        username: None,
    }
}

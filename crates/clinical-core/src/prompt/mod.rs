//! Prompt construction & cache (component D).
//!
//! Builds the two-block suggestion prompt: a stable block (rubric, schema,
//! policy) cached by `(modelId, schemaVersion)`, and a dynamic block
//! assembled from the specific request's context. Every free-text fragment
//! entering either block passes through the [`scrub::PhiScrubber`] first.

mod scrub;
mod stable;

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

pub use scrub::PhiScrubber;
pub use stable::{CacheState, PromptMessage, StableBlockCache};

use crate::config::{PhiScrubMode, PromptConfig};

/// One changed span feeding the "changed note snippets" section.
#[derive(Debug, Clone, Default)]
pub struct DiffSpan {
    pub old: String,
    pub new: String,
}

/// Capability for resolving age/sex/region-appropriate care guideline tips.
/// Out-of-scope collaborator per spec §1; injected at construction.
pub trait GuidelineSource: Send + Sync {
    /// Return candidate guideline tips for the given demographics, or an
    /// empty vec if none apply / the lookup failed.
    fn guidelines(&self, age: u32, sex: &str, region: &str) -> Vec<String>;
}

/// A guideline source with nothing to say; used when demographics aren't
/// supplied or no guideline data is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGuidelines;

impl GuidelineSource for NoGuidelines {
    fn guidelines(&self, _age: u32, _sex: &str, _region: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Context for building the dynamic suggestion-prompt block (spec §3.1
/// `DynamicPromptContext`). Free-text fields are scrubbed by the builder,
/// not by the caller.
#[derive(Debug, Clone, Default)]
pub struct DynamicPromptContext {
    pub current_note: String,
    pub previous_note: String,
    pub diff_spans: Vec<DiffSpan>,
    pub accepted_disposition: Option<serde_json::Value>,
    pub transcript: Option<String>,
    pub pmh_entries: Vec<serde_json::Value>,
    pub rules: Vec<String>,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub region: Option<String>,
    pub note_id: Option<String>,
    pub encounter_id: Option<String>,
    pub session_id: Option<String>,
    pub transcript_cursor: Option<String>,
    /// `chart` / `audio` / `files` raw attachment text, keyed by name.
    pub attachments: Vec<(String, Option<String>)>,
}

/// Builds stable and dynamic prompt blocks, scrubbing PHI at assembly time.
pub struct PromptBuilder {
    stable_cache: StableBlockCache,
    scrubber: PhiScrubber,
    schema_version: String,
    guidelines: Box<dyn GuidelineSource>,
}

impl PromptBuilder {
    pub fn new(config: &PromptConfig, scrub_mode: PhiScrubMode) -> Self {
        Self::with_guidelines(config, scrub_mode, Box::new(NoGuidelines))
    }

    pub fn with_guidelines(
        config: &PromptConfig,
        scrub_mode: PhiScrubMode,
        guidelines: Box<dyn GuidelineSource>,
    ) -> Self {
        Self {
            stable_cache: StableBlockCache::new(
                config.stable_cache_capacity,
                config.policy_version.clone(),
            ),
            scrubber: PhiScrubber::new(scrub_mode),
            schema_version: config.schema_version.clone(),
            guidelines,
        }
    }

    /// Build (or fetch) the stable block for `model_id`.
    pub fn build_stable_block(
        &self,
        model_id: Option<&str>,
    ) -> (Vec<PromptMessage>, CacheState, usize) {
        self.stable_cache.get_or_build(model_id, &self.schema_version)
    }

    /// Assemble the dynamic user-role message for `ctx`.
    pub fn build_dynamic_block(&self, ctx: &DynamicPromptContext) -> PromptMessage {
        let sanitized_note = self.scrubber.scrub(&ctx.current_note);
        let sanitized_previous = self.scrubber.scrub(&ctx.previous_note);

        let mut sections: Vec<String> = Vec::new();

        self.push_snippet_section(&mut sections, &sanitized_note, ctx);
        self.push_state_summary(&mut sections, ctx, &sanitized_note, &sanitized_previous);
        self.push_attachments(&mut sections, ctx);
        self.push_rules(&mut sections, ctx);
        self.push_disposition(&mut sections, ctx);
        self.push_transcript(&mut sections, ctx);
        self.push_pmh(&mut sections, ctx);
        self.push_guidelines(&mut sections, ctx);

        if sections.is_empty() && !sanitized_previous.is_empty() {
            let truncated: String = sanitized_previous.chars().take(200).collect();
            sections.push(format!(
                "Previous note reference: {}",
                truncated.trim_end()
            ));
        }
        if sections.is_empty() {
            sections.push(
                "No recent changes supplied; use clinician instructions and defaults."
                    .to_string(),
            );
        }

        PromptMessage {
            role: "user".to_string(),
            content: sections.join("\n\n").trim().to_string(),
        }
    }

    fn push_snippet_section(
        &self,
        sections: &mut Vec<String>,
        sanitized_note: &str,
        ctx: &DynamicPromptContext,
    ) {
        let diff_sentences = collect_diff_sentences(
            sanitized_note,
            &ctx.diff_spans,
            1,
            8,
            |text| self.scrubber.scrub(text),
        );
        if !diff_sentences.is_empty() {
            let body = bulleted(&diff_sentences);
            sections.push(format!("Changed note snippets (\u{b1}1 sentence):\n{body}"));
            return;
        }
        if sanitized_note.is_empty() {
            return;
        }
        let fallback = collect_diff_sentences(sanitized_note, &[], 0, 5, |text| {
            self.scrubber.scrub(text)
        });
        if !fallback.is_empty() {
            sections.push(format!("Key note sentences:\n{}", bulleted(&fallback)));
        }
    }

    fn push_state_summary(
        &self,
        sections: &mut Vec<String>,
        ctx: &DynamicPromptContext,
        sanitized_note: &str,
        sanitized_previous: &str,
    ) {
        let mut parts = Vec::new();
        if let Some(note_id) = non_empty_scrubbed(&self.scrubber, ctx.note_id.as_deref()) {
            parts.push(format!("noteId={note_id}"));
        }
        if let Some(encounter_id) = non_empty_scrubbed(&self.scrubber, ctx.encounter_id.as_deref())
        {
            parts.push(format!("encounterId={encounter_id}"));
        }
        if let Some(session_id) = non_empty_scrubbed(&self.scrubber, ctx.session_id.as_deref()) {
            parts.push(format!("sessionId={session_id}"));
        }
        if let Some(hash) = short_hash(sanitized_note) {
            parts.push(format!("noteHash={hash}"));
        }
        if let Some(hash) = short_hash(sanitized_previous) {
            parts.push(format!("previousHash={hash}"));
        }
        if let Some(cursor) = non_empty_scrubbed(&self.scrubber, ctx.transcript_cursor.as_deref())
        {
            parts.push(format!("cursor={cursor}"));
        }
        if let Some(disposition) = &ctx.accepted_disposition {
            if let Some(hash) = hash_json(disposition) {
                parts.push(format!("acceptedHash={hash}"));
            }
        }
        if !parts.is_empty() {
            sections.push(format!("State summary: {}", parts.join(", ")));
        }
    }

    fn push_attachments(&self, sections: &mut Vec<String>, ctx: &DynamicPromptContext) {
        if ctx.attachments.is_empty() {
            return;
        }
        let mut parts = Vec::new();
        for (key, raw) in &ctx.attachments {
            match raw {
                None => parts.push(format!("{key}=absent")),
                Some(raw) if raw.is_empty() => parts.push(format!("{key}=absent")),
                Some(raw) => {
                    let cleaned = self.scrubber.scrub(raw);
                    if cleaned.is_empty() {
                        parts.push(format!("{key}=present"));
                    } else {
                        parts.push(format!("{key}=present ({} chars)", cleaned.chars().count()));
                    }
                }
            }
        }
        if !parts.is_empty() {
            sections.push(format!("Attachments: {}", parts.join(", ")));
        }
    }

    fn push_rules(&self, sections: &mut Vec<String>, ctx: &DynamicPromptContext) {
        let lines: Vec<String> = ctx
            .rules
            .iter()
            .map(|rule| self.scrubber.scrub(rule))
            .filter(|rule| !rule.is_empty())
            .collect();
        if !lines.is_empty() {
            sections.push(format!("User rules:\n{}", bulleted(&lines)));
        }
    }

    fn push_disposition(&self, sections: &mut Vec<String>, ctx: &DynamicPromptContext) {
        let Some(disposition) = &ctx.accepted_disposition else {
            return;
        };
        let accepted = self.format_disposition_items(disposition, &["accepted", "acceptedItems", "acceptedCodes"]);
        let denied = self.format_disposition_items(
            disposition,
            &["denied", "rejected", "dismissed", "declined"],
        );
        let mut parts = Vec::new();
        if !accepted.is_empty() {
            parts.push(format!("Accepted: {}", accepted.join("; ")));
        }
        if !denied.is_empty() {
            parts.push(format!("Denied: {}", denied.join("; ")));
        }
        if !parts.is_empty() {
            sections.push(format!("Suggestion disposition: {}", parts.join("; ")));
        }
    }

    fn format_disposition_items(&self, disposition: &serde_json::Value, keys: &[&str]) -> Vec<String> {
        let items = keys
            .iter()
            .find_map(|key| disposition.get(key).and_then(|v| v.as_array()))
            .cloned()
            .unwrap_or_default();
        let mut lines = Vec::new();
        for item in items {
            let label = self.format_disposition_item(&item);
            if let Some(label) = label {
                lines.push(label);
            }
            if lines.len() >= 4 {
                break;
            }
        }
        lines
    }

    fn format_disposition_item(&self, item: &serde_json::Value) -> Option<String> {
        if let Some(text) = item.as_str() {
            let cleaned = self.scrubber.scrub(text);
            return (!cleaned.is_empty()).then_some(cleaned);
        }
        if let Some(n) = item.as_f64() {
            return Some(n.to_string());
        }
        let obj = item.as_object()?;
        let pick = |keys: &[&str]| -> Option<String> {
            keys.iter().find_map(|k| obj.get(*k)).and_then(|v| v.as_str()).map(|s| self.scrubber.scrub(s)).filter(|s| !s.is_empty())
        };
        let code = pick(&["code", "Code", "identifier", "id"]);
        let description = pick(&["description", "text", "name", "title"]);
        let rationale = pick(&["rationale", "reason", "why", "note", "summary"]);

        let mut label = match (&code, &description) {
            (Some(code), Some(description)) => Some(format!("{code} \u{2014} {description}")),
            (Some(code), None) => Some(code.clone()),
            (None, Some(description)) => Some(description.clone()),
            (None, None) => None,
        };
        if let Some(rationale) = rationale {
            label = Some(match label {
                Some(label) => format!("{label} ({rationale})"),
                None => rationale,
            });
        }
        label
    }

    fn push_transcript(&self, sections: &mut Vec<String>, ctx: &DynamicPromptContext) {
        let Some(transcript) = &ctx.transcript else {
            return;
        };
        let mut snippet = self.scrubber.scrub(transcript);
        if snippet.is_empty() {
            return;
        }
        if snippet.chars().count() > 240 {
            let truncated: String = snippet.chars().take(240).collect();
            snippet = format!("{}\u{2026}", truncated.trim_end());
        }
        sections.push(format!("Transcript snippet: {snippet}"));
    }

    fn push_pmh(&self, sections: &mut Vec<String>, ctx: &DynamicPromptContext) {
        let mut lines = Vec::new();
        for entry in &ctx.pmh_entries {
            if lines.len() >= 3 {
                break;
            }
            let label = self.pmh_label(entry);
            if let Some(label) = label {
                lines.push(format!("- {label}"));
            }
        }
        if !lines.is_empty() {
            sections.push(format!("PMH highlights:\n{}", lines.join("\n")));
        }
    }

    fn pmh_label(&self, entry: &serde_json::Value) -> Option<String> {
        if let Some(text) = entry.as_str() {
            let cleaned = self.scrubber.scrub(text);
            return (!cleaned.is_empty()).then_some(cleaned);
        }
        if let Some(n) = entry.as_f64() {
            return Some(n.to_string());
        }
        let obj = entry.as_object()?;
        for key in ["label", "name", "problem", "condition", "summary", "title"] {
            if let Some(value) = obj.get(key).and_then(|v| v.as_str()) {
                let cleaned = self.scrubber.scrub(value);
                if !cleaned.is_empty() {
                    return Some(cleaned);
                }
            }
        }
        for key in ["code", "icd10", "snomed"] {
            if let Some(value) = obj.get(key).and_then(|v| v.as_str()) {
                let cleaned = self.scrubber.scrub(value);
                if !cleaned.is_empty() {
                    return Some(cleaned);
                }
            }
        }
        None
    }

    fn push_guidelines(&self, sections: &mut Vec<String>, ctx: &DynamicPromptContext) {
        let (Some(age), Some(sex), Some(region)) = (ctx.age, ctx.sex.as_deref(), ctx.region.as_deref())
        else {
            return;
        };
        let tips = self.guidelines.guidelines(age, sex, region);
        let mut deduped = Vec::new();
        for tip in tips {
            let cleaned = self.scrubber.scrub(&tip);
            if cleaned.is_empty() || deduped.contains(&cleaned) {
                continue;
            }
            deduped.push(cleaned);
            if deduped.len() >= 5 {
                break;
            }
        }
        if !deduped.is_empty() {
            sections.push(format!(
                "Care guidelines to consider: {}",
                deduped.join(", ")
            ));
        }
    }
}

fn non_empty_scrubbed(scrubber: &PhiScrubber, value: Option<&str>) -> Option<String> {
    let value = value?;
    let cleaned = scrubber.scrub(value);
    (!cleaned.is_empty()).then_some(cleaned)
}

fn short_hash(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    Some(hex::encode(hasher.finalize())[..12].to_string())
}

fn hash_json(value: &serde_json::Value) -> Option<String> {
    let canonical = canonical_json(value)?;
    short_hash(&canonical)
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

fn bulleted(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| format!("- {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn sentence_boundary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").unwrap())
}

/// Split `text` into trimmed sentences. Equivalent to splitting on a
/// zero-width `(?<=[.!?])\s+` boundary (not expressible directly in this
/// regex engine): each match's terminal punctuation stays with the
/// preceding sentence and the separating whitespace is discarded.
fn split_sentences(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut sentences = Vec::new();
    let mut start = 0usize;
    for m in sentence_boundary_re().find_iter(text) {
        let punct_end = m.start() + 1;
        let piece = text[start..punct_end].trim();
        if !piece.is_empty() {
            sentences.push(piece.to_string());
        }
        start = m.end();
    }
    if start < text.len() {
        let piece = text[start..].trim();
        if !piece.is_empty() {
            sentences.push(piece.to_string());
        }
    }
    if sentences.is_empty() {
        let piece = text.trim();
        if !piece.is_empty() {
            sentences.push(piece.to_string());
        }
    }
    sentences
}

fn collect_diff_sentences(
    current_text: &str,
    spans: &[DiffSpan],
    window: usize,
    max_sentences: usize,
    sanitize: impl Fn(&str) -> String,
) -> Vec<String> {
    let sentences = split_sentences(current_text);
    if sentences.is_empty() {
        return Vec::new();
    }

    let mut indexes: Vec<usize> = Vec::new();
    for span in spans {
        let new_text = sanitize(&span.new);
        if new_text.is_empty() {
            continue;
        }
        let lowered = new_text.to_lowercase();
        let Some(idx) = sentences
            .iter()
            .position(|sentence| sentence.to_lowercase().contains(&lowered))
        else {
            continue;
        };
        let start = idx.saturating_sub(window);
        let end = (idx + window + 1).min(sentences.len());
        indexes.extend(start..end);
    }

    if indexes.is_empty() {
        indexes = (0..sentences.len().min(max_sentences)).collect();
    }

    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for idx in indexes {
        if seen.insert(idx) {
            ordered.push(idx);
        }
        if ordered.len() >= max_sentences {
            break;
        }
    }

    ordered
        .into_iter()
        .filter_map(|idx| {
            let sentence = sentences[idx].trim();
            (!sentence.is_empty()).then(|| sentence.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PromptConfig;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(
            &PromptConfig {
                stable_cache_capacity: 16,
                schema_version: "2024-06-01".to_string(),
                policy_version: "v1".to_string(),
            },
            PhiScrubMode::Minimum,
        )
    }

    #[test]
    fn empty_context_falls_back_to_default_message() {
        let msg = builder().build_dynamic_block(&DynamicPromptContext::default());
        assert_eq!(
            msg.content,
            "No recent changes supplied; use clinician instructions and defaults."
        );
    }

    #[test]
    fn state_summary_includes_identifiers_and_hashes() {
        let ctx = DynamicPromptContext {
            current_note: "Patient is stable.".to_string(),
            note_id: Some("n1".to_string()),
            encounter_id: Some("e1".to_string()),
            ..Default::default()
        };
        let msg = builder().build_dynamic_block(&ctx);
        assert!(msg.content.contains("noteId=n1"));
        assert!(msg.content.contains("encounterId=e1"));
        assert!(msg.content.contains("noteHash="));
    }

    #[test]
    fn diff_spans_select_surrounding_sentences() {
        let ctx = DynamicPromptContext {
            current_note: "Patient is stable. Blood pressure elevated today. Discharge planned.".to_string(),
            diff_spans: vec![DiffSpan {
                old: "normal".to_string(),
                new: "Blood pressure elevated".to_string(),
            }],
            ..Default::default()
        };
        let msg = builder().build_dynamic_block(&ctx);
        assert!(msg.content.contains("Changed note snippets"));
        assert!(msg.content.contains("Blood pressure elevated today"));
    }

    #[test]
    fn disposition_formats_accepted_and_denied() {
        let ctx = DynamicPromptContext {
            current_note: "note".to_string(),
            accepted_disposition: Some(serde_json::json!({
                "accepted": [{"code": "99213", "description": "Office visit"}],
                "denied": [{"code": "99214"}],
            })),
            ..Default::default()
        };
        let msg = builder().build_dynamic_block(&ctx);
        assert!(msg.content.contains("Accepted: 99213"));
        assert!(msg.content.contains("Denied: 99214"));
    }

    #[test]
    fn transcript_is_truncated_past_240_chars() {
        let long_transcript = "a".repeat(300);
        let ctx = DynamicPromptContext {
            current_note: "note".to_string(),
            transcript: Some(long_transcript),
            ..Default::default()
        };
        let msg = builder().build_dynamic_block(&ctx);
        assert!(msg.content.contains('\u{2026}'));
    }

    #[test]
    fn attachments_report_absent_and_present() {
        let ctx = DynamicPromptContext {
            current_note: "note".to_string(),
            attachments: vec![
                ("chart".to_string(), Some("some chart text".to_string())),
                ("audio".to_string(), None),
            ],
            ..Default::default()
        };
        let msg = builder().build_dynamic_block(&ctx);
        assert!(msg.content.contains("chart=present"));
        assert!(msg.content.contains("audio=absent"));
    }

    #[test]
    fn phi_in_every_section_is_scrubbed() {
        let ctx = DynamicPromptContext {
            current_note: "Contact jane.doe@example.com for follow up.".to_string(),
            rules: vec!["Email results to jane.doe@example.com".to_string()],
            ..Default::default()
        };
        let msg = builder().build_dynamic_block(&ctx);
        assert!(!msg.content.contains("jane.doe@example.com"));
    }

    #[test]
    fn previous_note_fallback_used_when_no_other_section_has_content() {
        let ctx = DynamicPromptContext {
            current_note: String::new(),
            previous_note: "Prior visit notes here.".to_string(),
            ..Default::default()
        };
        let msg = builder().build_dynamic_block(&ctx);
        assert!(msg.content.starts_with("Previous note reference:"));
    }
}

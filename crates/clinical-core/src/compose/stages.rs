//! Per-stage text helpers for the compose pipeline (spec §4.5.3).
//!
//! Pure functions extracted from [`super::Pipeline::run`] so each stage's
//! text transformation can be unit-tested in isolation from the
//! cancellation/reporting orchestration.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

fn html_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").unwrap())
}

/// Strip HTML tags, leaving entities intact (spec's documented behavior is
/// tag stripping only, not full sanitization).
pub fn sanitize_html(raw: &str) -> String {
    html_tag_re().replace_all(raw, "").trim().to_string()
}

/// Drop null-valued metadata entries, matching the source's dict comprehension.
pub fn normalize_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    metadata
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn patient_name(metadata: &Map<String, Value>) -> String {
    metadata
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Patient")
        .to_string()
}

fn encounter_date(metadata: &Map<String, Value>) -> String {
    metadata
        .get("encounterDate")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| chrono::Utc::now().date_naive().to_string())
}

/// Deterministic chest-pain template substituted when the sanitized note is
/// empty, parameterized by patient name and encounter date.
pub fn default_note_content(metadata: &Map<String, Value>) -> String {
    let name = patient_name(metadata);
    let date = encounter_date(metadata);
    format!(
        "PATIENT: {name}\nDATE: {date}\n\nCHIEF COMPLAINT:\n\
Chest pain for 2 days.\n\nHISTORY OF PRESENT ILLNESS:\n\
Patient reports chest pain. Started 2 days ago. Pain is sharp. \
Located in precordial region. Intermittent. Worsens with activity. \
Smoking history 1 pack per day for 30 years.\n\nPHYSICAL EXAMINATION:\n\
GENERAL: Alert, oriented, comfortable at rest\n\
CARDIOVASCULAR: Regular rate and rhythm, no murmurs, no peripheral edema\n\
RESPIRATORY: Clear to auscultation bilaterally\n\
EXTREMITIES: No cyanosis, clubbing, or edema\n\nASSESSMENT:\n\
Chest pain, likely musculoskeletal. Given smoking history and age, \
cardiac evaluation warranted.\n\nPLAN:\n\
1. EKG to rule out cardiac abnormalities\n\
2. Basic metabolic panel and lipid profile\n\
3. Consider stress testing if symptoms persist\n\
4. Smoking cessation counseling provided"
    )
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn normalize_bullet_sentence(text: &str) -> String {
    let collapsed = collapse_whitespace(text);
    if collapsed.is_empty() {
        return String::new();
    }
    if let Some(body) = collapsed
        .strip_prefix('-')
        .or_else(|| collapsed.strip_prefix('\u{2022}'))
    {
        let body = body.trim();
        return if body.is_empty() {
            "\u{2022}".to_string()
        } else {
            format!("\u{2022} {}", capitalize(body))
        };
    }
    if let Some((prefix, body)) = collapsed.split_once('.') {
        if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) {
            let body = body.trim();
            if !body.is_empty() {
                return format!("{prefix}. {}", capitalize(body));
            }
        }
    }
    collapsed
}

fn normalize_sentence(line: &str) -> String {
    let collapsed = collapse_whitespace(line);
    if collapsed.is_empty() {
        return String::new();
    }
    let starts_bullet = collapsed.starts_with('-') || collapsed.starts_with('\u{2022}');
    let starts_digit = collapsed.chars().next().is_some_and(|c| c.is_ascii_digit());
    if starts_bullet || starts_digit {
        return normalize_bullet_sentence(&collapsed);
    }
    if !collapsed.chars().next().is_some_and(char::is_alphabetic) {
        return collapsed;
    }
    capitalize(&collapsed)
}

/// Reformat `note` with upper-cased section headers (lines consisting only
/// of letters and a trailing colon) separated by blank lines, and
/// sentence-capitalize the remaining lines while preserving bullet/numbered
/// list markers.
pub fn format_note_for_enhancement(note: &str) -> String {
    let mut formatted: Vec<String> = Vec::new();
    for raw_line in note.lines() {
        let trimmed = raw_line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let letters_only = trimmed.replace(' ', "");
        let is_heading = !letters_only.is_empty()
            && letters_only.chars().all(char::is_alphabetic)
            && trimmed.ends_with(':');
        if is_heading {
            if formatted.last().is_some_and(|line| !line.is_empty()) {
                formatted.push(String::new());
            }
            formatted.push(collapse_whitespace(trimmed).to_uppercase());
            continue;
        }
        formatted.push(normalize_sentence(trimmed));
    }
    formatted.join("\n").trim().to_string()
}

fn clean_sentence(text: &str) -> String {
    let collapsed = collapse_whitespace(text);
    if collapsed.is_empty() {
        return String::new();
    }
    let capitalized = if collapsed.chars().next().is_some_and(char::is_alphabetic) {
        capitalize(&collapsed)
    } else {
        collapsed
    };
    if capitalized.ends_with(['.', '!', '?', ':', ';']) {
        capitalized
    } else {
        format!("{capitalized}.")
    }
}

fn string_field(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn first_non_empty_string_in_array(item: &Value, key: &str) -> Option<String> {
    item.get(key)?.as_array()?.iter().find_map(|entry| {
        entry
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// One `• <descriptor>: <reason>` bullet per unique selected code, evidence
/// preferred in order docSupport/details/description/aiReasoning/evidence/gaps.
pub fn build_code_justifications(codes: &[Value], metadata: &Map<String, Value>) -> Vec<String> {
    let patient = patient_name(metadata);
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for (index, item) in codes.iter().enumerate() {
        if !item.is_object() {
            continue;
        }
        let identifier = string_field(item, "code").unwrap_or_default();
        let title = string_field(item, "title")
            .or_else(|| string_field(item, "description"))
            .unwrap_or_default();
        let key_source = if !identifier.is_empty() {
            identifier.clone()
        } else if !title.is_empty() {
            title.clone()
        } else {
            string_field(item, "id").unwrap_or_else(|| (index + 1).to_string())
        };
        let key = key_source.to_lowercase();
        if !seen.insert(key) {
            continue;
        }

        let descriptor = if !identifier.is_empty() && !title.is_empty() {
            if title.to_lowercase() == identifier.to_lowercase() {
                identifier.clone()
            } else {
                format!("{identifier} \u{2013} {title}")
            }
        } else if !identifier.is_empty() {
            identifier.clone()
        } else if !title.is_empty() {
            title.clone()
        } else {
            format!("Code {}", index + 1)
        };

        let evidence = ["docSupport", "details", "description", "aiReasoning"]
            .into_iter()
            .find_map(|key| string_field(item, key))
            .or_else(|| first_non_empty_string_in_array(item, "evidence"))
            .or_else(|| first_non_empty_string_in_array(item, "gaps"));

        let reason = match evidence {
            Some(evidence) => clean_sentence(&evidence),
            None => format!("Documented findings for {patient} support this selection."),
        };
        out.push(format!("\u{2022} {descriptor}: {reason}"));
    }

    if out.is_empty() {
        out.push("\u{2022} No billing codes were selected during this workflow.".to_string());
    }
    out
}

/// Up to 3 `• [speaker: ]text` bullets from the transcript.
pub fn derive_transcript_highlights(transcript: &[Value]) -> Vec<String> {
    let mut out = Vec::new();
    for item in transcript {
        if out.len() >= 3 {
            break;
        }
        let Some(text) = string_field(item, "text") else {
            continue;
        };
        let speaker = string_field(item, "speaker");
        match speaker {
            Some(speaker) => out.push(format!("\u{2022} {speaker}: {text}")),
            None => out.push(format!("\u{2022} {text}")),
        }
    }
    out
}

/// Visit-header + key-point layout consumed by the patient-facing summary.
pub fn build_patient_summary(
    note: &str,
    metadata: &Map<String, Value>,
    code_justifications: &[String],
    transcript: &[Value],
) -> String {
    let name = patient_name(metadata);
    let date = encounter_date(metadata);

    let key_points: Vec<String> = note
        .split("\n\n")
        .map(collapse_whitespace)
        .filter(|block| !block.is_empty())
        .take(6)
        .map(|block| format!("\u{2022} {block}"))
        .collect();

    let highlights = derive_transcript_highlights(transcript);
    let billing_points: Vec<String> = code_justifications
        .iter()
        .map(|entry| format!("\u{2022} {}", entry.trim_start_matches(['\u{2022}', ' ']).trim()))
        .collect();

    let mut lines = vec![
        format!("VISIT SUMMARY FOR: {name}"),
        format!("DATE: {date}"),
        String::new(),
        "WHAT WE DISCUSSED:".to_string(),
    ];
    if key_points.is_empty() {
        lines.push("\u{2022} Please review the clinical note for visit details.".to_string());
    } else {
        lines.extend(key_points);
    }
    if !highlights.is_empty() {
        lines.push(String::new());
        lines.push("CONVERSATION HIGHLIGHTS:".to_string());
        lines.extend(highlights);
    }
    if !billing_points.is_empty() {
        lines.push(String::new());
        lines.push("BILLING CODES & REASONS:".to_string());
        lines.extend(billing_points);
    }
    lines.push(String::new());
    lines.push("NEXT STEPS:".to_string());
    lines.push("\u{2022} Follow the care plan outlined above.".to_string());
    lines.push("\u{2022} Contact the clinic if symptoms change or new concerns arise.".to_string());

    lines.join("\n")
}

/// Deterministic re-casing fallback for a failed remote beautify call: split
/// on ". ", upper-case the first letter of each sentence, rejoin with a
/// single space.
pub fn recase_fallback(note: &str) -> String {
    let sentences: Vec<String> = note
        .split(". ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(capitalize)
        .collect();
    if sentences.is_empty() {
        note.to_string()
    } else {
        sentences.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_html_strips_tags_keeps_entities() {
        assert_eq!(sanitize_html("<b>Bold</b> &amp; text"), "Bold &amp; text");
    }

    #[test]
    fn default_note_uses_patient_name() {
        let mut metadata = Map::new();
        metadata.insert("name".to_string(), json!("Jane Doe"));
        let note = default_note_content(&metadata);
        assert!(note.starts_with("PATIENT: Jane Doe"));
    }

    #[test]
    fn format_note_uppercases_headings() {
        let note = "subjective:\npatient feels fine.\n\nplan:\n1. continue meds";
        let formatted = format_note_for_enhancement(note);
        assert!(formatted.contains("SUBJECTIVE:"));
        assert!(formatted.contains("PLAN:"));
        assert!(formatted.contains("Patient feels fine."));
    }

    #[test]
    fn format_note_falls_back_when_empty() {
        assert_eq!(format_note_for_enhancement(""), "");
    }

    #[test]
    fn code_justifications_dedupe_and_use_evidence() {
        let codes = vec![
            json!({"code": "99213", "title": "Office visit", "details": "supports E/M level"}),
            json!({"code": "99213", "title": "duplicate"}),
        ];
        let out = build_code_justifications(&codes, &Map::new());
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("99213"));
        assert!(out[0].contains("supports E/M level"));
    }

    #[test]
    fn code_justifications_default_when_empty() {
        let out = build_code_justifications(&[], &Map::new());
        assert_eq!(out, vec!["\u{2022} No billing codes were selected during this workflow."]);
    }

    #[test]
    fn transcript_highlights_cap_at_three() {
        let transcript: Vec<Value> = (0..5)
            .map(|i| json!({"speaker": "clinician", "text": format!("line {i}")}))
            .collect();
        assert_eq!(derive_transcript_highlights(&transcript).len(), 3);
    }

    #[test]
    fn patient_summary_includes_billing_and_next_steps() {
        let summary = build_patient_summary(
            "Patient is stable.\n\nFollow up in two weeks.",
            &Map::new(),
            &["\u{2022} 99213: supports visit.".to_string()],
            &[],
        );
        assert!(summary.contains("VISIT SUMMARY FOR: Patient"));
        assert!(summary.contains("BILLING CODES & REASONS"));
        assert!(summary.contains("NEXT STEPS:"));
    }

    #[test]
    fn recase_fallback_capitalizes_each_sentence() {
        let out = recase_fallback("hello there. this is a test. final clause");
        assert_eq!(out, "Hello there This is a test Final clause");
    }
}

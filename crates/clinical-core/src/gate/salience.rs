//! Clinical salience heuristics used to bypass the gate's lexical/semantic
//! thresholds when a change carries inherent clinical weight.

use std::sync::OnceLock;

use regex::Regex;

fn vitals_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(bp\s*\d{2,3}/\d{2,3}|hr\s*\d{2,3}|spo2\s*\d{2,3}%)").unwrap()
    })
}

fn labs_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(na|k|cr|hba1c|hgb|wbc)\b\s*(\d+(?:\.\d+)?(?:\s*(?:mmol/l|mg/dl|g/dl|%))?)")
            .unwrap()
    })
}

fn meds_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[a-z]+(?:\s+[a-z]+)?\s+\d+\s*(?:mg|mcg|u)\s+(?:bid|tid|qhs|qam|prn)").unwrap()
    })
}

fn procedure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(ekg|cxr|mri|colonoscopy|ct)\b").unwrap())
}

fn diagnostic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(pneumonia|nstemi|r/o\s+pe)").unwrap())
}

fn negation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bdenies\b").unwrap())
}

fn positive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(reports|endorses|admits|has|experiencing)\b").unwrap())
}

/// True when the changed span carries inherent clinical weight: a vitals,
/// labs, medication-dosing, procedure, or diagnostic pattern appears
/// anywhere in the combined old/new spans, or a negation in the prior span
/// was lifted (or a positive-finding phrase newly introduced) in the new
/// span.
pub fn has_salience(old_span: &str, new_span: &str) -> bool {
    let combined = format!("{old_span} {new_span}");
    if vitals_re().is_match(&combined)
        || labs_re().is_match(&combined)
        || meds_re().is_match(&combined)
        || procedure_re().is_match(&combined)
        || diagnostic_re().is_match(&combined)
    {
        return true;
    }

    let old_negated = negation_re().is_match(old_span);
    let new_negated = negation_re().is_match(new_span);
    if old_negated && !new_negated {
        return true;
    }

    let new_positive = positive_re().is_match(new_span);
    if new_positive && !new_negated && !old_negated {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vitals_pattern_is_salient() {
        assert!(has_salience("stable", "bp 170/110 noted"));
    }

    #[test]
    fn labs_pattern_is_salient() {
        assert!(has_salience("", "k 6.2 mmol/l"));
    }

    #[test]
    fn procedure_mention_is_salient() {
        assert!(has_salience("", "ordered a cxr today"));
    }

    #[test]
    fn lifted_negation_is_salient() {
        assert!(has_salience("denies chest pain", "chest pain now present"));
    }

    #[test]
    fn new_positive_finding_without_prior_negation_is_salient() {
        assert!(has_salience("", "patient reports nausea"));
    }

    #[test]
    fn unrelated_edit_is_not_salient() {
        assert!(!has_salience("patient is resting", "patient is comfortable"));
    }

    #[test]
    fn negation_carried_through_is_not_salient() {
        assert!(!has_salience("denies fever", "denies fever or chills"));
    }
}

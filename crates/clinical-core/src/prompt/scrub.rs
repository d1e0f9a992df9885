//! Regex-based PHI scrubber (spec §4.4.3).
//!
//! Tokenizes detected PHI categories and replaces each span with
//! `[<TAG>:<10-hex-of-sha1-of-raw>]`. Precedence follows the spec literally:
//! DOB > DATE > SSN > PHONE > ADDRESS > EMAIL > URL > IP > MRN > NAME, with
//! email handled ahead of the URL pass so a URL pattern can't partially
//! consume an email address. Redaction is idempotent: a span already shaped
//! like `[TAG:hex]` is left untouched.

use std::sync::OnceLock;

use regex::Regex;
use sha1::{Digest, Sha1};

use crate::config::PhiScrubMode;

fn dob_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bDOB[:\s]+(\d{1,2}/\d{1,2}/\d{2,4})\b").unwrap())
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{4}-\d{2}-\d{2}|(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)[a-z]*\s+\d{1,2}(?:st|nd|rd|th)?(?:,\s+\d{4})?|\d{1,2}\s+(?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{4})\b",
        )
        .unwrap()
    })
}

fn ssn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{3}-?\d{2}-?\d{4}\b").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:(?:\+?\d{1,3}[\s-]?)?(?:\(\d{2,4}\)|\d{2,4})[\s-])\d{3,4}[\s-]\d{3,4}")
            .unwrap()
    })
}

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b\d{1,5}\s+([A-Za-z0-9'.]+\s){0,4}(?:St\.?|Street|Ave\.?|Avenue|Rd\.?|Road|Blvd\.?|Lane|Ln\.?|Dr\.?|Drive|Broadway)\b",
        )
        .unwrap()
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap())
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:(?:https?://|www\.)[^\s@]+)").unwrap())
}

fn ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap())
}

fn mrn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bMRN\s*(\d{5,10})\b").unwrap())
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:Dr\.?\s+)?([A-Z][a-z]+(?:[-' ](?:de |la |von |van )?[A-Z][a-z]+)*)\b")
            .unwrap()
    })
}

fn hash10(raw: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(raw.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..10].to_string()
}

fn already_tokenized(raw: &str) -> bool {
    raw.starts_with('[') && raw.contains(':') && raw.ends_with(']')
}

fn apply(text: &str, re: &Regex, tag: &str) -> String {
    re.replace_all(text, |caps: &regex::Captures| {
        let raw = caps.get(0).unwrap().as_str().trim().trim_end_matches('.');
        if already_tokenized(raw) {
            raw.to_string()
        } else {
            format!("[{tag}:{}]", hash10(raw))
        }
    })
    .into_owned()
}

/// PHI detection order; email is threaded in ahead of URL so URL scanning
/// never swallows an email address.
const TOKEN_ORDER: &[(fn() -> &'static Regex, &str)] = &[
    (dob_re, "DOB"),
    (date_re, "DATE"),
    (ssn_re, "SSN"),
    (phone_re, "PHONE"),
    (address_re, "ADDRESS"),
    (email_re, "EMAIL"),
    (url_re, "URL"),
    (ip_re, "IP"),
    (mrn_re, "MRN"),
    (name_re, "NAME"),
];

fn regex_scrub(text: &str) -> String {
    // SSN and EMAIL run once up front, then the full precedence pass, then a
    // final idempotent safety pass over both — mirrors the source engine's
    // belt-and-braces ordering.
    let mut out = apply(text, ssn_re(), "SSN");
    out = apply(&out, email_re(), "EMAIL");
    for (regex_fn, tag) in TOKEN_ORDER {
        out = apply(&out, regex_fn(), tag);
    }
    out = apply(&out, ssn_re(), "SSN");
    out = apply(&out, email_re(), "EMAIL");
    out
}

/// PHI scrubber. Reads its mode once at construction (§4.4.3's
/// [SUPPLEMENT]): `minimum` runs the full regex pipeline, `off` still
/// collapses whitespace but skips tokenization entirely.
#[derive(Debug, Clone, Copy)]
pub struct PhiScrubber {
    mode: PhiScrubMode,
}

impl PhiScrubber {
    pub fn new(mode: PhiScrubMode) -> Self {
        Self { mode }
    }

    /// Whether this scrubber will tokenize PHI (`false` for `off` mode).
    pub fn is_enabled(&self) -> bool {
        matches!(self.mode, PhiScrubMode::Minimum)
    }

    /// Scrub `text`, collapsing internal whitespace and trimming regardless
    /// of mode; tokenization only runs in `minimum` mode.
    pub fn scrub(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let scrubbed = match self.mode {
            PhiScrubMode::Minimum => regex_scrub(text),
            PhiScrubMode::Off => text.to_string(),
        };
        collapse_whitespace(&scrubbed)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

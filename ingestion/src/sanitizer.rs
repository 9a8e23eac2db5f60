use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());
static STYLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap());
static EVENT_HANDLER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\son\w+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap());
static DATA_URI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)data:[^\s"'>]+"#).unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Document-store operators in a control position: an operator token
/// followed by a colon, i.e. used as a field name, not mentioned in
/// prose.
static STORE_OPERATOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)["']?\$(where|regex|eq|ne|gt|gte|lt|lte|in|nin|or|and|not|nor|exists|expr|function|accumulator|set|unset|inc|push|rename)["']?\s*:"#,
    )
    .unwrap()
});

/// SQL shapes that only appear when a statement is being smuggled into a
/// clause head: stacked statements, UNION SELECT, quote-or-equals.
static SQL_INJECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(;\s*(drop|delete|truncate|update|insert|alter)\b)|(\bunion\s+(all\s+)?select\b)|('\s*(or|and)\s+[\d']{1,10}\s*=)",
    )
    .unwrap()
});

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap());
static NATIONAL_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static PAYMENT_CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ -]?){12,15}\d\b").unwrap());
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+\d{7,15}\b|\b\d{3}[-. ]\d{3,4}[-. ]\d{4}\b").unwrap()
});
static PASSPORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{1,2}\d{6,9}\b").unwrap());
static DOB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(19|20)\d{2}[-/.](0?[1-9]|1[0-2])[-/.](0?[1-9]|[12]\d|3[01])\b|\b(0?[1-9]|[12]\d|3[01])/(0?[1-9]|1[0-2])/(19|20)\d{2}\b",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiClass {
    Email,
    NationalId,
    PaymentCard,
    Phone,
    Passport,
    DateOfBirth,
}

impl PiiClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiClass::Email => "email",
            PiiClass::NationalId => "national_id",
            PiiClass::PaymentCard => "payment_card",
            PiiClass::Phone => "phone",
            PiiClass::Passport => "passport",
            PiiClass::DateOfBirth => "date_of_birth",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizeOutcome {
    pub sanitized: String,
    pub warnings: Vec<String>,
    pub pii_classes: BTreeSet<PiiClass>,
}

impl SanitizeOutcome {
    pub fn is_empty(&self) -> bool {
        self.sanitized.trim().is_empty()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("injection indicator in control position: {0}")]
    Injection(String),
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    max_chars: usize,
}

impl Sanitizer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    /// Strip markup and active content, normalize whitespace, cap length,
    /// then scan for injection shapes and PII classes. Injection in a
    /// control position rejects outright; PII classes are reported and
    /// the caller decides (ingest rejects, query logs).
    pub fn sanitize(&self, input: &str) -> Result<SanitizeOutcome, SanitizeError> {
        let mut warnings = Vec::new();

        let mut text = SCRIPT_RE.replace_all(input, " ").into_owned();
        text = STYLE_RE.replace_all(&text, " ").into_owned();
        if EVENT_HANDLER_RE.is_match(&text) {
            warnings.push("removed inline event handlers".to_string());
            text = EVENT_HANDLER_RE.replace_all(&text, " ").into_owned();
        }
        if DATA_URI_RE.is_match(&text) {
            warnings.push("removed data uris".to_string());
            text = DATA_URI_RE.replace_all(&text, " ").into_owned();
        }
        text = TAG_RE.replace_all(&text, " ").into_owned();

        let mut text = normalize_whitespace(&text);

        if text.chars().count() > self.max_chars {
            warnings.push(format!("content capped at {} characters", self.max_chars));
            text = text.chars().take(self.max_chars).collect();
        }

        if let Some(indicator) = injection_indicator(&text) {
            return Err(SanitizeError::Injection(indicator));
        }

        let pii_classes = detect_pii(&text);
        if !pii_classes.is_empty() {
            debug!(classes = ?pii_classes, "pii classes detected");
        }

        Ok(SanitizeOutcome {
            sanitized: text,
            warnings,
            pii_classes,
        })
    }
}

/// Zs runs collapse to one ASCII space; newlines survive (capped at one
/// blank line) so paragraph boundaries reach the chunker; all other C*
/// characters are dropped.
fn normalize_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_spaces = 0usize;
    let mut pending_newlines = 0usize;

    for ch in input.chars() {
        if ch == '\n' || ch == '\r' {
            if ch == '\n' {
                pending_newlines += 1;
            }
            continue;
        }
        if ch == '\t' || ch.is_whitespace() {
            pending_spaces += 1;
            continue;
        }
        if ch.is_control() {
            continue;
        }

        if pending_newlines > 0 {
            if !out.is_empty() {
                out.push_str(if pending_newlines >= 2 { "\n\n" } else { "\n" });
            }
            pending_newlines = 0;
            pending_spaces = 0;
        } else if pending_spaces > 0 {
            if !out.is_empty() {
                out.push(' ');
            }
            pending_spaces = 0;
        }
        out.push(ch);
    }

    out
}

fn injection_indicator(text: &str) -> Option<String> {
    if let Some(found) = STORE_OPERATOR_RE.find(text) {
        return Some(format!("store operator {}", found.as_str().trim()));
    }
    if let Some(found) = SQL_INJECTION_RE.find(text) {
        return Some(format!("sql shape {}", found.as_str().trim()));
    }
    None
}

fn detect_pii(text: &str) -> BTreeSet<PiiClass> {
    let mut classes = BTreeSet::new();
    if EMAIL_RE.is_match(text) {
        classes.insert(PiiClass::Email);
    }
    if NATIONAL_ID_RE.is_match(text) {
        classes.insert(PiiClass::NationalId);
    }
    if PAYMENT_CARD_RE.is_match(text) {
        classes.insert(PiiClass::PaymentCard);
    }
    if PHONE_RE.is_match(text) {
        classes.insert(PiiClass::Phone);
    }
    if PASSPORT_RE.is_match(text) {
        classes.insert(PiiClass::Passport);
    }
    if DOB_RE.is_match(text) {
        classes.insert(PiiClass::DateOfBirth);
    }
    classes
}

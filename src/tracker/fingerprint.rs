//! Message normalization and fingerprinting

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use super::classify::ErrorCategory;

/// Hex characters kept from the SHA-256 digest
const FINGERPRINT_LEN: usize = 16;

/// Dynamic-value patterns, applied in order
static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r#"[a-zA-Z][a-zA-Z0-9+.-]*://[^\s"'<>]+"#, "<url>"),
        (r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}", "<email>"),
        (
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            "<uuid>",
        ),
        (r"\b[0-9a-fA-F]{16,}\b", "<hash>"),
        (r"\d+", "<n>"),
    ]
    .into_iter()
    .map(|(pattern, placeholder)| (Regex::new(pattern).expect("static regex"), placeholder))
    .collect()
});

/// Replace URLs, emails, UUIDs, hash-like tokens and digit runs with placeholders
#[must_use]
pub fn normalize_message(message: &str) -> String {
    let mut normalized = message.trim().to_string();
    for (re, placeholder) in PATTERNS.iter() {
        normalized = re.replace_all(&normalized, *placeholder).into_owned();
    }
    normalized
}

/// Stable hash of category, normalized message and the first `frames` stack frames
#[must_use]
pub fn fingerprint(category: ErrorCategory, message: &str, stack: &[String], frames: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(normalize_message(message).as_bytes());
    hasher.update(b"\0");
    for frame in stack.iter().take(frames) {
        hasher.update(frame.as_bytes());
        hasher.update(b"\n");
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

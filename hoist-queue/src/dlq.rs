//! Dead-letter pattern analysis.
//!
//! Dead jobs are clustered by a fingerprint of their last error message,
//! normalized by a stable redaction rule: UUIDs, quoted strings and digit
//! runs are replaced by placeholders, so `"connection timeout after 30s
//! (req 7f3a...)"` and `"connection timeout after 31s (req 99d0...)"`
//! land in the same pattern.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::DlqEntry;

static RE_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("uuid regex")
});
static RE_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).expect("quoted regex"));
static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("digits regex"));
static RE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("space regex"));

/// Normalize an error message for pattern clustering.
pub fn normalize_error(message: &str) -> String {
    let s = RE_UUID.replace_all(message, "<uuid>");
    let s = RE_QUOTED.replace_all(&s, "<str>");
    let s = RE_DIGITS.replace_all(&s, "<n>");
    let s = RE_SPACE.replace_all(&s, " ");
    s.trim().to_ascii_lowercase()
}

/// Stable pattern fingerprint: truncated hex SHA-256 of the normalized
/// message.
pub fn error_fingerprint(message: &str) -> String {
    let normalized = normalize_error(message);
    let digest = Sha256::digest(normalized.as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for b in bytes {
        if out.len() >= len {
            break;
        }
        out.push_str(&format!("{b:02x}"));
    }
    out.truncate(len);
    out
}

/// One failure cluster in a dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqPattern {
    /// Fingerprint hash identifying the cluster.
    pub id: String,
    /// A representative raw error message.
    pub exemplar: String,
    pub count: u64,
    pub job_types: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Cluster DLQ entries by fingerprint, most frequent first.
pub fn group_patterns(entries: &[DlqEntry]) -> Vec<DlqPattern> {
    let mut patterns: Vec<DlqPattern> = Vec::new();
    for entry in entries {
        let exemplar = entry
            .record
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        match patterns.iter_mut().find(|p| p.id == entry.fingerprint) {
            Some(p) => {
                p.count += 1;
                if !p.job_types.contains(&entry.record.message.job_type) {
                    p.job_types.push(entry.record.message.job_type.clone());
                }
                p.first_seen = p.first_seen.min(entry.died_at);
                p.last_seen = p.last_seen.max(entry.died_at);
            }
            None => patterns.push(DlqPattern {
                id: entry.fingerprint.clone(),
                exemplar,
                count: 1,
                job_types: vec![entry.record.message.job_type.clone()],
                first_seen: entry.died_at,
                last_seen: entry.died_at,
            }),
        }
    }
    patterns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_variable_parts() {
        let a = normalize_error("connection timeout after 30s (request 111)");
        let b = normalize_error("connection timeout after 31s (request 999)");
        assert_eq!(a, b);
        assert_eq!(a, "connection timeout after <n>s (request <n>)");
    }

    #[test]
    fn normalization_strips_uuids_and_quotes() {
        let a = normalize_error("no row 'orders-7' for id 550e8400-e29b-41d4-a716-446655440000");
        let b = normalize_error("no row 'users-9' for id 01234567-89ab-cdef-0123-456789abcdef");
        assert_eq!(a, b);
        assert!(a.contains("<uuid>"));
        assert!(a.contains("<str>"));
    }

    #[test]
    fn distinct_errors_get_distinct_fingerprints() {
        assert_ne!(
            error_fingerprint("connection timeout after 30s"),
            error_fingerprint("invalid JSON")
        );
    }

    #[test]
    fn equivalent_errors_share_a_fingerprint() {
        assert_eq!(
            error_fingerprint("connection timeout after 30s"),
            error_fingerprint("connection timeout after 59s")
        );
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let f = error_fingerprint("whatever");
        assert_eq!(f.len(), 16);
        assert!(f.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

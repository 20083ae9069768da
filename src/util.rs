use chrono::{DateTime, Utc};
use sha2::Digest;

/// Truncate to at most `max_bytes`, never splitting a character.
pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// First 12 hex digits of the content hash, for file name suffixes.
pub fn short_hash(bytes: &[u8]) -> String {
    let mut digest = sha256_hex(bytes);
    digest.truncate(12);
    digest
}

/// Compact UTC timestamp used in generated file names (`20261018-093000`).
pub fn file_tag(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d-%H%M%S").to_string()
}

/// RFC 3339 UTC timestamp with seconds precision and a `Z` suffix.
pub fn iso_seconds(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Make a revision token safe to embed in a file name.
pub fn file_safe(token: &str) -> String {
    let cleaned: String = token
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "none".to_string()
    } else {
        cleaned
    }
}

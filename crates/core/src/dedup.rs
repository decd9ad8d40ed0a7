//! Dedup key derivation.
//!
//! A caller-supplied idempotency token is always the key. Without one the key
//! is a fingerprint of the trimmed prompt, the generation parameters and a
//! coarse time bucket. Two identical submissions that straddle a bucket
//! boundary get different fingerprints, so the fallback only catches
//! duplicates that arrive close together; clients that need a hard guarantee
//! must send a token.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_FINGERPRINT_BUCKET: Duration = Duration::from_secs(1);
const FINGERPRINT_PREFIX: &str = "fp-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupKey {
    Explicit(String),
    Fingerprint(String),
}

impl DedupKey {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Explicit(key) | Self::Fingerprint(key) => key,
        }
    }

    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Explicit(_))
    }
}

pub fn effective_dedup_key(
    explicit: Option<&str>,
    prompt: &str,
    parameters: &Map<String, Value>,
    now: DateTime<Utc>,
    bucket: Duration,
) -> DedupKey {
    if let Some(token) = explicit.map(str::trim).filter(|token| !token.is_empty()) {
        return DedupKey::Explicit(token.to_string());
    }
    DedupKey::Fingerprint(fingerprint(prompt, parameters, now, bucket))
}

fn fingerprint(
    prompt: &str,
    parameters: &Map<String, Value>,
    now: DateTime<Utc>,
    bucket: Duration,
) -> String {
    let bucket_ms = (bucket.as_millis() as i64).max(1);
    let bucket_index = now.timestamp_millis().div_euclid(bucket_ms);

    // serde_json's default map is ordered, so equal parameters encode equally.
    let encoded_parameters = serde_json::to_string(parameters).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(prompt.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(encoded_parameters.as_bytes());
    hasher.update(b"\n");
    hasher.update(bucket_index.to_string().as_bytes());
    format!("{FINGERPRINT_PREFIX}{:x}", hasher.finalize())
}

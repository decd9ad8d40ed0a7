//! Time-limited download URLs for generation results held in object storage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::SignerConfig;
use crate::error::SigningError;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(60 * 60);
/// Longest lifetime the storage service accepts for a V4 signature.
pub const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const STORAGE_SCHEME: &str = "gs://";
const STORAGE_HOST: &str = "storage.googleapis.com";
const SIGNING_ALGORITHM: &str = "GOOG4-HMAC-SHA256";
const SIGNING_REGION: &str = "auto";
const SIGNING_SERVICE: &str = "storage";
const SIGNING_REQUEST_TYPE: &str = "goog4_request";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    pub bucket: String,
    pub path: String,
}

/// Split a `gs://bucket/path` reference. Anything else is not a storage
/// object and yields `Ok(None)`.
pub fn parse_storage_reference(reference: &str) -> Result<Option<StorageObject>, SigningError> {
    let Some(rest) = reference.trim().strip_prefix(STORAGE_SCHEME) else {
        return Ok(None);
    };
    let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() || path.is_empty() {
        return Err(SigningError::InvalidRequest(format!(
            "storage reference has no bucket or object path: {reference}"
        )));
    }
    Ok(Some(StorageObject {
        bucket: bucket.to_string(),
        path: path.to_string(),
    }))
}

#[async_trait]
pub trait StorageSigner: Send + Sync {
    async fn signed_url(&self, object: &StorageObject, ttl: Duration) -> Result<String, SigningError>;
}

/// V4 query-string signer using an HMAC interoperability key.
#[derive(Clone)]
pub struct HmacV4Signer {
    access_id: String,
    secret: String,
}

impl std::fmt::Debug for HmacV4Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacV4Signer")
            .field("access_id", &self.access_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl HmacV4Signer {
    pub fn new(access_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            access_id: access_id.into(),
            secret: secret.into(),
        }
    }

    pub fn from_env(access_id_var: &str, secret_var: &str) -> Result<Self, SigningError> {
        let read = |var: &str| {
            std::env::var(var)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    SigningError::MissingCredentials(format!("environment variable {var} is not set"))
                })
        };
        Ok(Self::new(read(access_id_var)?, read(secret_var)?))
    }

    pub fn sign_at(
        &self,
        object: &StorageObject,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, SigningError> {
        let expires = ttl.as_secs();
        if expires == 0 || ttl > MAX_SIGNED_URL_TTL {
            return Err(SigningError::InvalidRequest(format!(
                "signed URL lifetime must be between 1 and {} seconds, got {expires}",
                MAX_SIGNED_URL_TTL.as_secs()
            )));
        }

        let datestamp = now.format("%Y%m%d").to_string();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope =
            format!("{datestamp}/{SIGNING_REGION}/{SIGNING_SERVICE}/{SIGNING_REQUEST_TYPE}");
        let credential = format!("{}/{scope}", self.access_id);

        let mut query = BTreeMap::new();
        query.insert("X-Goog-Algorithm", SIGNING_ALGORITHM.to_string());
        query.insert("X-Goog-Credential", credential);
        query.insert("X-Goog-Date", timestamp.clone());
        query.insert("X-Goog-Expires", expires.to_string());
        query.insert("X-Goog-SignedHeaders", "host".to_string());
        let canonical_query = query
            .iter()
            .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_path = format!("/{}/{}", object.bucket, encode_object_path(&object.path));
        let canonical_request = format!(
            "GET\n{canonical_path}\n{canonical_query}\nhost:{STORAGE_HOST}\n\nhost\nUNSIGNED-PAYLOAD"
        );
        let string_to_sign = format!(
            "{SIGNING_ALGORITHM}\n{timestamp}\n{scope}\n{:x}",
            Sha256::digest(canonical_request.as_bytes())
        );

        let mut key = hmac_bytes(format!("GOOG4{}", self.secret).as_bytes(), datestamp.as_bytes())?;
        for part in [SIGNING_REGION, SIGNING_SERVICE, SIGNING_REQUEST_TYPE] {
            key = hmac_bytes(&key, part.as_bytes())?;
        }
        let signature = hex_lower(&hmac_bytes(&key, string_to_sign.as_bytes())?);

        Ok(format!(
            "https://{STORAGE_HOST}{canonical_path}?{canonical_query}&X-Goog-Signature={signature}"
        ))
    }
}

#[async_trait]
impl StorageSigner for HmacV4Signer {
    async fn signed_url(&self, object: &StorageObject, ttl: Duration) -> Result<String, SigningError> {
        self.sign_at(object, ttl, Utc::now())
    }
}

/// Stand-in used when no signing credentials are configured; every signing
/// attempt reports why.
#[derive(Debug, Clone)]
pub struct UnavailableSigner {
    reason: String,
}

impl UnavailableSigner {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl StorageSigner for UnavailableSigner {
    async fn signed_url(&self, _object: &StorageObject, _ttl: Duration) -> Result<String, SigningError> {
        Err(SigningError::MissingCredentials(self.reason.clone()))
    }
}

pub fn signer_from_config(config: &SignerConfig) -> Arc<dyn StorageSigner> {
    match HmacV4Signer::from_env(&config.access_id_env, &config.secret_env) {
        Ok(signer) => {
            info!(access_id_env = %config.access_id_env, "Storage URL signing enabled");
            Arc::new(signer)
        }
        Err(err) => {
            warn!(error = %err, "Storage URL signing disabled; finished results cannot be signed");
            Arc::new(UnavailableSigner::new(err.to_string()))
        }
    }
}

fn encode_object_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn hmac_bytes(key: &[u8], payload: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| SigningError::Backend(format!("invalid signing key: {err}")))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{AuthConfig, AuthMode};
use crate::error::UpstreamError;

const GCLOUD_TOKEN_LIFETIME: Duration = Duration::from_secs(45 * 60);
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Yields a bearer token for the upstream API on demand.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, UpstreamError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

#[derive(Debug, Default)]
struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<String, UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(String, Duration), UpstreamError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.token.clone());
            }
        }
        let (token, lifetime) = refresh().await?;
        *slot = Some(CachedToken {
            token: token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token)
    }
}

/// Token read once from an environment variable.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn from_env(var: &str) -> Result<Self, UpstreamError> {
        match std::env::var(var) {
            Ok(token) if !token.trim().is_empty() => Ok(Self::new(token.trim())),
            _ => Err(UpstreamError::Auth(format!(
                "environment variable {var} is not set"
            ))),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, UpstreamError> {
        Ok(self.token.clone())
    }
}

/// Shells out to `gcloud auth print-access-token` and caches the result.
#[derive(Debug)]
pub struct GcloudTokenProvider {
    program: String,
    cache: TokenCache,
}

impl GcloudTokenProvider {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            cache: TokenCache::default(),
        }
    }

    async fn print_access_token(&self) -> Result<(String, Duration), UpstreamError> {
        let output = Command::new(&self.program)
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| UpstreamError::Auth(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpstreamError::Auth(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(UpstreamError::Auth(format!(
                "{} printed an empty access token",
                self.program
            )));
        }
        debug!(program = %self.program, "Refreshed access token via gcloud");
        Ok((token, GCLOUD_TOKEN_LIFETIME))
    }
}

#[async_trait]
impl TokenProvider for GcloudTokenProvider {
    async fn access_token(&self) -> Result<String, UpstreamError> {
        self.cache.get_or_refresh(|| self.print_access_token()).await
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

/// Token from the compute metadata server of the host VM / container.
#[derive(Debug)]
pub struct MetadataTokenProvider {
    client: reqwest::Client,
    url: String,
    cache: TokenCache,
}

impl MetadataTokenProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_url(client, METADATA_TOKEN_URL)
    }

    pub fn with_url(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            cache: TokenCache::default(),
        }
    }

    async fn fetch_token(&self) -> Result<(String, Duration), UpstreamError> {
        let resp = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| UpstreamError::Auth(format!("metadata server unreachable: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Auth(format!(
                "metadata server returned HTTP {}",
                status.as_u16()
            )));
        }

        let token: MetadataToken = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Auth(format!("invalid metadata token response: {e}")))?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(
            expires_in = token.expires_in,
            "Refreshed access token via metadata server"
        );
        Ok((token.access_token, lifetime))
    }
}

#[async_trait]
impl TokenProvider for MetadataTokenProvider {
    async fn access_token(&self) -> Result<String, UpstreamError> {
        self.cache.get_or_refresh(|| self.fetch_token()).await
    }
}

pub fn token_provider_from_config(
    config: &AuthConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn TokenProvider>, UpstreamError> {
    Ok(match config.mode {
        AuthMode::Env => Arc::new(StaticTokenProvider::from_env(&config.token_env)?),
        AuthMode::Gcloud => Arc::new(GcloudTokenProvider::new(config.gcloud_bin.clone())),
        AuthMode::Metadata => Arc::new(MetadataTokenProvider::new(client)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[tokio::test]
    async fn static_provider_returns_token() {
        let provider = StaticTokenProvider::new("ya29.token");
        assert_eq!(provider.access_token().await.unwrap(), "ya29.token");
    }

    #[test]
    fn static_provider_from_missing_env_is_auth_error() {
        let err = StaticTokenProvider::from_env("REELQUEUE_TEST_TOKEN_THAT_IS_NOT_SET").unwrap_err();
        assert!(matches!(err, UpstreamError::Auth(_)));
    }

    #[tokio::test]
    async fn missing_gcloud_binary_is_auth_error() {
        let provider = GcloudTokenProvider::new("/nonexistent/reelqueue-gcloud");
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Auth(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_reuses_token_until_refresh_time() {
        let cache = TokenCache::default();
        let refreshes = AtomicUsize::new(0);
        let refresh = || async {
            let n = refreshes.fetch_add(1, Ordering::SeqCst);
            Ok((format!("token-{n}"), Duration::from_secs(300)))
        };

        assert_eq!(cache.get_or_refresh(refresh).await.unwrap(), "token-0");
        assert_eq!(cache.get_or_refresh(refresh).await.unwrap(), "token-0");

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.get_or_refresh(refresh).await.unwrap(), "token-1");
        assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn metadata_provider_reads_token_and_sends_flavor_header() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buffer = [0u8; 4096];
            let read = stream.read(&mut buffer).unwrap();
            let request = String::from_utf8_lossy(&buffer[..read]).to_ascii_lowercase();
            let body = r#"{"access_token":"ya29.meta","expires_in":3599,"token_type":"Bearer"}"#;
            let status = if request.contains("metadata-flavor: google") {
                "200 OK"
            } else {
                "403 Forbidden"
            };
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        });

        let provider =
            MetadataTokenProvider::with_url(reqwest::Client::new(), format!("http://{addr}/token"));
        assert_eq!(provider.access_token().await.unwrap(), "ya29.meta");
        server.join().unwrap();
    }
}

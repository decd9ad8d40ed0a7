use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::{SigningError, UpstreamError};
use crate::storage::{parse_storage_reference, StorageSigner, DEFAULT_SIGNED_URL_TTL};
use crate::upstream::{GenerationApi, OperationHandle};

pub const NO_RESULT_MESSAGE: &str = "no result";

/// Client-facing state of one operation, computed fresh on every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    Processing,
    Complete {
        result_url: String,
        result_urls: Vec<String>,
    },
    CompleteEmpty {
        reason: Option<String>,
    },
    Error(PollError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    Upstream(UpstreamError),
    Signing(SigningError),
}

impl PollError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upstream(_) => "upstream",
            Self::Signing(_) => "signing",
        }
    }
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream(err) => write!(f, "{err}"),
            Self::Signing(err) => write!(f, "{err}"),
        }
    }
}

impl PollResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

impl Serialize for PollResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Self::Processing => {
                map.serialize_entry("status", "processing")?;
            }
            Self::Complete {
                result_url,
                result_urls,
            } => {
                map.serialize_entry("status", "complete")?;
                map.serialize_entry("resultUrl", result_url)?;
                map.serialize_entry("resultUrls", result_urls)?;
            }
            Self::CompleteEmpty { reason } => {
                map.serialize_entry("status", "complete")?;
                map.serialize_entry("error", NO_RESULT_MESSAGE)?;
                if let Some(reason) = reason {
                    map.serialize_entry("reason", reason)?;
                }
            }
            Self::Error(err) => {
                map.serialize_entry("status", "error")?;
                map.serialize_entry("error", &err.to_string())?;
                map.serialize_entry("kind", err.kind())?;
            }
        }
        map.end()
    }
}

pub struct CompletionResolver {
    api: Arc<dyn GenerationApi>,
    signer: Arc<dyn StorageSigner>,
    url_ttl: Duration,
}

impl CompletionResolver {
    pub fn new(api: Arc<dyn GenerationApi>, signer: Arc<dyn StorageSigner>) -> Self {
        Self::with_url_ttl(api, signer, DEFAULT_SIGNED_URL_TTL)
    }

    pub fn with_url_ttl(
        api: Arc<dyn GenerationApi>,
        signer: Arc<dyn StorageSigner>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            api,
            signer,
            url_ttl,
        }
    }

    /// One upstream fetch per call; the caller decides when to poll again.
    pub async fn poll(&self, operation: &OperationHandle) -> PollResult {
        let snapshot = match self.api.fetch_operation(operation).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(operation = %operation, error = %err, "Operation fetch failed");
                return PollResult::Error(PollError::Upstream(err));
            }
        };

        if !snapshot.done {
            debug!(operation = %operation, "Operation still processing");
            return PollResult::Processing;
        }

        let references = snapshot.storage_references();
        if references.is_empty() {
            let reason = snapshot.empty_reason();
            warn!(
                operation = %operation,
                reason = reason.as_deref().unwrap_or("none given"),
                "Operation finished without a result"
            );
            return PollResult::CompleteEmpty { reason };
        }

        let mut result_urls = Vec::with_capacity(references.len());
        for reference in references {
            match self.resolve_reference(reference).await {
                Ok(url) => result_urls.push(url),
                Err(err) => {
                    warn!(operation = %operation, error = %err, "Result URL signing failed");
                    return PollResult::Error(PollError::Signing(err));
                }
            }
        }

        debug!(operation = %operation, outputs = result_urls.len(), "Operation complete");
        PollResult::Complete {
            result_url: result_urls[0].clone(),
            result_urls,
        }
    }

    async fn resolve_reference(&self, reference: &str) -> Result<String, SigningError> {
        match parse_storage_reference(reference)? {
            Some(object) => self.signer.signed_url(&object, self.url_ttl).await,
            None => Ok(reference.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    use crate::storage::{StorageObject, UnavailableSigner};
    use crate::upstream::{GenerationRequest, OperationSnapshot};

    struct CannedApi {
        response: Result<&'static str, UpstreamError>,
    }

    #[async_trait]
    impl GenerationApi for CannedApi {
        async fn submit(&self, _request: &GenerationRequest) -> Result<OperationHandle, UpstreamError> {
            unreachable!("the resolver never submits")
        }

        async fn fetch_operation(
            &self,
            _operation: &OperationHandle,
        ) -> Result<OperationSnapshot, UpstreamError> {
            let raw = self.response.clone()?;
            Ok(serde_json::from_str(raw).expect("canned snapshot is valid"))
        }
    }

    #[derive(Default)]
    struct RecordingSigner {
        requests: Mutex<Vec<(StorageObject, Duration)>>,
    }

    #[async_trait]
    impl StorageSigner for RecordingSigner {
        async fn signed_url(&self, object: &StorageObject, ttl: Duration) -> Result<String, SigningError> {
            self.requests.lock().unwrap().push((object.clone(), ttl));
            Ok(format!(
                "https://signed.example/{}/{}?ttl={}",
                object.bucket,
                object.path,
                ttl.as_secs()
            ))
        }
    }

    fn resolver(response: Result<&'static str, UpstreamError>) -> (CompletionResolver, Arc<RecordingSigner>) {
        let signer = Arc::new(RecordingSigner::default());
        let resolver = CompletionResolver::new(Arc::new(CannedApi { response }), signer.clone());
        (resolver, signer)
    }

    async fn poll(resolver: &CompletionResolver) -> PollResult {
        resolver.poll(&OperationHandle::new("operations/op1")).await
    }

    #[tokio::test]
    async fn not_done_is_processing() {
        let (resolver, signer) = resolver(Ok(r#"{"done":false}"#));
        assert_eq!(poll(&resolver).await, PollResult::Processing);
        assert!(signer.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn done_with_reference_is_complete_with_one_hour_url() {
        let (resolver, signer) = resolver(Ok(
            r#"{"done":true,"response":{"outputs":[{"storageReference":"gs://b/p.mp4"}]}}"#,
        ));
        let result = poll(&resolver).await;
        let PollResult::Complete { result_url, .. } = &result else {
            panic!("expected complete, got {result:?}");
        };
        assert!(result_url.contains("/b/p.mp4"));

        let requests = signer.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.bucket, "b");
        assert_eq!(requests[0].0.path, "p.mp4");
        assert_eq!(requests[0].1, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn every_output_is_signed() {
        let (resolver, _) = resolver(Ok(
            r#"{"done":true,"response":{"videos":[{"gcsUri":"gs://b/0.mp4"},{"gcsUri":"gs://b/1.mp4"}]}}"#,
        ));
        let PollResult::Complete {
            result_url,
            result_urls,
        } = poll(&resolver).await
        else {
            panic!("expected complete");
        };
        assert_eq!(result_urls.len(), 2);
        assert_eq!(result_url, result_urls[0]);
        assert!(result_urls[1].contains("/b/1.mp4"));
    }

    #[tokio::test]
    async fn done_without_reference_is_complete_empty() {
        let (resolver, _) = resolver(Ok(r#"{"done":true,"response":{}}"#));
        assert_eq!(
            poll(&resolver).await,
            PollResult::CompleteEmpty { reason: None }
        );
    }

    #[tokio::test]
    async fn operation_error_is_complete_empty_with_reason() {
        let (resolver, _) = resolver(Ok(
            r#"{"done":true,"error":{"code":3,"message":"unsafe prompt"}}"#,
        ));
        let PollResult::CompleteEmpty { reason } = poll(&resolver).await else {
            panic!("expected complete-empty");
        };
        assert_eq!(reason.as_deref(), Some("unsafe prompt (code 3)"));
    }

    #[tokio::test]
    async fn fetch_failure_is_upstream_error() {
        let (resolver, _) = resolver(Err(UpstreamError::Transport("connection reset".into())));
        let result = poll(&resolver).await;
        assert!(matches!(result, PollResult::Error(PollError::Upstream(_))));
        assert!(result.is_terminal());
    }

    #[tokio::test]
    async fn signing_failure_is_distinct_error() {
        let api = Arc::new(CannedApi {
            response: Ok(r#"{"done":true,"response":{"outputs":[{"storageReference":"gs://b/p.mp4"}]}}"#),
        });
        let resolver = CompletionResolver::new(api, Arc::new(UnavailableSigner::new("no key")));
        let result = poll(&resolver).await;
        let PollResult::Error(err) = &result else {
            panic!("expected error, got {result:?}");
        };
        assert_eq!(err.kind(), "signing");
    }

    #[tokio::test]
    async fn non_storage_reference_passes_through_unsigned() {
        let (resolver, signer) = resolver(Ok(
            r#"{"done":true,"response":{"outputs":[{"storageReference":"https://cdn.example/v.mp4"}]}}"#,
        ));
        let PollResult::Complete { result_url, .. } = poll(&resolver).await else {
            panic!("expected complete");
        };
        assert_eq!(result_url, "https://cdn.example/v.mp4");
        assert!(signer.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn poll_results_serialize_to_client_shapes() {
        assert_eq!(
            serde_json::to_value(PollResult::Processing).unwrap(),
            json!({"status": "processing"})
        );
        assert_eq!(
            serde_json::to_value(PollResult::Complete {
                result_url: "https://u/0".into(),
                result_urls: vec!["https://u/0".into()],
            })
            .unwrap(),
            json!({"status": "complete", "resultUrl": "https://u/0", "resultUrls": ["https://u/0"]})
        );
        assert_eq!(
            serde_json::to_value(PollResult::CompleteEmpty { reason: None }).unwrap(),
            json!({"status": "complete", "error": "no result"})
        );
        let error = serde_json::to_value(PollResult::Error(PollError::Upstream(
            UpstreamError::Transport("timed out".into()),
        )))
        .unwrap();
        assert_eq!(error["status"], "error");
        assert_eq!(error["kind"], "upstream");
        assert!(error["error"].as_str().unwrap().contains("timed out"));
    }
}

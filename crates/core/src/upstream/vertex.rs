use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use url::Url;

use super::auth::TokenProvider;
use super::{GenerationApi, GenerationRequest, OperationHandle, OperationSnapshot};
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;

const DEFAULT_ASPECT_RATIO: &str = "16:9";
const DEFAULT_SAMPLE_COUNT: u32 = 1;

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    name: Option<String>,
}

/// Client for the Vertex AI long-running predict endpoints of one model.
pub struct VertexClient {
    predict_url: Url,
    fetch_url: Url,
    project_id: String,
    default_parameters: Map<String, Value>,
    tokens: Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

impl std::fmt::Debug for VertexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexClient")
            .field("predict_url", &self.predict_url.as_str())
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl VertexClient {
    pub fn new(config: &UpstreamConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("failed to build HTTP client")?;
        Self::with_client(config, tokens, client)
    }

    pub fn with_client(
        config: &UpstreamConfig,
        tokens: Arc<dyn TokenProvider>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let project_id = config.project_id.trim();
        if project_id.is_empty() {
            bail!("upstream.project_id is not configured (set GOOGLE_PROJECT_ID)");
        }

        let base = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com", config.location));
        let model_path = format!(
            "{}/v1/projects/{project_id}/locations/{}/publishers/google/models/{}",
            base.trim_end_matches('/'),
            config.location,
            config.model
        );
        let predict_url = Url::parse(&format!("{model_path}:predictLongRunning"))
            .with_context(|| format!("invalid upstream endpoint: {base}"))?;
        let fetch_url = Url::parse(&format!("{model_path}:fetchPredictOperation"))
            .with_context(|| format!("invalid upstream endpoint: {base}"))?;

        let mut default_parameters = Map::new();
        default_parameters.insert("aspectRatio".into(), json!(DEFAULT_ASPECT_RATIO));
        default_parameters.insert("sampleCount".into(), json!(DEFAULT_SAMPLE_COUNT));
        default_parameters.insert("durationSeconds".into(), json!(config.duration_seconds));
        if let Some(storage_uri) = config.storage_uri.as_deref().filter(|s| !s.is_empty()) {
            default_parameters.insert("storageUri".into(), json!(storage_uri));
        }

        info!(
            predict_url = %predict_url,
            model = %config.model,
            "Upstream generation client configured"
        );

        Ok(Self {
            predict_url,
            fetch_url,
            project_id: project_id.to_string(),
            default_parameters,
            tokens,
            client,
        })
    }

    pub fn predict_url(&self) -> &Url {
        &self.predict_url
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut parameters = self.default_parameters.clone();
        for (key, value) in &request.parameters {
            parameters.insert(key.clone(), value.clone());
        }
        json!({
            "instances": [{ "prompt": request.prompt }],
            "parameters": parameters,
        })
    }

    async fn post_json(&self, url: &Url, body: &Value) -> Result<String, UpstreamError> {
        let token = self.tokens.access_token().await?;
        let resp = self
            .client
            .post(url.clone())
            .bearer_auth(token)
            .header("X-Goog-User-Project", &self.project_id)
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| UpstreamError::Transport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(UpstreamError::from_http_failure(status.as_u16(), &text));
        }
        Ok(text)
    }
}

#[async_trait]
impl GenerationApi for VertexClient {
    async fn submit(&self, request: &GenerationRequest) -> Result<OperationHandle, UpstreamError> {
        let body = self.request_body(request);
        let text = self.post_json(&self.predict_url, &body).await?;

        let parsed: SubmitResponse = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::Malformed(format!("invalid submit response: {e}")))?;
        let name = parsed
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| UpstreamError::Malformed("submit response has no operation name".into()))?;

        debug!(operation = %name, "Upstream accepted generation request");
        Ok(OperationHandle::new(name))
    }

    async fn fetch_operation(
        &self,
        operation: &OperationHandle,
    ) -> Result<OperationSnapshot, UpstreamError> {
        let body = json!({ "operationName": operation.as_str() });
        let text = self.post_json(&self.fetch_url, &body).await?;
        serde_json::from_str(&text)
            .map_err(|e| UpstreamError::Malformed(format!("invalid operation response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::auth::StaticTokenProvider;

    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn spawn_single_response_server(raw_response: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept test client");
            let request = read_request(&mut stream);
            stream
                .write_all(raw_response.as_bytes())
                .expect("write response");
            let _ = stream.flush();
            request
        });

        (format!("http://{addr}"), handle)
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut raw = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            let read = match stream.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            raw.extend_from_slice(&buffer[..read]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    fn json_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn client_for(base: &str) -> VertexClient {
        let config = UpstreamConfig {
            endpoint: Some(base.to_string()),
            project_id: "demo-project".to_string(),
            storage_uri: Some("gs://bucket/veo2-videos/".to_string()),
            ..UpstreamConfig::default()
        };
        VertexClient::new(&config, Arc::new(StaticTokenProvider::new("ya29.test"))).unwrap()
    }

    fn request_body(raw: &str) -> Value {
        let (_, body) = raw.split_once("\r\n\r\n").expect("request has a body");
        serde_json::from_str(body).expect("request body is json")
    }

    #[test]
    fn missing_project_id_is_rejected() {
        let err = VertexClient::new(
            &UpstreamConfig::default(),
            Arc::new(StaticTokenProvider::new("t")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("project_id"));
    }

    #[test]
    fn default_endpoint_uses_regional_host() {
        let config = UpstreamConfig {
            project_id: "p".to_string(),
            ..UpstreamConfig::default()
        };
        let client = VertexClient::new(&config, Arc::new(StaticTokenProvider::new("t"))).unwrap();
        assert_eq!(
            client.predict_url().as_str(),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/p/locations/us-central1/publishers/google/models/veo-2.0-generate-001:predictLongRunning"
        );
    }

    #[tokio::test]
    async fn submit_posts_prompt_with_merged_parameters() {
        let (base, server) = spawn_single_response_server(json_response(
            "200 OK",
            r#"{"name":"projects/demo-project/locations/us-central1/publishers/google/models/veo-2.0-generate-001/operations/op-1"}"#,
        ));
        let client = client_for(&base);

        let mut parameters = Map::new();
        parameters.insert("aspectRatio".into(), json!("9:16"));
        parameters.insert("sampleCount".into(), json!(2));
        let handle = client
            .submit(&GenerationRequest {
                prompt: "a cat surfing".to_string(),
                parameters,
            })
            .await
            .unwrap();
        assert!(handle.as_str().ends_with("/operations/op-1"));

        let raw = server.join().unwrap();
        let first_line = raw.lines().next().unwrap();
        assert!(first_line.starts_with("POST /v1/projects/demo-project/locations/us-central1/publishers/google/models/veo-2.0-generate-001:predictLongRunning"));
        let lower = raw.to_ascii_lowercase();
        assert!(lower.contains("authorization: bearer ya29.test"));
        assert!(lower.contains("x-goog-user-project: demo-project"));

        let body = request_body(&raw);
        assert_eq!(body["instances"][0]["prompt"], "a cat surfing");
        assert_eq!(body["parameters"]["aspectRatio"], "9:16");
        assert_eq!(body["parameters"]["sampleCount"], 2);
        assert_eq!(body["parameters"]["durationSeconds"], 6);
        assert_eq!(body["parameters"]["storageUri"], "gs://bucket/veo2-videos/");
    }

    #[tokio::test]
    async fn quota_rejection_is_classified() {
        let (base, server) = spawn_single_response_server(json_response(
            "429 Too Many Requests",
            r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#,
        ));
        let err = client_for(&base)
            .submit(&GenerationRequest {
                prompt: "a cat".to_string(),
                parameters: Map::new(),
            })
            .await
            .unwrap_err();
        server.join().unwrap();
        assert!(err.is_quota_exhausted());
        assert_eq!(err.message(), "Quota exceeded");
    }

    #[tokio::test]
    async fn submit_without_operation_name_is_malformed() {
        let (base, server) = spawn_single_response_server(json_response("200 OK", "{}"));
        let err = client_for(&base)
            .submit(&GenerationRequest {
                prompt: "a cat".to_string(),
                parameters: Map::new(),
            })
            .await
            .unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, UpstreamError::Malformed(_)));
    }

    #[tokio::test]
    async fn fetch_operation_sends_operation_name_and_parses_snapshot() {
        let (base, server) = spawn_single_response_server(json_response(
            "200 OK",
            r#"{"name":"operations/op-1","done":true,"response":{"videos":[{"gcsUri":"gs://bucket/veo2-videos/op-1/sample_0.mp4"}]}}"#,
        ));
        let snapshot = client_for(&base)
            .fetch_operation(&OperationHandle::new("operations/op-1"))
            .await
            .unwrap();
        assert!(snapshot.done);
        assert_eq!(
            snapshot.storage_references(),
            vec!["gs://bucket/veo2-videos/op-1/sample_0.mp4"]
        );

        let raw = server.join().unwrap();
        assert!(raw.lines().next().unwrap().contains(":fetchPredictOperation"));
        assert_eq!(request_body(&raw)["operationName"], "operations/op-1");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = client_for(&base)
            .fetch_operation(&OperationHandle::new("operations/op-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)));
    }
}

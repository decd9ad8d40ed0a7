use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::completion::{CompletionResolver, PollResult};
use crate::config::AppConfig;
use crate::error::SubmitError;
use crate::queue::DispatchState;
use crate::storage::signer_from_config;
use crate::submission::{SubmissionOrchestrator, SubmissionSettings, SubmitReceipt, SubmitRequest};
use crate::upstream::auth::token_provider_from_config;
use crate::upstream::vertex::VertexClient;
use crate::upstream::{GenerationApi, OperationHandle};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orchestrator: SubmissionOrchestrator,
    resolver: CompletionResolver,
    config: AppConfig,
}

impl AppState {
    pub fn new(
        orchestrator: SubmissionOrchestrator,
        resolver: CompletionResolver,
        config: AppConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orchestrator,
                resolver,
                config,
            }),
        }
    }

    /// Wire the Vertex client, token provider and storage signer described by
    /// `config`. Must be called inside a tokio runtime.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let http = reqwest::Client::new();
        let tokens = token_provider_from_config(&config.auth, http)
            .context("failed to initialize upstream credentials")?;
        let api: Arc<dyn GenerationApi> = Arc::new(
            VertexClient::new(&config.upstream, tokens)
                .context("failed to initialize upstream client")?,
        );
        let signer = signer_from_config(&config.signer);

        let orchestrator = SubmissionOrchestrator::new(
            Arc::clone(&api),
            SubmissionSettings::from_config(&config),
        );
        let resolver = CompletionResolver::with_url_ttl(api, signer, config.signer.url_ttl());
        Ok(Self::new(orchestrator, resolver, config))
    }

    pub fn orchestrator(&self) -> &SubmissionOrchestrator {
        &self.inner.orchestrator
    }

    pub fn resolver(&self) -> &CompletionResolver {
        &self.inner.resolver
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, alias = "requestId")]
    pub dedup_key: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<Value>,
    #[serde(default)]
    pub duration_seconds: Option<Value>,
    #[serde(default)]
    pub number_of_videos: Option<Value>,
}

impl GenerateRequest {
    /// Top-level convenience fields win over the same keys in `parameters`.
    pub fn into_submit_request(self) -> SubmitRequest {
        let mut parameters = self.parameters;
        for (name, value) in [
            ("aspectRatio", self.aspect_ratio),
            ("durationSeconds", self.duration_seconds),
            ("sampleCount", self.number_of_videos),
        ] {
            if let Some(value) = value.filter(|value| !value.is_null()) {
                parameters.insert(name.to_string(), value);
            }
        }
        SubmitRequest {
            prompt: self.prompt,
            parameters,
            dedup_key: self.dedup_key,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    #[serde(default, alias = "operationName", alias = "operation")]
    pub operation_id: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub queue_length: usize,
    pub requests_this_window: u32,
    pub max_per_minute: u32,
    pub dispatch_state: DispatchState,
    pub ledger_entries: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<usize>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/queue", get(queue_status))
        .route("/api/generate", post(generate))
        .route("/api/poll", post(poll))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.config().clone())
}

async fn queue_status(State(state): State<AppState>) -> Json<QueueStatusResponse> {
    let orchestrator = state.orchestrator();
    Json(QueueStatusResponse {
        queue_length: orchestrator.queue_length(),
        requests_this_window: orchestrator.requests_this_window(),
        max_per_minute: state.config().queue.max_per_minute,
        dispatch_state: orchestrator.dispatch_state(),
        ledger_entries: orchestrator.ledger_entries(),
    })
}

async fn generate(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<SubmitReceipt>, AppError> {
    let span = info_span!("generate", request_id = %Uuid::new_v4());
    let receipt = state
        .orchestrator()
        .submit(payload.into_submit_request())
        .instrument(span.clone())
        .await?;
    span.in_scope(|| {
        info!(
            operation = %receipt.operation_id,
            is_existing = receipt.is_existing,
            queue_length = receipt.queue_length,
            "Generate request answered"
        )
    });
    Ok(Json(receipt))
}

async fn poll(
    State(state): State<AppState>,
    Json(payload): Json<PollRequest>,
) -> Result<Json<PollResult>, AppError> {
    let operation_id = payload
        .operation_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("operationId is required".to_string()))?;

    let operation = OperationHandle::new(operation_id);
    let result = state
        .resolver()
        .poll(&operation)
        .instrument(info_span!("poll", operation = %operation))
        .await;
    Ok(Json(result))
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    TooManyRequests {
        message: String,
        retry_after_secs: u64,
    },
    Unavailable {
        message: String,
        queue_length: usize,
    },
    Internal {
        message: String,
        upstream_status: Option<u16>,
    },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = ErrorResponse {
            error: String::new(),
            retry_after: None,
            upstream_status: None,
            queue_length: None,
        };
        let status = match self {
            AppError::BadRequest(msg) => {
                body.error = msg;
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(msg) => {
                body.error = msg;
                StatusCode::NOT_FOUND
            }
            AppError::TooManyRequests {
                message,
                retry_after_secs,
            } => {
                body.error = message;
                body.retry_after = Some(retry_after_secs);
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::Unavailable {
                message,
                queue_length,
            } => {
                body.error = message;
                body.queue_length = Some(queue_length);
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Internal {
                message,
                upstream_status,
            } => {
                body.error = message;
                body.upstream_status = upstream_status;
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let retry_after = body.retry_after;
        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        let message = err.to_string();
        match err {
            SubmitError::InvalidInput(msg) => AppError::BadRequest(msg),
            SubmitError::Overloaded { queue_length } => AppError::Unavailable {
                message,
                queue_length,
            },
            SubmitError::QuotaExceeded {
                retry_after_secs, ..
            } => AppError::TooManyRequests {
                message,
                retry_after_secs,
            },
            SubmitError::UpstreamFailure { status, .. } => AppError::Internal {
                message,
                upstream_status: status,
            },
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal {
            message: format!("{:#}", err),
            upstream_status: None,
        }
    }
}

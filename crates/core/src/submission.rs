//! Deduplicated, rate-limited submission of generation requests.
//!
//! Per dedup key the orchestrator holds a [`KeyGuard`] from the ledger lookup
//! until the resulting operation is recorded. The guard is moved into the
//! queued job, so the ledger write happens even if the caller stops waiting,
//! and a concurrent duplicate only proceeds once the first one has either
//! recorded its operation or failed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::dedup::{effective_dedup_key, DEFAULT_FINGERPRINT_BUCKET};
use crate::error::{SubmitError, UpstreamError};
use crate::key_lock::{KeyGuard, KeyLocks};
use crate::ledger::{LedgerEntry, OperationLedger, RecordOutcome, DEFAULT_LEDGER_TTL};
use crate::queue::{DispatchState, QueueLimits, RateLimitedQueue};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::upstream::{GenerationApi, GenerationRequest, OperationHandle};

pub const DEFAULT_BUSY_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitRequest {
    pub prompt: String,
    pub parameters: Map<String, Value>,
    pub dedup_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub operation_id: OperationHandle,
    pub dedup_key: String,
    pub is_existing: bool,
    pub queue_length: usize,
    pub requests_this_window: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionSettings {
    pub queue: QueueLimits,
    pub retry: RetryPolicy,
    pub ledger_ttl: Duration,
    pub busy_threshold: usize,
    pub fingerprint_bucket: Duration,
}

impl Default for SubmissionSettings {
    fn default() -> Self {
        Self {
            queue: QueueLimits::default(),
            retry: RetryPolicy::default(),
            ledger_ttl: DEFAULT_LEDGER_TTL,
            busy_threshold: DEFAULT_BUSY_THRESHOLD,
            fingerprint_bucket: DEFAULT_FINGERPRINT_BUCKET,
        }
    }
}

impl SubmissionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            queue: config.queue.limits(),
            retry: config.retry.policy(),
            ledger_ttl: config.ledger.ttl(),
            busy_threshold: config.queue.busy_threshold,
            fingerprint_bucket: config.ledger.fingerprint_bucket(),
        }
    }
}

pub struct SubmissionOrchestrator {
    api: Arc<dyn GenerationApi>,
    queue: RateLimitedQueue,
    ledger: Arc<OperationLedger>,
    locks: KeyLocks,
    retry: RetryPolicy,
    busy_threshold: usize,
    fingerprint_bucket: Duration,
}

impl SubmissionOrchestrator {
    /// Starts the queue's dispatch worker; must be called inside a tokio runtime.
    pub fn new(api: Arc<dyn GenerationApi>, settings: SubmissionSettings) -> Self {
        Self {
            api,
            queue: RateLimitedQueue::new(settings.queue),
            ledger: Arc::new(OperationLedger::new(settings.ledger_ttl)),
            locks: KeyLocks::new(),
            retry: settings.retry,
            busy_threshold: settings.busy_threshold,
            fingerprint_bucket: settings.fingerprint_bucket,
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(SubmitError::InvalidInput("prompt is required".to_string()));
        }

        let key = effective_dedup_key(
            request.dedup_key.as_deref(),
            prompt,
            &request.parameters,
            Utc::now(),
            self.fingerprint_bucket,
        );
        let guard = self.locks.acquire(key.as_str()).await;

        if let Some(entry) = self.ledger.lookup(key.as_str()) {
            info!(
                dedup = %entry.dedup_key,
                operation = %entry.operation_id,
                "Duplicate submission answered from ledger"
            );
            return Ok(self.receipt(entry, true));
        }

        let queue_length = self.queue.queue_length();
        if queue_length > self.busy_threshold {
            warn!(
                queue_length,
                busy_threshold = self.busy_threshold,
                "Rejecting submission; queue is over the busy threshold"
            );
            return Err(SubmitError::Overloaded { queue_length });
        }

        debug!(
            dedup = %key.as_str(),
            caller_supplied = key.is_explicit(),
            queue_length,
            "Queueing upstream submission"
        );
        let generation = GenerationRequest {
            prompt: prompt.to_string(),
            parameters: request.parameters,
        };
        let api = Arc::clone(&self.api);
        let ledger = Arc::clone(&self.ledger);
        let policy = self.retry;
        let queued = self
            .queue
            .enqueue(move || run_submission(api, ledger, policy, generation, guard))
            .await;

        match queued {
            Ok(Ok((entry, is_existing))) => {
                info!(
                    dedup = %entry.dedup_key,
                    operation = %entry.operation_id,
                    retry_count = entry.retry_count,
                    "Generation submitted"
                );
                Ok(self.receipt(entry, is_existing))
            }
            Ok(Err(err)) => {
                warn!(dedup = %key.as_str(), error = %err, "Upstream submission failed");
                Err(SubmitError::from(err))
            }
            Err(err) => Err(SubmitError::UpstreamFailure {
                status: None,
                message: err.to_string(),
            }),
        }
    }

    fn receipt(&self, entry: LedgerEntry, is_existing: bool) -> SubmitReceipt {
        SubmitReceipt {
            operation_id: entry.operation_id,
            dedup_key: entry.dedup_key,
            is_existing,
            queue_length: self.queue.queue_length(),
            requests_this_window: self.queue.requests_this_window(),
        }
    }

    pub fn queue_length(&self) -> usize {
        self.queue.queue_length()
    }

    pub fn requests_this_window(&self) -> u32 {
        self.queue.requests_this_window()
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.queue.dispatch_state()
    }

    pub fn ledger_entries(&self) -> usize {
        self.ledger.len()
    }

    pub fn ledger(&self) -> &OperationLedger {
        &self.ledger
    }
}

/// The unit of work the queue runs: a retried upstream submit followed by the
/// ledger write, with the key guard released only when both are done.
async fn run_submission(
    api: Arc<dyn GenerationApi>,
    ledger: Arc<OperationLedger>,
    policy: RetryPolicy,
    generation: GenerationRequest,
    guard: KeyGuard,
) -> Result<(LedgerEntry, bool), UpstreamError> {
    let attempts = AtomicU32::new(0);
    let handle = {
        let api = &api;
        let generation = &generation;
        let attempts = &attempts;
        retry_with_backoff(&policy, move || {
            attempts.fetch_add(1, Ordering::SeqCst);
            api.submit(generation)
        })
        .await?
    };

    let retry_count = attempts.load(Ordering::SeqCst).saturating_sub(1);
    let recorded = match ledger.record(guard.key(), handle, retry_count) {
        RecordOutcome::Recorded(entry) => (entry, false),
        RecordOutcome::AlreadyLive(entry) => (entry, true),
    };
    drop(guard);
    Ok(recorded)
}

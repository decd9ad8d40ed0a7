//! Contract with the long-running generation provider.

pub mod auth;
pub mod vertex;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::UpstreamError;

/// Opaque provider identifier of one submitted generation job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(String);

impl OperationHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub parameters: Map<String, Value>,
}

/// Provider view of an operation, normalized across response shapes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OperationSnapshot {
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<OperationResponse>,
    #[serde(default)]
    pub error: Option<OperationFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    #[serde(default, alias = "videos", alias = "predictions")]
    pub outputs: Vec<OperationOutput>,
    #[serde(default)]
    pub rai_media_filtered_count: Option<u32>,
    #[serde(default)]
    pub rai_media_filtered_reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OperationOutput {
    #[serde(
        default,
        rename = "storageReference",
        alias = "gcsUri",
        alias = "videoUri"
    )]
    pub storage_reference: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OperationFailure {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl OperationSnapshot {
    pub fn storage_references(&self) -> Vec<&str> {
        self.response
            .iter()
            .flat_map(|response| response.outputs.iter())
            .filter_map(|output| output.storage_reference.as_deref())
            .map(str::trim)
            .filter(|reference| !reference.is_empty())
            .collect()
    }

    /// Why a finished operation has nothing to show, when the provider says.
    pub fn empty_reason(&self) -> Option<String> {
        if let Some(failure) = &self.error {
            let message = failure.message.as_deref().unwrap_or("operation failed");
            return Some(match failure.code {
                Some(code) => format!("{message} (code {code})"),
                None => message.to_string(),
            });
        }
        let response = self.response.as_ref()?;
        match response.rai_media_filtered_count {
            Some(count) if count > 0 => {
                let mut reason = format!("{count} output(s) removed by content filter");
                if !response.rai_media_filtered_reasons.is_empty() {
                    reason.push_str(": ");
                    reason.push_str(&response.rai_media_filtered_reasons.join("; "));
                }
                Some(reason)
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Start a generation job. This is the billable call.
    async fn submit(&self, request: &GenerationRequest) -> Result<OperationHandle, UpstreamError>;

    async fn fetch_operation(
        &self,
        operation: &OperationHandle,
    ) -> Result<OperationSnapshot, UpstreamError>;
}

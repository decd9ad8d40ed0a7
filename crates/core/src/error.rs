use std::fmt;

use serde::Deserialize;

/// Marker the provider embeds in quota rejections, in the error status or message.
pub const QUOTA_EXHAUSTED_MARKER: &str = "RESOURCE_EXHAUSTED";
pub const QUOTA_EXHAUSTED_STATUS: u16 = 429;

/// Seconds a caller is told to wait after the retrier gives up on quota errors.
pub const QUOTA_RETRY_AFTER_SECS: u64 = 60;

const ERROR_BODY_PREVIEW_CHARS: usize = 300;

/// Failure of a single call to the upstream generation API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Provider rejected the call because the caller exceeded its quota.
    QuotaExhausted { status: Option<u16>, message: String },
    /// Any other non-2xx answer.
    Http { status: u16, message: String },
    /// Request never produced an HTTP answer.
    Transport(String),
    /// No bearer token could be obtained.
    Auth(String),
    /// 2xx answer whose body could not be understood.
    Malformed(String),
}

impl UpstreamError {
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, Self::QuotaExhausted { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::QuotaExhausted { status, .. } => *status,
            Self::Http { status, .. } => Some(*status),
            Self::Transport(_) | Self::Auth(_) | Self::Malformed(_) => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::QuotaExhausted { message, .. } | Self::Http { message, .. } => message,
            Self::Transport(message) | Self::Auth(message) | Self::Malformed(message) => message,
        }
    }

    /// Classify a non-2xx provider answer from its status and raw body.
    pub fn from_http_failure(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<ProviderErrorBody>(body).ok();
        let provider_status = parsed
            .as_ref()
            .and_then(|b| b.error.as_ref())
            .and_then(|e| e.status.clone())
            .unwrap_or_default();
        let message = parsed
            .as_ref()
            .and_then(|b| {
                b.error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .or_else(|| b.message.clone())
            })
            .unwrap_or_else(|| preview(body));

        if status == QUOTA_EXHAUSTED_STATUS
            || provider_status.contains(QUOTA_EXHAUSTED_MARKER)
            || message.contains(QUOTA_EXHAUSTED_MARKER)
            || body.contains(QUOTA_EXHAUSTED_MARKER)
        {
            return Self::QuotaExhausted {
                status: Some(status),
                message,
            };
        }

        Self::Http { status, message }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExhausted {
                status: Some(status),
                message,
            } => write!(f, "{QUOTA_EXHAUSTED_MARKER} ({status}): {message}"),
            Self::QuotaExhausted {
                status: None,
                message,
            } => write!(f, "{QUOTA_EXHAUSTED_MARKER}: {message}"),
            Self::Http { status, message } => write!(f, "upstream API error ({status}): {message}"),
            Self::Transport(message) => write!(f, "upstream request failed: {message}"),
            Self::Auth(message) => write!(f, "failed to obtain upstream access token: {message}"),
            Self::Malformed(message) => write!(f, "malformed upstream response: {message}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: Option<ProviderErrorDetail>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

fn preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_BODY_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Failure returned to a `submit` caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    InvalidInput(String),
    Overloaded {
        queue_length: usize,
    },
    QuotaExceeded {
        status: Option<u16>,
        message: String,
        retry_after_secs: u64,
    },
    UpstreamFailure {
        status: Option<u16>,
        message: String,
    },
}

impl From<UpstreamError> for SubmitError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::QuotaExhausted { status, message } => Self::QuotaExceeded {
                status,
                message,
                retry_after_secs: QUOTA_RETRY_AFTER_SECS,
            },
            other => Self::UpstreamFailure {
                status: other.status(),
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::Overloaded { queue_length } => write!(
                f,
                "server is currently busy ({queue_length} requests queued); try again in a few minutes"
            ),
            Self::QuotaExceeded { message, .. } => {
                write!(f, "upstream rate limit exceeded: {message}")
            }
            Self::UpstreamFailure { message, .. } => f.write_str(message),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Failure while minting a download URL for a finished result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    MissingCredentials(String),
    InvalidRequest(String),
    Backend(String),
}

impl fmt::Display for SigningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCredentials(message) => {
                write!(f, "storage signing credentials unavailable: {message}")
            }
            Self::InvalidRequest(message) => write!(f, "invalid signing request: {message}"),
            Self::Backend(message) => write!(f, "storage signer failed: {message}"),
        }
    }
}

impl std::error::Error for SigningError {}

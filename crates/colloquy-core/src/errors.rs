use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Failures raised by a model backend while opening or reading a stream.
/// Transport failures are retried by the processor; the rest end the step.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("context window exceeded: {actual} > {limit}")]
    ContextOverflow { limit: u64, actual: u64 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("backend overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("cancelled")]
    Cancelled,
}

impl BackendError {
    /// Transport-level failures that are worth repeating with identical parameters.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Server { .. }
                | Self::Overloaded
                | Self::Network(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ContextOverflow { .. } => "context_overflow",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code from a remote backend.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            500..=599 => Self::Server { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Error recorded on an assistant message that did not finish normally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageError {
    Aborted,
    Rejected { reason: String },
    Backend { code: String, message: String },
    Internal { message: String },
}

impl From<&BackendError> for MessageError {
    fn from(e: &BackendError) -> Self {
        match e {
            BackendError::Cancelled => MessageError::Aborted,
            other => MessageError::Backend {
                code: other.kind().to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted => f.write_str("aborted"),
            Self::Rejected { reason } => write!(f, "rejected: {reason}"),
            Self::Backend { code, message } => write!(f, "{code}: {message}"),
            Self::Internal { message } => f.write_str(message),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("aborted")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot command failed: {0}")]
    Command(String),
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown snapshot: {0}")]
    Unknown(String),
}

use colloquy_core::errors::{BackendError, SnapshotError};
use colloquy_core::ids::{MessageId, SessionId};
use colloquy_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("session busy: {0}")]
    Busy(SessionId),

    #[error("generation aborted")]
    Aborted,

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Map a store miss on a session key to `SessionNotFound`.
    pub(crate) fn session_lookup(id: &SessionId, e: StoreError) -> Self {
        if e.is_not_found() {
            Self::SessionNotFound(id.clone())
        } else {
            Self::Store(e)
        }
    }
}

/// Outcome delivered to every caller merged into a generation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("generation aborted")]
    Aborted,
    #[error("rejected: {0}")]
    Rejected(String),
    /// The backend failed after retries were exhausted, or with a fatal error.
    #[error("backend error: {0}")]
    Backend(BackendError),
    #[error("generation failed: {0}")]
    Failed(String),
}

impl From<&EngineError> for ChatError {
    fn from(e: &EngineError) -> Self {
        match e {
            EngineError::Aborted => Self::Aborted,
            EngineError::Rejected(reason) => Self::Rejected(reason.clone()),
            EngineError::Backend(e) => Self::Backend(e.clone()),
            other => Self::Failed(other.to_string()),
        }
    }
}

impl From<ChatError> for EngineError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Aborted => Self::Aborted,
            ChatError::Rejected(reason) => Self::Rejected(reason),
            ChatError::Backend(e) => Self::Backend(e),
            ChatError::Failed(message) => Self::Internal(message),
        }
    }
}

pub type ChatResult = Result<colloquy_core::message::MessageWithParts, ChatError>;

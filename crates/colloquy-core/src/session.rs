use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId};
use crate::snapshot::SnapshotRef;

const DEFAULT_TITLE_PREFIX: &str = "New session - ";

/// Persisted session record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<RevertPointer>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(parent_id: Option<SessionId>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            parent_id,
            title: format!("{DEFAULT_TITLE_PREFIX}{}", now.to_rfc3339()),
            share: None,
            revert: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn has_default_title(&self) -> bool {
        self.title.starts_with(DEFAULT_TITLE_PREFIX)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Handle returned by the share service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRef {
    pub url: String,
}

/// Truncation boundary for undo. Everything after `message_id` is dropped
/// by the next generation; `part_index == 0` drops the message itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertPointer {
    pub message_id: MessageId,
    pub part_index: usize,
    /// Working-tree state captured just before the revert, restored by unrevert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

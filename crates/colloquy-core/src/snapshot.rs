use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SnapshotError;
use crate::ids::SessionId;

/// Opaque, restorable checkpoint of a working tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotRef(String);

impl SnapshotRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checkpoint/restore of the working tree a session operates on.
#[async_trait]
pub trait SnapshotCoordinator: Send + Sync {
    /// `Ok(None)` when the session has no working tree to capture.
    async fn create(&self, session_id: &SessionId) -> Result<Option<SnapshotRef>, SnapshotError>;

    async fn restore(&self, session_id: &SessionId, snapshot: &SnapshotRef) -> Result<(), SnapshotError>;

    /// Patch between `snapshot` and the current working tree.
    async fn diff(&self, session_id: &SessionId, snapshot: &SnapshotRef) -> Result<String, SnapshotError>;
}

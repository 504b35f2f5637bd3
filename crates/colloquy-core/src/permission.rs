use async_trait::async_trait;
use serde_json::Value;

use crate::ids::{MessageId, SessionId, ToolCallId};

/// A tool invocation awaiting a permission decision.
#[derive(Clone, Debug)]
pub struct PermissionRequest {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub call_id: ToolCallId,
    pub tool: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny { reason: String },
}

/// Gate consulted before every tool call.
#[async_trait]
pub trait PermissionPolicy: Send + Sync {
    async fn check(&self, request: &PermissionRequest) -> PermissionDecision;
}

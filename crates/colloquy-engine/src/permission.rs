use std::collections::HashSet;

use async_trait::async_trait;

use colloquy_core::permission::{PermissionDecision, PermissionPolicy, PermissionRequest};

/// Approves every call.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionPolicy for AllowAll {
    async fn check(&self, _request: &PermissionRequest) -> PermissionDecision {
        PermissionDecision::Allow
    }
}

/// Static deny list keyed by tool id.
#[derive(Clone, Debug, Default)]
pub struct ToolRules {
    deny: HashSet<String>,
}

impl ToolRules {
    pub fn deny<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            deny: tools.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PermissionPolicy for ToolRules {
    async fn check(&self, request: &PermissionRequest) -> PermissionDecision {
        if self.deny.contains(&request.tool) {
            PermissionDecision::Deny {
                reason: format!("tool '{}' is denied by configuration", request.tool),
            }
        } else {
            PermissionDecision::Allow
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::errors::BackendError;
use crate::ids::ToolCallId;
use crate::tokens::TokenUsage;

/// Why the backend ended a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model is done; the generation completes.
    Stop,
    /// The model requested tools; their results feed the next step.
    ToolCalls,
    /// Output cap reached.
    Length,
    ContentFilter,
}

impl FinishReason {
    /// A step that ends here is a step boundary rather than the end of the generation.
    pub fn continues(&self) -> bool {
        matches!(self, Self::ToolCalls)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: ToolCallId,
    pub tool: String,
    pub arguments: serde_json::Value,
}

/// Events yielded by one step of a backend stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    TextDelta { delta: String },
    File { mime: String, url: String },
    ToolCall { call: ToolCallRequest },
    Finish { usage: TokenUsage, reason: FinishReason },
    Error { error: BackendError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }
}

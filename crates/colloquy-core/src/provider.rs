use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::BackendError;
use crate::ids::ToolCallId;
use crate::stream::{StreamEvent, ToolCallRequest};
use crate::tools::ToolDefinition;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Context and output limits of a model, in tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub context: u64,
    pub output: u64,
}

/// Conversation history as the backend sees it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ModelMessage {
    User {
        content: Vec<UserContent>,
    },
    Assistant {
        content: Vec<AssistantContent>,
    },
    ToolResult {
        call_id: ToolCallId,
        tool: String,
        output: String,
        is_error: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    Text { text: String },
    File { mime: String, url: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantContent {
    Text { text: String },
    ToolCall(ToolCallRequest),
}

impl ModelMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![UserContent::Text { text: text.into() }],
        }
    }
}

/// Parameters of one backend step.
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub system: Vec<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_output_tokens: u64,
    pub temperature: Option<f64>,
    pub cancel: CancellationToken,
}

/// Streaming inference backend. Each `stream` call runs one model step;
/// the caller re-invokes it with the extended history after a step that
/// finished with tool calls.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Provider id used to look up capability quirks.
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
    fn limits(&self) -> ModelLimits;

    async fn stream(&self, request: &GenerateRequest) -> Result<EventStream, BackendError>;
}

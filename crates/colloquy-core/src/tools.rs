use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::ToolError;
use crate::ids::{MessageId, SessionId, ToolCallId};

/// Tools declare whether they can run in parallel with others in the same step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Concurrent,
    Sequential,
}

/// Partial update emitted while a tool is running.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolProgress {
    pub call_id: ToolCallId,
    pub title: Option<String>,
    pub metadata: Value,
}

/// `reportProgress` callback handed to a running tool.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    call_id: ToolCallId,
    tx: Option<mpsc::UnboundedSender<ToolProgress>>,
}

impl ProgressReporter {
    pub fn new(call_id: ToolCallId, tx: mpsc::UnboundedSender<ToolProgress>) -> Self {
        Self { call_id, tx: Some(tx) }
    }

    /// Reporter whose updates go nowhere.
    pub fn detached(call_id: ToolCallId) -> Self {
        Self { call_id, tx: None }
    }

    pub fn report(&self, title: Option<&str>, metadata: Value) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ToolProgress {
                call_id: self.call_id.clone(),
                title: title.map(str::to_string),
                metadata,
            });
        }
    }
}

/// Context available to tools during execution.
pub struct ToolContext {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub call_id: ToolCallId,
    pub abort_signal: CancellationToken,
    pub progress: ProgressReporter,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub title: String,
    #[serde(default)]
    pub metadata: Value,
    pub output: String,
}

impl ToolOutput {
    pub fn text(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            metadata: Value::Null,
            output: output.into(),
        }
    }
}

/// Descriptor sent to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.id().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

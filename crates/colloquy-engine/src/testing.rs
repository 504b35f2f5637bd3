//! Tool fixtures shared by the engine's unit tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use colloquy_core::errors::ToolError;
use colloquy_core::tools::{ExecutionMode, Tool, ToolContext, ToolOutput};

/// Returns its `text` argument.
pub struct EchoTool {
    name: String,
    mode: ExecutionMode,
}

impl EchoTool {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.into(),
            mode: ExecutionMode::Concurrent,
        }
    }

    pub fn sequential(name: &str) -> Self {
        Self {
            name: name.into(),
            mode: ExecutionMode::Sequential,
        }
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn id(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "echo the text argument"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "additionalProperties": false,
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        if let Some(ms) = args["sleep_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        ctx.progress.report(Some("echoing"), json!({ "step": 1 }));
        let text = args["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing text".into()))?;
        Ok(ToolOutput::text(format!("echo {text}"), text))
    }
}

/// Always fails with an execution error.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn id(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        Err(ToolError::ExecutionFailed("disk on fire".into()))
    }
}

pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn id(&self) -> &str {
        "panic"
    }

    fn description(&self) -> &str {
        "panics"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        panic!("tool blew up");
    }
}

/// Signals `started`, then waits until its abort signal fires. The signal
/// it was handed is kept so tests can inspect it after the call is dropped.
pub struct BlockingTool {
    pub started: Arc<Notify>,
    pub signal: Arc<Mutex<Option<CancellationToken>>>,
}

impl BlockingTool {
    pub fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
            signal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn signal_fired(&self) -> bool {
        self.signal.lock().as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

#[async_trait]
impl Tool for BlockingTool {
    fn id(&self) -> &str {
        "block"
    }

    fn description(&self) -> &str {
        "waits for cancellation"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        *self.signal.lock() = Some(ctx.abort_signal.clone());
        self.started.notify_one();
        ctx.abort_signal.cancelled().await;
        Err(ToolError::Cancelled)
    }
}

/// Writes its `text` argument to a fixed file.
pub struct WriteFileTool {
    pub path: PathBuf,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn id(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "overwrite the fixture file"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": { "text": { "type": "string" } } })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let text = args["text"].as_str().unwrap_or_default();
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::text("write", format!("wrote {} bytes", text.len())))
    }
}

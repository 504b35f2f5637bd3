//! Tool execution under cancellation, timeout and panic isolation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use colloquy_core::errors::ToolError;
use colloquy_core::ids::{MessageId, SessionId};
use colloquy_core::permission::{PermissionDecision, PermissionPolicy, PermissionRequest};
use colloquy_core::snapshot::{SnapshotCoordinator, SnapshotRef};
use colloquy_core::stream::ToolCallRequest;
use colloquy_core::tools::{ExecutionMode, ProgressReporter, ToolContext, ToolOutput, ToolProgress};

use crate::registry::ToolRegistry;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Per-step context shared by every call the step issues.
#[derive(Clone)]
pub struct InvocationScope {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub abort: CancellationToken,
    pub progress: mpsc::UnboundedSender<ToolProgress>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolFailure {
    /// Captured as tool output; the model sees it and carries on.
    Error(String),
    Cancelled,
    Denied(String),
}

#[derive(Clone, Debug)]
pub struct ToolCallOutcome {
    pub call: ToolCallRequest,
    pub result: Result<ToolOutput, ToolFailure>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    permission: Arc<dyn PermissionPolicy>,
    snapshots: Arc<dyn SnapshotCoordinator>,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(
        registry: Arc<ToolRegistry>,
        permission: Arc<dyn PermissionPolicy>,
        snapshots: Arc<dyn SnapshotCoordinator>,
    ) -> Self {
        Self {
            registry,
            permission,
            snapshots,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Working-tree checkpoint before a step. Failures are non-fatal.
    pub async fn checkpoint(&self, session_id: &SessionId) -> Option<SnapshotRef> {
        match self.snapshots.create(session_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "snapshot failed, continuing without checkpoint");
                None
            }
        }
    }

    /// Run every call of one step. Concurrent tools run in parallel, then
    /// sequential tools one at a time. Outcomes come back in call order.
    pub async fn execute_all(&self, calls: &[ToolCallRequest], scope: &InvocationScope) -> Vec<ToolCallOutcome> {
        let (sequential, concurrent): (Vec<usize>, Vec<usize>) = (0..calls.len()).partition(|&i| {
            self.registry
                .get(&calls[i].tool)
                .is_some_and(|t| t.execution_mode() == ExecutionMode::Sequential)
        });

        let mut slots: Vec<Option<ToolCallOutcome>> = vec![None; calls.len()];

        let parallel = join_all(concurrent.iter().map(|&i| self.execute(&calls[i], scope))).await;
        for (i, outcome) in concurrent.into_iter().zip(parallel) {
            slots[i] = Some(outcome);
        }
        for i in sequential {
            slots[i] = Some(self.execute(&calls[i], scope).await);
        }

        slots.into_iter().flatten().collect()
    }

    #[instrument(skip_all, fields(session_id = %scope.session_id, call_id = %call.call_id, tool = %call.tool))]
    pub async fn execute(&self, call: &ToolCallRequest, scope: &InvocationScope) -> ToolCallOutcome {
        let started_at = Utc::now();
        let result = self.run(call, scope).await;
        if let Err(failure) = &result {
            debug!(?failure, "tool call did not complete");
        }
        ToolCallOutcome {
            call: call.clone(),
            result,
            started_at,
            ended_at: Utc::now(),
        }
    }

    async fn run(&self, call: &ToolCallRequest, scope: &InvocationScope) -> Result<ToolOutput, ToolFailure> {
        if scope.abort.is_cancelled() {
            return Err(ToolFailure::Cancelled);
        }
        let Some(tool) = self.registry.get(&call.tool) else {
            return Err(ToolFailure::Error(format!("unknown tool: {}", call.tool)));
        };

        let request = PermissionRequest {
            session_id: scope.session_id.clone(),
            message_id: scope.message_id.clone(),
            call_id: call.call_id.clone(),
            tool: call.tool.clone(),
            arguments: call.arguments.clone(),
        };
        if let PermissionDecision::Deny { reason } = self.permission.check(&request).await {
            return Err(ToolFailure::Denied(reason));
        }

        let ctx = ToolContext {
            session_id: scope.session_id.clone(),
            message_id: scope.message_id.clone(),
            call_id: call.call_id.clone(),
            abort_signal: scope.abort.child_token(),
            progress: ProgressReporter::new(call.call_id.clone(), scope.progress.clone()),
        };
        let guarded = AssertUnwindSafe(tool.execute(call.arguments.clone(), &ctx)).catch_unwind();

        let outcome = tokio::select! {
            biased;
            () = scope.abort.cancelled() => return Err(ToolFailure::Cancelled),
            outcome = tokio::time::timeout(self.timeout, guarded) => outcome,
        };

        match outcome {
            Ok(Ok(Ok(mut output))) => {
                output.output = truncate_output(output.output, MAX_OUTPUT_BYTES);
                Ok(output)
            }
            Ok(Ok(Err(ToolError::Cancelled))) => Err(ToolFailure::Cancelled),
            Ok(Ok(Err(e))) => Err(ToolFailure::Error(e.to_string())),
            Ok(Err(panic)) => {
                let msg = panic_message(panic.as_ref());
                warn!(panic = %msg, "tool panicked");
                Err(ToolFailure::Error(format!("tool panicked: {msg}")))
            }
            Err(_elapsed) => Err(ToolFailure::Error(ToolError::Timeout(self.timeout).to_string())),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let total = output.len();
    let mut cut = max_bytes;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(&format!("\n[output truncated: {total} bytes total]"));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{AllowAll, ToolRules};
    use crate::snapshot::NoSnapshots;
    use crate::testing::{BlockingTool, EchoTool, FailingTool, PanicTool};
    use colloquy_core::ids::ToolCallId;
    use colloquy_core::tools::Tool;
    use serde_json::json;

    fn invoker(tools: Vec<Arc<dyn Tool>>) -> ToolInvoker {
        let mut registry = ToolRegistry::new();
        for t in tools {
            registry.register(t);
        }
        ToolInvoker::new(Arc::new(registry), Arc::new(AllowAll), Arc::new(NoSnapshots))
    }

    fn scope() -> (InvocationScope, mpsc::UnboundedReceiver<ToolProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scope = InvocationScope {
            session_id: SessionId::new(),
            message_id: MessageId::new(),
            abort: CancellationToken::new(),
            progress: tx,
        };
        (scope, rx)
    }

    fn call(tool: &str, arguments: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest {
            call_id: ToolCallId::new(),
            tool: tool.into(),
            arguments,
        }
    }

    #[tokio::test]
    async fn success_reports_progress() {
        let inv = invoker(vec![Arc::new(EchoTool::named("echo"))]);
        let (scope, mut rx) = scope();
        let c = call("echo", json!({"text": "hi"}));
        let out = inv.execute(&c, &scope).await;
        let output = out.result.unwrap();
        assert_eq!(output.output, "hi");
        assert_eq!(output.title, "echo hi");
        let progress = rx.try_recv().unwrap();
        assert_eq!(progress.call_id, c.call_id);
        assert_eq!(progress.title.as_deref(), Some("echoing"));
    }

    #[tokio::test]
    async fn errors_are_captured() {
        let inv = invoker(vec![Arc::new(FailingTool), Arc::new(EchoTool::named("echo"))]);
        let (scope, _rx) = scope();

        let failed = inv.execute(&call("fail", json!({})), &scope).await;
        assert!(matches!(failed.result, Err(ToolFailure::Error(ref m)) if m.contains("disk on fire")));

        let missing = inv.execute(&call("nope", json!({})), &scope).await;
        assert!(matches!(missing.result, Err(ToolFailure::Error(ref m)) if m.contains("unknown tool")));

        let bad_args = inv.execute(&call("echo", json!({})), &scope).await;
        assert!(matches!(bad_args.result, Err(ToolFailure::Error(ref m)) if m.contains("missing text")));
    }

    #[tokio::test]
    async fn panics_are_isolated() {
        let inv = invoker(vec![Arc::new(PanicTool)]);
        let (scope, _rx) = scope();
        let out = inv.execute(&call("panic", json!({})), &scope).await;
        assert!(matches!(out.result, Err(ToolFailure::Error(ref m)) if m.contains("tool blew up")));
    }

    #[tokio::test]
    async fn timeout_becomes_error() {
        let inv = invoker(vec![Arc::new(EchoTool::named("echo"))]).with_timeout(Duration::from_millis(20));
        let (scope, _rx) = scope();
        let out = inv.execute(&call("echo", json!({"text": "x", "sleep_ms": 5000})), &scope).await;
        assert!(matches!(out.result, Err(ToolFailure::Error(ref m)) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn abort_signal_reaches_tool() {
        let blocking = Arc::new(BlockingTool::new());
        let started = blocking.started.clone();
        let inv = Arc::new(invoker(vec![blocking.clone()]));
        let (scope, _rx) = scope();
        let abort = scope.abort.clone();

        let inv2 = inv.clone();
        let task = tokio::spawn(async move { inv2.execute(&call("block", json!({})), &scope).await });
        started.notified().await;
        abort.cancel();

        let out = task.await.unwrap();
        assert_eq!(out.result, Err(ToolFailure::Cancelled));
        assert!(blocking.signal_fired());
    }

    #[tokio::test]
    async fn denial_short_circuits() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool::named("echo")));
        let inv = ToolInvoker::new(Arc::new(registry), Arc::new(ToolRules::deny(["echo"])), Arc::new(NoSnapshots));
        let (scope, mut rx) = scope();
        let out = inv.execute(&call("echo", json!({"text": "x"})), &scope).await;
        assert!(matches!(out.result, Err(ToolFailure::Denied(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn outcomes_keep_call_order() {
        let inv = invoker(vec![
            Arc::new(EchoTool::named("fast")),
            Arc::new(EchoTool::sequential("seq")),
        ]);
        let (scope, _rx) = scope();
        let calls = vec![
            call("seq", json!({"text": "1"})),
            call("fast", json!({"text": "2", "sleep_ms": 20})),
            call("fast", json!({"text": "3"})),
            call("seq", json!({"text": "4"})),
        ];
        let outcomes = inv.execute_all(&calls, &scope).await;
        let ids: Vec<_> = outcomes.iter().map(|o| o.call.call_id.clone()).collect();
        let expected: Vec<_> = calls.iter().map(|c| c.call_id.clone()).collect();
        assert_eq!(ids, expected);
        let texts: Vec<_> = outcomes.into_iter().map(|o| o.result.unwrap().output).collect();
        assert_eq!(texts, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(10);
        let out = truncate_output(s, 5);
        assert!(out.starts_with("éé"));
        assert!(out.contains("[output truncated: 20 bytes total]"));
        assert_eq!(truncate_output("short".into(), 5), "short");
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use colloquy_core::errors::BackendError;
use colloquy_core::ids::ToolCallId;
use colloquy_core::provider::{EventStream, GenerateRequest, ModelBackend, ModelLimits};
use colloquy_core::stream::{FinishReason, StreamEvent, ToolCallRequest};
use colloquy_core::tokens::TokenUsage;

/// Pre-programmed responses for deterministic testing without a real backend.
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Fail the `stream()` call itself.
    Error(BackendError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Wait until notified, then resolve the inner response.
    Gated(Arc<Notify>, Box<MockResponse>),
    /// Yield the events, then hold the stream open until the request is cancelled.
    Hang(Vec<StreamEvent>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        let usage = TokenUsage {
            input: 10,
            output: (text.len() as u64).div_ceil(4),
            ..Default::default()
        };
        Self::text_with_usage(text, usage)
    }

    pub fn text_with_usage(text: &str, usage: TokenUsage) -> Self {
        Self::Stream(vec![
            StreamEvent::TextDelta { delta: text.to_string() },
            StreamEvent::Finish { usage, reason: FinishReason::Stop },
        ])
    }

    /// A step that requests one tool and ends at a step boundary.
    pub fn tool_call(tool: &str, arguments: serde_json::Value) -> Self {
        Self::tool_calls(vec![(tool, arguments)])
    }

    pub fn tool_calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        let mut events: Vec<StreamEvent> = calls
            .into_iter()
            .map(|(tool, arguments)| StreamEvent::ToolCall {
                call: ToolCallRequest {
                    call_id: ToolCallId::new(),
                    tool: tool.to_string(),
                    arguments,
                },
            })
            .collect();
        events.push(StreamEvent::Finish {
            usage: TokenUsage { input: 10, output: 5, ..Default::default() },
            reason: FinishReason::ToolCalls,
        });
        Self::Stream(events)
    }

    /// A stream that fails after opening.
    pub fn stream_error(error: BackendError) -> Self {
        Self::Stream(vec![StreamEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    pub fn gated(gate: Arc<Notify>, inner: MockResponse) -> Self {
        Self::Gated(gate, Box::new(inner))
    }
}

/// Mock backend that returns pre-programmed responses in sequence and
/// records every request it receives.
pub struct MockBackend {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<GenerateRequest>>,
    call_count: AtomicUsize,
    provider: String,
    limits: ModelLimits,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            provider: "mock".into(),
            limits: ModelLimits { context: 200_000, output: 8_000 },
        }
    }

    pub fn with_limits(mut self, limits: ModelLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = provider.to_string();
        self
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn limits(&self) -> ModelLimits {
        self.limits
    }

    async fn stream(&self, request: &GenerateRequest) -> Result<EventStream, BackendError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let response = self.responses.lock().pop_front().ok_or_else(|| {
            BackendError::InvalidRequest(format!("MockBackend: no response configured for call {idx}"))
        })?;

        resolve_response(response, request).await
    }
}

/// Unrolls nested delays and gates iteratively.
async fn resolve_response(
    response: MockResponse,
    request: &GenerateRequest,
) -> Result<EventStream, BackendError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => current = *inner,
                    _ = request.cancel.cancelled() => return Err(BackendError::Cancelled),
                }
            }
            MockResponse::Gated(gate, inner) => {
                tokio::select! {
                    _ = gate.notified() => current = *inner,
                    _ = request.cancel.cancelled() => return Err(BackendError::Cancelled),
                }
            }
            MockResponse::Hang(events) => {
                let cancel = request.cancel.clone();
                let tail = stream::once(async move {
                    cancel.cancelled().await;
                    StreamEvent::Error { error: BackendError::Cancelled }
                });
                return Ok(Box::pin(stream::iter(events).chain(tail)));
            }
        }
    }
}

//! Drives generations end to end: context assembly, streaming, tool steps,
//! step-boundary queue merging, retries and the permit hand-off.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use colloquy_core::errors::{BackendError, MessageError};
use colloquy_core::events::BusEvent;
use colloquy_core::ids::{SessionId, ToolCallId};
use colloquy_core::message::{ChatInput, MessageInfo, MessageWithParts, Part, PartKind, ToolState};
use colloquy_core::provider::{GenerateRequest, ModelBackend, ModelMessage};
use colloquy_core::session::SessionInfo;
use colloquy_core::stream::{FinishReason, StreamEvent, ToolCallRequest};
use colloquy_core::tokens::TokenUsage;
use colloquy_core::tools::ToolProgress;
use colloquy_llm::{find_model, ProviderKind, RetryPolicy};

use crate::context::{self, ContextManager};
use crate::error::{ChatError, ChatResult, EngineError};
use crate::invoker::{panic_message, InvocationScope, ToolFailure, ToolInvoker};
use crate::journal::Journal;
use crate::prompt;
use crate::registry::ToolFilter;
use crate::serializer::{GenerationPermit, GenerationPhase, RequestSerializer};

const ABORTED_TOOL: &str = "aborted";
const TITLE_OUTPUT_TOKENS: u64 = 64;

#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub retry: RetryPolicy,
    /// Upper bound on model steps within one generation.
    pub max_steps: u32,
    pub generate_titles: bool,
    pub tool_filter: ToolFilter,
    pub working_directory: PathBuf,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_steps: 256,
            generate_titles: true,
            tool_filter: ToolFilter::All,
            working_directory: PathBuf::from("."),
        }
    }
}

struct StepResult {
    usage: TokenUsage,
    reason: FinishReason,
    /// Tool calls paired with the index of their part.
    calls: Vec<(usize, ToolCallRequest)>,
}

pub struct GenerationProcessor {
    backend: Arc<dyn ModelBackend>,
    title_backend: Arc<dyn ModelBackend>,
    invoker: Arc<ToolInvoker>,
    context: Arc<ContextManager>,
    journal: Journal,
    serializer: Arc<RequestSerializer>,
    config: GenerationConfig,
}

impl GenerationProcessor {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        title_backend: Arc<dyn ModelBackend>,
        invoker: Arc<ToolInvoker>,
        context: Arc<ContextManager>,
        journal: Journal,
        serializer: Arc<RequestSerializer>,
        config: GenerationConfig,
    ) -> Self {
        Self {
            backend,
            title_backend,
            invoker,
            context,
            journal,
            serializer,
            config,
        }
    }

    /// Run generations for a session until its queue is drained, then
    /// release the permit and publish `session.idle`.
    #[instrument(skip_all, fields(session_id = %permit.session_id))]
    pub async fn drive(self: Arc<Self>, mut permit: GenerationPermit, mut input: ChatInput) {
        let session_id = permit.session_id.clone();
        loop {
            let outcome = AssertUnwindSafe(self.generate(&permit, input))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    Err(EngineError::Internal(format!("generation panicked: {message}")))
                });

            let result: ChatResult = match &outcome {
                Ok(message) => Ok(message.clone()),
                Err(e) => Err(ChatError::from(e)),
            };
            match &outcome {
                Ok(_) | Err(EngineError::Aborted) | Err(EngineError::Rejected(_)) => {}
                Err(e) => {
                    error!(error = %e, "generation failed");
                    let error = match e {
                        EngineError::Backend(b) => MessageError::from(b),
                        other => MessageError::Internal { message: other.to_string() },
                    };
                    let _ = self.journal.bus().publish(BusEvent::SessionError {
                        session_id: session_id.clone(),
                        error,
                    });
                }
            }

            let release = self.serializer.release(&session_id, permit.cancel.is_cancelled());
            match release.resolve(&result) {
                Some((next, next_input)) => {
                    debug!("starting queued generation");
                    permit = next;
                    input = next_input;
                }
                None => break,
            }
        }
        let _ = self.journal.bus().publish(BusEvent::SessionIdle { session_id });
    }

    async fn generate(&self, permit: &GenerationPermit, input: ChatInput) -> Result<MessageWithParts, EngineError> {
        let session_id = &permit.session_id;
        let cancel = &permit.cancel;

        let session = self
            .journal
            .sessions()
            .get(session_id)
            .map_err(|e| EngineError::session_lookup(session_id, e))?;
        if session.revert.is_some() {
            self.context.trim_for_revert(session_id).await?;
        }

        let limits = self.backend.limits();
        let history = self.context.history(session_id)?;
        let first_message = history.is_empty();
        let prior = context::prior_usage(&history);
        if self.context.should_summarize(&prior, &limits) {
            info!(total = prior.total(), context = limits.context, "context near limit, summarizing");
            self.serializer.set_phase(session_id, GenerationPhase::Summarizing);
            match self.context.summarize(session_id, cancel).await {
                Ok(_) => {}
                Err(EngineError::Aborted) => return Err(EngineError::Aborted),
                Err(e) => warn!(error = %e, "summarization failed, continuing with full history"),
            }
            self.serializer.set_phase(session_id, GenerationPhase::Streaming);
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Aborted);
        }

        let mut extra_system = input.system.clone();
        let user = input.into_message(session_id.clone());
        self.journal.persist_message(&user)?;
        if first_message && !session.is_child() && session.has_default_title() && self.config.generate_titles {
            self.spawn_title(&session, user.text());
        }

        let caps = ProviderKind::from_id(self.backend.provider()).capabilities();
        let mut system = prompt::system_blocks(&caps, &self.config.working_directory, extra_system.as_deref());
        let tools = prompt::adapt_tools(self.invoker.registry().definitions(&self.config.tool_filter), &caps);
        let mut assistant = self.start_assistant(session_id, &system)?;

        for step in 0..self.config.max_steps {
            if cancel.is_cancelled() {
                return self.abort_message(assistant);
            }
            let snapshot = self.invoker.checkpoint(session_id).await;
            let start = Part::new(&assistant.info, PartKind::StepStart { snapshot });
            let _ = self.journal.push_part(&mut assistant, start)?;

            let request = GenerateRequest {
                system: system.clone(),
                messages: context::to_model_messages(&self.context.history(session_id)?),
                tools: tools.clone(),
                max_output_tokens: self.context.reserved_output(&limits),
                temperature: caps.default_temperature,
                cancel: cancel.clone(),
            };
            let outcome = match self.run_step(&request, &mut assistant).await {
                Ok(outcome) => outcome,
                Err(EngineError::Aborted) => return self.abort_message(assistant),
                Err(EngineError::Backend(e)) => {
                    assistant.info.error = Some(MessageError::from(&e));
                    self.journal.save_info(&assistant.info)?;
                    return Err(EngineError::Backend(e));
                }
                Err(e) => return Err(e),
            };

            let mut denied = None;
            if !outcome.calls.is_empty() {
                self.serializer.set_phase(session_id, GenerationPhase::AwaitingTool);
                denied = self.run_tools(&mut assistant, &outcome.calls, cancel).await?;
                self.serializer.set_phase(session_id, GenerationPhase::Streaming);
                if cancel.is_cancelled() {
                    return self.abort_message(assistant);
                }
                if let Some(snapshot) = self.invoker.checkpoint(session_id).await {
                    let part = Part::new(&assistant.info, PartKind::Snapshot { snapshot });
                    let _ = self.journal.push_part(&mut assistant, part)?;
                }
            }
            self.finish_step(&mut assistant, outcome.usage)?;

            if let Some(reason) = denied {
                assistant.info.error = Some(MessageError::Rejected { reason: reason.clone() });
                assistant.info.complete();
                self.journal.save_info(&assistant.info)?;
                return Err(EngineError::Rejected(reason));
            }

            if outcome.calls.is_empty() {
                assistant.info.complete();
                self.journal.save_info(&assistant.info)?;
                return Ok(assistant);
            }
            if !outcome.reason.continues() {
                debug!(reason = ?outcome.reason, "tool calls under a terminal finish reason");
            }

            let merged = self.serializer.take_unprocessed(session_id);
            if !merged.is_empty() {
                debug!(step, merged = merged.len(), "merging queued input at step boundary");
                assistant.info.complete();
                self.journal.save_info(&assistant.info)?;
                let mut added_system = false;
                for mut input in merged {
                    if let Some(extra) = input.system.take() {
                        extra_system = Some(match extra_system.take() {
                            Some(current) => format!("{current}\n\n{extra}"),
                            None => extra,
                        });
                        added_system = true;
                    }
                    self.journal.persist_message(&input.into_message(session_id.clone()))?;
                }
                if added_system {
                    system = prompt::system_blocks(&caps, &self.config.working_directory, extra_system.as_deref());
                }
                assistant = self.start_assistant(session_id, &system)?;
            }
        }

        warn!(max_steps = self.config.max_steps, "step limit reached");
        assistant.info.complete();
        self.journal.save_info(&assistant.info)?;
        Ok(assistant)
    }

    fn start_assistant(&self, session_id: &SessionId, system: &[String]) -> Result<MessageWithParts, EngineError> {
        let info = MessageInfo::assistant(
            session_id.clone(),
            self.backend.provider(),
            self.backend.model(),
            system.to_vec(),
        );
        self.journal.save_info(&info)?;
        Ok(MessageWithParts::new(info))
    }

    /// One step with bounded retries. Parts from a failed attempt are discarded.
    async fn run_step(
        &self,
        request: &GenerateRequest,
        assistant: &mut MessageWithParts,
    ) -> Result<StepResult, EngineError> {
        let keep = assistant.parts.len();
        let mut attempt = 0u32;
        loop {
            let error = match self.stream_step(request, assistant).await {
                Ok(step) => return Ok(step),
                Err(EngineError::Backend(e)) if e.is_transport() && self.config.retry.allows(attempt + 1) => e,
                Err(e) => return Err(e),
            };
            attempt += 1;
            let stale: Vec<Part> = assistant.parts.drain(keep..).collect();
            for part in &stale {
                self.journal.remove_part(part)?;
            }
            let delay = self.config.retry.delay(attempt, error.suggested_delay());
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "transport error, retrying step");
            tokio::select! {
                biased;
                () = request.cancel.cancelled() => return Err(EngineError::Aborted),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn stream_step(
        &self,
        request: &GenerateRequest,
        assistant: &mut MessageWithParts,
    ) -> Result<StepResult, EngineError> {
        let cancel = &request.cancel;
        let mut stream = self
            .backend
            .stream(request)
            .await
            .map_err(|e| backend_failure(e, cancel))?;

        let mut text_part: Option<usize> = None;
        let mut calls = Vec::new();
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(EngineError::Aborted),
                event = stream.next() => event,
            };
            match event {
                Some(StreamEvent::TextDelta { delta }) => match text_part {
                    Some(index) => {
                        let part = &mut assistant.parts[index];
                        if let PartKind::Text { text, .. } = &mut part.kind {
                            text.push_str(&delta);
                        }
                        self.journal.save_part(part)?;
                    }
                    None => {
                        let part = Part::new(&assistant.info, PartKind::Text { text: delta, synthetic: false });
                        text_part = Some(self.journal.push_part(assistant, part)?);
                    }
                },
                Some(StreamEvent::File { mime, url }) => {
                    let part = Part::new(&assistant.info, PartKind::File { mime, url, filename: None });
                    let _ = self.journal.push_part(assistant, part)?;
                    text_part = None;
                }
                Some(StreamEvent::ToolCall { call }) => {
                    let part = Part::new(
                        &assistant.info,
                        PartKind::Tool {
                            call_id: call.call_id.clone(),
                            tool: call.tool.clone(),
                            state: ToolState::Pending {
                                input: call.arguments.clone(),
                            },
                        },
                    );
                    let index = self.journal.push_part(assistant, part)?;
                    calls.push((index, call));
                    text_part = None;
                }
                Some(StreamEvent::Finish { usage, reason }) => return Ok(StepResult { usage, reason, calls }),
                Some(StreamEvent::Error { error }) => return Err(backend_failure(error, cancel)),
                None => {
                    return Err(EngineError::Backend(BackendError::StreamInterrupted(
                        "stream ended without a finish event".into(),
                    )))
                }
            }
        }
    }

    /// Execute the step's tool calls, streaming progress into their parts.
    /// Returns the denial reason if the permission policy refused a call.
    async fn run_tools(
        &self,
        assistant: &mut MessageWithParts,
        calls: &[(usize, ToolCallRequest)],
        cancel: &CancellationToken,
    ) -> Result<Option<String>, EngineError> {
        let started_at = Utc::now();
        for (index, call) in calls {
            set_tool_state(
                &mut assistant.parts[*index],
                ToolState::Running {
                    input: call.arguments.clone(),
                    title: None,
                    metadata: Value::Null,
                    started_at,
                },
            );
            self.journal.save_part(&assistant.parts[*index])?;
        }

        let index: HashMap<ToolCallId, usize> = calls.iter().map(|(i, c)| (c.call_id.clone(), *i)).collect();
        let requests: Vec<ToolCallRequest> = calls.iter().map(|(_, c)| c.clone()).collect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scope = InvocationScope {
            session_id: assistant.info.session_id.clone(),
            message_id: assistant.info.id.clone(),
            abort: cancel.clone(),
            progress: tx,
        };

        let outcomes = {
            let run = self.invoker.execute_all(&requests, &scope);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    outcomes = &mut run => break outcomes,
                    Some(progress) = rx.recv() => self.apply_progress(assistant, &index, progress)?,
                }
            }
        };
        drop(scope);
        while let Ok(progress) = rx.try_recv() {
            self.apply_progress(assistant, &index, progress)?;
        }

        let mut denied = None;
        for outcome in outcomes {
            let Some(&i) = index.get(&outcome.call.call_id) else {
                continue;
            };
            let input = outcome.call.arguments;
            let state = match outcome.result {
                Ok(output) => ToolState::Completed {
                    input,
                    output: output.output,
                    title: output.title,
                    metadata: output.metadata,
                    started_at: outcome.started_at,
                    ended_at: outcome.ended_at,
                },
                Err(failure) => {
                    let error = match failure {
                        ToolFailure::Error(message) => message,
                        ToolFailure::Cancelled => ABORTED_TOOL.to_string(),
                        ToolFailure::Denied(reason) => {
                            let message = format!("permission denied: {reason}");
                            denied = Some(reason);
                            message
                        }
                    };
                    ToolState::Error {
                        input,
                        error,
                        metadata: Value::Null,
                        started_at: outcome.started_at,
                        ended_at: outcome.ended_at,
                    }
                }
            };
            set_tool_state(&mut assistant.parts[i], state);
            self.journal.save_part(&assistant.parts[i])?;
        }
        Ok(denied)
    }

    fn apply_progress(
        &self,
        assistant: &mut MessageWithParts,
        index: &HashMap<ToolCallId, usize>,
        progress: ToolProgress,
    ) -> Result<(), EngineError> {
        let Some(&i) = index.get(&progress.call_id) else {
            return Ok(());
        };
        let part = &mut assistant.parts[i];
        if let PartKind::Tool {
            state: ToolState::Running { title, metadata, .. },
            ..
        } = &mut part.kind
        {
            if progress.title.is_some() {
                *title = progress.title;
            }
            *metadata = progress.metadata;
            self.journal.save_part(part)?;
        }
        Ok(())
    }

    fn finish_step(&self, assistant: &mut MessageWithParts, usage: TokenUsage) -> Result<(), EngineError> {
        let cost = find_model(self.backend.provider(), self.backend.model()).map_or(0.0, |m| m.cost(&usage));
        let part = Part::new(&assistant.info, PartKind::StepFinish { tokens: usage, cost });
        let _ = self.journal.push_part(assistant, part)?;
        assistant.info.tokens = Some(usage);
        assistant.info.cost += cost;
        self.journal.save_info(&assistant.info)?;
        Ok(())
    }

    /// Close out a cancelled message: unfinished tools become errors and
    /// the message keeps no completion time.
    fn abort_message(&self, mut assistant: MessageWithParts) -> Result<MessageWithParts, EngineError> {
        let ended_at = Utc::now();
        for part in &mut assistant.parts {
            let PartKind::Tool { state, .. } = &mut part.kind else {
                continue;
            };
            if state.is_terminal() {
                continue;
            }
            let started_at = match state {
                ToolState::Running { started_at, .. } => *started_at,
                _ => ended_at,
            };
            *state = ToolState::Error {
                input: state.input().clone(),
                error: ABORTED_TOOL.to_string(),
                metadata: Value::Null,
                started_at,
                ended_at,
            };
            self.journal.save_part(part)?;
        }
        assistant.info.error = Some(MessageError::Aborted);
        self.journal.save_info(&assistant.info)?;
        info!(message_id = %assistant.info.id, "generation aborted");
        Err(EngineError::Aborted)
    }

    fn spawn_title(&self, session: &SessionInfo, text: String) {
        let backend = self.title_backend.clone();
        let journal = self.journal.clone();
        let session_id = session.id.clone();
        let _ = tokio::spawn(async move {
            if let Err(e) = generate_title(backend.as_ref(), &journal, &session_id, text).await {
                debug!(session_id = %session_id, error = %e, "title generation failed");
            }
        });
    }
}

async fn generate_title(
    backend: &dyn ModelBackend,
    journal: &Journal,
    session_id: &SessionId,
    text: String,
) -> Result<(), EngineError> {
    let request = GenerateRequest {
        system: vec![prompt::TITLE_PROMPT.trim_end().to_string()],
        messages: vec![ModelMessage::user_text(text)],
        tools: Vec::new(),
        max_output_tokens: TITLE_OUTPUT_TOKENS,
        temperature: None,
        cancel: CancellationToken::new(),
    };
    let mut stream = backend.stream(&request).await?;
    let mut reply = String::new();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::TextDelta { delta } => reply.push_str(&delta),
            StreamEvent::Finish { .. } => break,
            StreamEvent::Error { error } => return Err(error.into()),
            _ => {}
        }
    }
    let Some(title) = prompt::clean_title(&reply) else {
        return Ok(());
    };

    // Re-read: the session may have been renamed or removed meanwhile.
    let mut session = journal.sessions().get(session_id)?;
    if !session.has_default_title() {
        return Ok(());
    }
    session.title = title;
    session.touch();
    journal.save_session(&session)?;
    Ok(())
}

fn set_tool_state(part: &mut Part, new_state: ToolState) {
    if let PartKind::Tool { state, .. } = &mut part.kind {
        *state = new_state;
    }
}

fn backend_failure(error: BackendError, cancel: &CancellationToken) -> EngineError {
    if cancel.is_cancelled() || matches!(error, BackendError::Cancelled) {
        EngineError::Aborted
    } else {
        EngineError::Backend(error)
    }
}

//! Token accounting, summarization and revert trimming.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use colloquy_core::ids::SessionId;
use colloquy_core::message::{MessageInfo, MessageWithParts, Part, PartKind, Role, ToolState};
use colloquy_core::provider::{AssistantContent, GenerateRequest, ModelBackend, ModelLimits, ModelMessage, UserContent};
use colloquy_core::stream::{StreamEvent, ToolCallRequest};
use colloquy_core::tokens::TokenUsage;
use colloquy_llm::find_model;

use crate::error::EngineError;
use crate::journal::Journal;
use crate::prompt::{BASE_PROMPT, SUMMARY_PROMPT};

const INTERRUPTED_TOOL: &str = "[error] tool execution was interrupted";

#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Summarize once prior usage exceeds this share of the usable window.
    pub summarize_at_percent: u64,
    /// Upper bound on the output budget reserved out of the context window.
    pub output_token_max: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            summarize_at_percent: 90,
            output_token_max: 32_000,
        }
    }
}

pub struct ContextManager {
    journal: Journal,
    backend: Arc<dyn ModelBackend>,
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(journal: Journal, backend: Arc<dyn ModelBackend>, config: ContextConfig) -> Self {
        Self { journal, backend, config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Output tokens held back from the context window.
    pub fn reserved_output(&self, limits: &ModelLimits) -> u64 {
        if limits.output == 0 {
            self.config.output_token_max
        } else {
            limits.output.min(self.config.output_token_max)
        }
    }

    /// True when `usage` is strictly above the threshold. A model with an
    /// unknown (zero) context window never summarizes.
    pub fn should_summarize(&self, usage: &TokenUsage, limits: &ModelLimits) -> bool {
        if limits.context == 0 {
            return false;
        }
        let usable = limits.context.saturating_sub(self.reserved_output(limits));
        u128::from(usage.total()) * 100 > u128::from(usable) * u128::from(self.config.summarize_at_percent)
    }

    /// Messages at or after the most recent completed summary.
    pub fn history(&self, session_id: &SessionId) -> Result<Vec<MessageWithParts>, EngineError> {
        let mut messages = self.journal.messages().load(session_id)?;
        if let Some(start) = messages
            .iter()
            .rposition(|m| m.info.summary && m.info.is_completed())
        {
            let _ = messages.drain(..start);
        }
        Ok(messages)
    }

    /// Summarize the history since the last boundary into a new summary message.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn summarize(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<MessageWithParts, EngineError> {
        let history = self.history(session_id)?;
        let mut messages = to_model_messages(&history);
        messages.push(ModelMessage::user_text(SUMMARY_PROMPT));

        let limits = self.backend.limits();
        let request = GenerateRequest {
            system: vec![BASE_PROMPT.trim_end().to_string()],
            messages,
            tools: Vec::new(),
            max_output_tokens: self.reserved_output(&limits),
            temperature: None,
            cancel: cancel.clone(),
        };

        let mut stream = self.backend.stream(&request).await?;
        let mut text = String::new();
        let mut tokens = TokenUsage::default();
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(EngineError::Aborted),
                event = stream.next() => event,
            };
            match event {
                Some(StreamEvent::TextDelta { delta }) => text.push_str(&delta),
                Some(StreamEvent::Finish { usage, .. }) => {
                    tokens = usage;
                    break;
                }
                Some(StreamEvent::Error { error }) => return Err(error.into()),
                Some(_) => {}
                None => break,
            }
        }
        if text.trim().is_empty() {
            return Err(EngineError::Internal("summary generation produced no text".into()));
        }

        let mut info = MessageInfo::assistant(
            session_id.clone(),
            self.backend.provider(),
            self.backend.model(),
            request.system,
        );
        info.summary = true;
        info.tokens = Some(tokens);
        info.cost = find_model(self.backend.provider(), self.backend.model())
            .map_or(0.0, |m| m.cost(&tokens));
        info.complete();

        let mut summary = MessageWithParts::new(info);
        let part = Part::new(&summary.info, PartKind::Text { text, synthetic: false });
        summary.parts.push(part);
        self.journal.persist_message(&summary)?;
        info!(total = tokens.total(), "session summarized");
        Ok(summary)
    }

    /// Apply a pending revert pointer: drop everything after the boundary
    /// and clear the pointer.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn trim_for_revert(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let mut session = self
            .journal
            .sessions()
            .get(session_id)
            .map_err(|e| EngineError::session_lookup(session_id, e))?;
        let Some(pointer) = session.revert.take() else {
            return Ok(());
        };

        let messages = self.journal.messages().load(session_id)?;
        if let Some(index) = messages.iter().position(|m| m.info.id == pointer.message_id) {
            for later in &messages[index + 1..] {
                self.journal.remove_message(session_id, &later.info.id)?;
            }
            let boundary = &messages[index];
            if pointer.part_index == 0 {
                self.journal.remove_message(session_id, &boundary.info.id)?;
            } else {
                for part in boundary.parts.iter().skip(pointer.part_index) {
                    self.journal.remove_part(part)?;
                }
            }
            debug!(removed = messages.len() - index - 1, "history trimmed");
        }

        session.touch();
        self.journal.save_session(&session)?;
        Ok(())
    }
}

/// Token usage recorded on a message.
pub fn usage(info: &MessageInfo) -> TokenUsage {
    info.tokens.unwrap_or_default()
}

/// Usage of the last assistant message. A summary only counts its output
/// since its input was the history it replaced.
pub fn prior_usage(history: &[MessageWithParts]) -> TokenUsage {
    let Some(last) = history.iter().rev().find(|m| m.info.is_assistant()) else {
        return TokenUsage::default();
    };
    let tokens = usage(&last.info);
    if last.info.summary {
        TokenUsage {
            output: tokens.output,
            ..TokenUsage::default()
        }
    } else {
        tokens
    }
}

/// Render stored history as backend messages. Assistant messages are split
/// at step starts so tool results follow the step that requested them.
pub fn to_model_messages(history: &[MessageWithParts]) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    for message in history {
        match message.info.role {
            Role::User => {
                let content: Vec<UserContent> = message
                    .parts
                    .iter()
                    .filter_map(|p| match &p.kind {
                        PartKind::Text { text, .. } if !text.is_empty() => Some(UserContent::Text { text: text.clone() }),
                        PartKind::File { mime, url, .. } => Some(UserContent::File {
                            mime: mime.clone(),
                            url: url.clone(),
                        }),
                        _ => None,
                    })
                    .collect();
                if !content.is_empty() {
                    out.push(ModelMessage::User { content });
                }
            }
            Role::Assistant => {
                let mut step: Vec<&Part> = Vec::new();
                for part in &message.parts {
                    if matches!(part.kind, PartKind::StepStart { .. }) {
                        flush_step(&mut out, &step);
                        step.clear();
                    }
                    step.push(part);
                }
                flush_step(&mut out, &step);
            }
        }
    }
    out
}

fn flush_step(out: &mut Vec<ModelMessage>, parts: &[&Part]) {
    let mut content = Vec::new();
    let mut results = Vec::new();
    for part in parts {
        match &part.kind {
            PartKind::Text { text, .. } if !text.is_empty() => {
                content.push(AssistantContent::Text { text: text.clone() });
            }
            PartKind::Tool { call_id, tool, state } => {
                content.push(AssistantContent::ToolCall(ToolCallRequest {
                    call_id: call_id.clone(),
                    tool: tool.clone(),
                    arguments: state.input().clone(),
                }));
                let (output, is_error) = match state {
                    ToolState::Completed { output, .. } => (output.clone(), false),
                    ToolState::Error { error, .. } => (format!("[error] {error}"), true),
                    ToolState::Pending { .. } | ToolState::Running { .. } => (INTERRUPTED_TOOL.to_string(), true),
                };
                results.push(ModelMessage::ToolResult {
                    call_id: call_id.clone(),
                    tool: tool.clone(),
                    output,
                    is_error,
                });
            }
            _ => {}
        }
    }
    if content.is_empty() {
        return;
    }
    out.push(ModelMessage::Assistant { content });
    out.extend(results);
}

use async_trait::async_trait;
use futures::stream;

use colloquy_core::errors::BackendError;
use colloquy_core::provider::{
    EventStream, GenerateRequest, ModelBackend, ModelLimits, ModelMessage, UserContent,
};
use colloquy_core::stream::{FinishReason, StreamEvent};
use colloquy_core::tokens::TokenUsage;

/// Offline backend that answers with the latest user text. Never calls tools.
pub struct EchoBackend {
    limits: ModelLimits,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self {
            limits: ModelLimits { context: 32_000, output: 4_000 },
        }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Approximation: chars / 4.
pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

fn last_user_text(messages: &[ModelMessage]) -> Option<String> {
    messages.iter().rev().find_map(|m| match m {
        ModelMessage::User { content } => {
            let text: Vec<&str> = content
                .iter()
                .filter_map(|c| match c {
                    UserContent::Text { text } => Some(text.as_str()),
                    UserContent::File { .. } => None,
                })
                .collect();
            (!text.is_empty()).then(|| text.join("\n"))
        }
        _ => None,
    })
}

#[async_trait]
impl ModelBackend for EchoBackend {
    fn provider(&self) -> &str {
        "echo"
    }

    fn model(&self) -> &str {
        "echo-1"
    }

    fn limits(&self) -> ModelLimits {
        self.limits
    }

    async fn stream(&self, request: &GenerateRequest) -> Result<EventStream, BackendError> {
        if request.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let reply = match last_user_text(&request.messages) {
            Some(text) => format!("You said: {text}"),
            None => "Nothing to echo.".to_string(),
        };

        let prompt_chars: usize = request.system.iter().map(String::len).sum::<usize>()
            + request
                .messages
                .iter()
                .map(|m| serde_json::to_string(m).map(|s| s.len()).unwrap_or(0))
                .sum::<usize>();
        let usage = TokenUsage {
            input: (prompt_chars as u64).div_ceil(4),
            output: estimate_text_tokens(&reply),
            ..Default::default()
        };

        Ok(Box::pin(stream::iter(vec![
            StreamEvent::TextDelta { delta: reply },
            StreamEvent::Finish { usage, reason: FinishReason::Stop },
        ])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn echoes_latest_user_text() {
        let request = GenerateRequest {
            system: vec!["be brief".into()],
            messages: vec![ModelMessage::user_text("first"), ModelMessage::user_text("second")],
            tools: vec![],
            max_output_tokens: 100,
            temperature: None,
            cancel: CancellationToken::new(),
        };
        let events: Vec<_> = EchoBackend::new().stream(&request).await.unwrap().collect().await;
        assert!(matches!(&events[0], StreamEvent::TextDelta { delta } if delta == "You said: second"));
        assert!(matches!(&events[1], StreamEvent::Finish { usage, .. } if usage.input > 0));
    }

    #[test]
    fn token_estimate() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::MessageError;
use crate::ids::{MessageId, PartId, SessionId, ToolCallId};
use crate::snapshot::SnapshotRef;
use crate::tokens::TokenUsage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Message header. Parts are stored separately and keyed by message id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub summary: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
}

impl MessageInfo {
    pub fn user(session_id: SessionId) -> Self {
        Self::with_role(session_id, Role::User)
    }

    pub fn assistant(session_id: SessionId, provider: &str, model: &str, system: Vec<String>) -> Self {
        Self {
            system,
            provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            tokens: Some(TokenUsage::default()),
            ..Self::with_role(session_id, Role::Assistant)
        }
    }

    fn with_role(session_id: SessionId, role: Role) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            role,
            system: Vec::new(),
            provider: None,
            model: None,
            tokens: None,
            cost: 0.0,
            summary: false,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn complete(&mut self) {
        self.completed_at.get_or_insert_with(Utc::now);
    }
}

/// One ordered element of a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: PartId,
    pub message_id: MessageId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: PartKind,
}

impl Part {
    pub fn new(message: &MessageInfo, kind: PartKind) -> Self {
        Self {
            id: PartId::new(),
            message_id: message.id.clone(),
            session_id: message.session_id.clone(),
            kind,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            PartKind::Text { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Checkpoint recorded by this part, if it carries one.
    pub fn snapshot(&self) -> Option<&SnapshotRef> {
        match &self.kind {
            PartKind::StepStart { snapshot } => snapshot.as_ref(),
            PartKind::Snapshot { snapshot } => Some(snapshot),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartKind {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        synthetic: bool,
    },
    File {
        mime: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Tool {
        call_id: ToolCallId,
        tool: String,
        state: ToolState,
    },
    StepStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<SnapshotRef>,
    },
    StepFinish {
        tokens: TokenUsage,
        cost: f64,
    },
    Snapshot {
        snapshot: SnapshotRef,
    },
}

/// Lifecycle of a tool call part. `Completed` and `Error` are terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolState {
    Pending {
        input: Value,
    },
    Running {
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        metadata: Value,
        started_at: DateTime<Utc>,
    },
    Completed {
        input: Value,
        output: String,
        title: String,
        #[serde(default)]
        metadata: Value,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    Error {
        input: Value,
        error: String,
        #[serde(default)]
        metadata: Value,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
}

impl ToolState {
    pub fn input(&self) -> &Value {
        match self {
            Self::Pending { input }
            | Self::Running { input, .. }
            | Self::Completed { input, .. }
            | Self::Error { input, .. } => input,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

/// A message header together with its ordered parts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
}

impl MessageWithParts {
    pub fn new(info: MessageInfo) -> Self {
        Self { info, parts: Vec::new() }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::text).collect::<Vec<_>>().join("")
    }
}

/// Caller-supplied content for a new user turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputPart {
    Text { text: String },
    File { mime: String, url: String, filename: Option<String> },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatInput {
    pub parts: Vec<InputPart>,
    /// Extra system instruction appended for this turn only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl ChatInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![InputPart::Text { text: text.into() }],
            system: None,
        }
    }

    /// Rejects input that carries no content.
    pub fn validate(&self) -> Result<(), String> {
        if self.parts.is_empty() {
            return Err("input has no parts".into());
        }
        let has_content = self.parts.iter().any(|p| match p {
            InputPart::Text { text } => !text.trim().is_empty(),
            InputPart::File { url, .. } => !url.is_empty(),
        });
        if !has_content {
            return Err("input parts are empty".into());
        }
        Ok(())
    }

    /// Materialize the input as a fresh user message.
    pub fn into_message(self, session_id: SessionId) -> MessageWithParts {
        let info = MessageInfo::user(session_id);
        let parts = self
            .parts
            .into_iter()
            .map(|p| {
                let kind = match p {
                    InputPart::Text { text } => PartKind::Text { text, synthetic: false },
                    InputPart::File { mime, url, filename } => PartKind::File { mime, url, filename },
                };
                Part::new(&info, kind)
            })
            .collect();
        MessageWithParts { info, parts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn part_serializes_flat_with_type_tag() {
        let info = MessageInfo::user(SessionId::new());
        let part = Part::new(&info, PartKind::Text { text: "hi".into(), synthetic: false });
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hi");
        assert!(json.get("synthetic").is_none());
        let back: Part = serde_json::from_value(json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn tool_state_is_tagged_by_status() {
        let state = ToolState::Pending { input: json!({"path": "a"}) };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(!state.is_terminal());
        assert_eq!(state.input()["path"], "a");
    }

    #[test]
    fn snapshot_accessor() {
        let info = MessageInfo::user(SessionId::new());
        let start = Part::new(&info, PartKind::StepStart { snapshot: Some(SnapshotRef::new("abc")) });
        let text = Part::new(&info, PartKind::Text { text: "x".into(), synthetic: false });
        assert_eq!(start.snapshot().map(SnapshotRef::as_str), Some("abc"));
        assert!(text.snapshot().is_none());
    }

    #[test]
    fn complete_is_idempotent() {
        let mut info = MessageInfo::assistant(SessionId::new(), "mock", "m", vec![]);
        info.complete();
        let first = info.completed_at;
        info.complete();
        assert_eq!(info.completed_at, first);
    }

    #[test]
    fn input_validation() {
        assert!(ChatInput::default().validate().is_err());
        assert!(ChatInput::text("   ").validate().is_err());
        assert!(ChatInput::text("hello").validate().is_ok());
    }

    #[test]
    fn input_into_message_links_parts() {
        let sid = SessionId::new();
        let msg = ChatInput::text("hello").into_message(sid.clone());
        assert_eq!(msg.info.role, Role::User);
        assert_eq!(msg.parts.len(), 1);
        assert_eq!(msg.parts[0].message_id, msg.info.id);
        assert_eq!(msg.parts[0].session_id, sid);
        assert_eq!(msg.text(), "hello");
    }
}

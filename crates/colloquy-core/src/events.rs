use serde::{Deserialize, Serialize};

use crate::errors::MessageError;
use crate::ids::{MessageId, PartId, SessionId};
use crate::message::{MessageInfo, Part};
use crate::session::SessionInfo;

/// Notifications fanned out on the event bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated { info: SessionInfo },

    #[serde(rename = "session.deleted")]
    SessionDeleted { info: SessionInfo },

    #[serde(rename = "session.idle")]
    SessionIdle { session_id: SessionId },

    #[serde(rename = "session.error")]
    SessionError {
        session_id: SessionId,
        error: MessageError,
    },

    #[serde(rename = "message.updated")]
    MessageUpdated { info: MessageInfo },

    #[serde(rename = "message.removed")]
    MessageRemoved {
        session_id: SessionId,
        message_id: MessageId,
    },

    #[serde(rename = "message.part.updated")]
    PartUpdated { part: Part },

    #[serde(rename = "message.part.removed")]
    PartRemoved {
        session_id: SessionId,
        message_id: MessageId,
        part_id: PartId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionUpdated,
    SessionDeleted,
    SessionIdle,
    SessionError,
    MessageUpdated,
    MessageRemoved,
    PartUpdated,
    PartRemoved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionUpdated => "session.updated",
            Self::SessionDeleted => "session.deleted",
            Self::SessionIdle => "session.idle",
            Self::SessionError => "session.error",
            Self::MessageUpdated => "message.updated",
            Self::MessageRemoved => "message.removed",
            Self::PartUpdated => "message.part.updated",
            Self::PartRemoved => "message.part.removed",
        }
    }
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionUpdated { .. } => EventKind::SessionUpdated,
            Self::SessionDeleted { .. } => EventKind::SessionDeleted,
            Self::SessionIdle { .. } => EventKind::SessionIdle,
            Self::SessionError { .. } => EventKind::SessionError,
            Self::MessageUpdated { .. } => EventKind::MessageUpdated,
            Self::MessageRemoved { .. } => EventKind::MessageRemoved,
            Self::PartUpdated { .. } => EventKind::PartUpdated,
            Self::PartRemoved { .. } => EventKind::PartRemoved,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionUpdated { info } | Self::SessionDeleted { info } => &info.id,
            Self::MessageUpdated { info } => &info.session_id,
            Self::PartUpdated { part } => &part.session_id,
            Self::SessionIdle { session_id }
            | Self::SessionError { session_id, .. }
            | Self::MessageRemoved { session_id, .. }
            | Self::PartRemoved { session_id, .. } => session_id,
        }
    }
}

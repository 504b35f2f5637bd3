//! Key layout. Keys are `/`-separated segments; ids sort by creation time,
//! so `list` under a prefix yields records in creation order.

use colloquy_core::ids::{MessageId, PartId, SessionId};

use crate::error::StoreError;

pub const SESSION_INFO: &str = "session/info";

pub fn session(id: &SessionId) -> String {
    format!("{SESSION_INFO}/{id}")
}

pub fn messages(session_id: &SessionId) -> String {
    format!("session/message/{session_id}")
}

pub fn message(session_id: &SessionId, message_id: &MessageId) -> String {
    format!("session/message/{session_id}/{message_id}")
}

pub fn parts(message_id: &MessageId) -> String {
    format!("session/part/{message_id}")
}

pub fn part(message_id: &MessageId, part_id: &PartId) -> String {
    format!("session/part/{message_id}/{part_id}")
}

/// Last segment of a key.
pub fn leaf(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Keys must be non-empty relative paths without `.` or `..` segments.
pub fn validate(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|s| s.is_empty() || s == "." || s == "..");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

//! Persist-then-publish helpers. Every mutation of a session, message or
//! part goes through here so the store and the bus never disagree.

use colloquy_core::events::BusEvent;
use colloquy_core::ids::{MessageId, SessionId};
use colloquy_core::message::{MessageInfo, MessageWithParts, Part};
use colloquy_core::session::SessionInfo;
use colloquy_store::{MessageRepo, SessionRepo, Store, StoreError};

use crate::bus::EventBus;

#[derive(Clone)]
pub struct Journal {
    sessions: SessionRepo,
    messages: MessageRepo,
    bus: EventBus,
}

impl Journal {
    pub fn new(store: Store, bus: EventBus) -> Self {
        Self {
            sessions: SessionRepo::new(store.clone()),
            messages: MessageRepo::new(store),
            bus,
        }
    }

    pub fn sessions(&self) -> &SessionRepo {
        &self.sessions
    }

    pub fn messages(&self) -> &MessageRepo {
        &self.messages
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn save_session(&self, info: &SessionInfo) -> Result<(), StoreError> {
        self.sessions.put(info)?;
        let _ = self.bus.publish(BusEvent::SessionUpdated { info: info.clone() });
        Ok(())
    }

    pub fn save_info(&self, info: &MessageInfo) -> Result<(), StoreError> {
        self.messages.put_info(info)?;
        let _ = self.bus.publish(BusEvent::MessageUpdated { info: info.clone() });
        Ok(())
    }

    pub fn save_part(&self, part: &Part) -> Result<(), StoreError> {
        self.messages.put_part(part)?;
        let _ = self.bus.publish(BusEvent::PartUpdated { part: part.clone() });
        Ok(())
    }

    /// Append `part` to `message` and persist it.
    pub fn push_part(&self, message: &mut MessageWithParts, part: Part) -> Result<usize, StoreError> {
        self.save_part(&part)?;
        message.parts.push(part);
        Ok(message.parts.len() - 1)
    }

    /// Persist a whole message, header first.
    pub fn persist_message(&self, message: &MessageWithParts) -> Result<(), StoreError> {
        self.save_info(&message.info)?;
        for part in &message.parts {
            self.save_part(part)?;
        }
        Ok(())
    }

    pub fn remove_message(&self, session_id: &SessionId, message_id: &MessageId) -> Result<(), StoreError> {
        self.messages.remove(session_id, message_id)?;
        let _ = self.bus.publish(BusEvent::MessageRemoved {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
        });
        Ok(())
    }

    pub fn remove_part(&self, part: &Part) -> Result<(), StoreError> {
        self.messages.remove_part(part)?;
        let _ = self.bus.publish(BusEvent::PartRemoved {
            session_id: part.session_id.clone(),
            message_id: part.message_id.clone(),
            part_id: part.id.clone(),
        });
        Ok(())
    }
}
